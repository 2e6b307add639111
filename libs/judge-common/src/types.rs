use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::status::{QueueStatus, Severity};

/// The request a job was created for.
///
/// Validation and grading requests live in different tables on the web side,
/// so the variant carries everything needed to route a finished result back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "request_type", rename_all = "lowercase")]
pub enum RequestRef {
    Validation { request_id: i64 },
    Grading { request_id: i64 },
}

impl RequestRef {
    pub fn request_id(&self) -> i64 {
        match self {
            RequestRef::Validation { request_id } | RequestRef::Grading { request_id } => {
                *request_id
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RequestRef::Validation { .. } => "validation",
            RequestRef::Grading { .. } => "grading",
        }
    }
}

impl fmt::Display for RequestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.request_id())
    }
}

/// One build or judge command with its expected outcome.
/// Immutable once the job is created.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestCase {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(rename = "eval_only", default)]
    pub evaluation: bool,
    /// Paths relative to the job's resource directory.
    #[serde(rename = "stdin", default, skip_serializing_if = "Option::is_none")]
    pub stdin_path: Option<String>,
    #[serde(rename = "stdout", default, skip_serializing_if = "Option::is_none")]
    pub stdout_path: Option<String>,
    #[serde(rename = "stderr", default, skip_serializing_if = "Option::is_none")]
    pub stderr_path: Option<String>,
    #[serde(rename = "exit", default)]
    pub exit_code: i64,
    #[serde(default)]
    pub ignore_exit: bool,
}

fn non_empty(path: &Option<String>) -> Option<&str> {
    path.as_deref().filter(|p| !p.is_empty())
}

impl TestCase {
    pub fn stdin(&self) -> Option<&str> {
        non_empty(&self.stdin_path)
    }

    pub fn expected_stdout(&self) -> Option<&str> {
        non_empty(&self.stdout_path)
    }

    pub fn expected_stderr(&self) -> Option<&str> {
        non_empty(&self.stderr_path)
    }
}

/// Everything the executor needs to run one job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobDetail {
    pub time_ms: u64,
    pub memory_mb: u64,
    /// Auxiliary files, relative to `resource_dir`, staged next to the submission.
    #[serde(default)]
    pub test_files: Vec<String>,
    /// Problem resources: test files, stdin files, expected outputs. Read only.
    #[serde(default)]
    pub resource_dir: String,
    /// Submitted source files. Read only.
    pub file_dir: String,
    /// Where per-task stdout/stderr artifacts are written.
    pub result_dir: String,
    #[serde(rename = "build", default)]
    pub build_tasks: Vec<TestCase>,
    #[serde(rename = "judge", default)]
    pub judge_tasks: Vec<TestCase>,
}

/// A row of the job queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobQueue {
    pub id: i64,
    #[serde(flatten)]
    pub request: RequestRef,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    /// When the job entered its current status.
    pub updated_at: DateTime<Utc>,
    pub detail: JobDetail,
}

/// Insertion payload for the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    #[serde(flatten)]
    pub request: RequestRef,
    pub detail: JobDetail,
}

/// Outcome of a single executed test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLog {
    pub test_case_id: i64,
    pub result_id: Severity,
    #[serde(rename = "timeMS")]
    pub time_ms: i64,
    #[serde(rename = "memoryKB")]
    pub memory_kb: i64,
    #[serde(rename = "exitCode")]
    pub exit_code: i64,
    #[serde(rename = "stdoutPath")]
    pub stdout_path: String,
    #[serde(rename = "stderrPath")]
    pub stderr_path: String,
}

impl TaskLog {
    /// Sentinel entry recorded when a task could not be judged because the
    /// sandbox itself failed.
    pub fn internal_error(test_case_id: i64) -> Self {
        Self {
            test_case_id,
            result_id: Severity::IE,
            time_ms: 0,
            memory_kb: 0,
            exit_code: -1,
            stdout_path: String::new(),
            stderr_path: String::new(),
        }
    }
}

/// Build and judge logs of one job plus their summary.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestLog {
    pub result_id: Severity,
    pub time_ms: i64,
    pub memory_kb: i64,
    pub build_results: Vec<TaskLog>,
    pub judge_results: Vec<TaskLog>,
}

impl RequestLog {
    /// Summary fields are per-field maxima over every task of both phases.
    pub fn from_task_logs(build_results: Vec<TaskLog>, judge_results: Vec<TaskLog>) -> Self {
        let mut time_ms = 0;
        let mut memory_kb = 0;
        let mut result_id = Severity::AC;

        for log in build_results.iter().chain(judge_results.iter()) {
            time_ms = time_ms.max(log.time_ms);
            memory_kb = memory_kb.max(log.memory_kb);
            result_id = result_id.max(log.result_id);
        }

        Self {
            result_id,
            time_ms,
            memory_kb,
            build_results,
            judge_results,
        }
    }

    pub fn task_count(&self) -> usize {
        self.build_results.len() + self.judge_results.len()
    }
}

/// Result payload stored in the result queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultDetail {
    pub time_ms: i64,
    pub memory_kb: i64,
    pub result_id: Severity,
    pub log: RequestLog,
}

impl From<RequestLog> for ResultDetail {
    fn from(log: RequestLog) -> Self {
        Self {
            time_ms: log.time_ms,
            memory_kb: log.memory_kb,
            result_id: log.result_id,
            log,
        }
    }
}

/// A row of the result queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultQueue {
    pub id: i64,
    pub job_id: i64,
    pub created_at: DateTime<Utc>,
    pub result: ResultDetail,
}

/// A result waiting to be drained, with the job it belongs to.
/// `job` is `None` when the job row has already been removed.
#[derive(Debug, Clone)]
pub struct PendingResult {
    pub result: ResultQueue,
    pub job: Option<JobQueue>,
}
