//! Turning a watchdog response into a task verdict.

use judge_common::{Severity, TestCase};
use std::fmt;

use crate::matcher;
use crate::watchdog::WatchdogResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Build,
    Judge,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Build => "build",
            Phase::Judge => "judge",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expected output loaded from the job's resource directory.
#[derive(Debug, Clone, Default)]
pub struct Expected {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Classify one task. `exit_code` is the program's exit code; a missing exit
/// code never reaches this point.
///
/// A build task that should fail but succeeds is RE, while the same mismatch
/// on a judge task is WA.
pub fn classify(
    phase: Phase,
    task: &TestCase,
    response: &WatchdogResponse,
    exit_code: i64,
    expected: &Expected,
) -> Severity {
    let mut verdict = Severity::AC;

    if response.ole {
        verdict = verdict.max(Severity::OLE);
    }
    if response.mle {
        verdict = verdict.max(Severity::MLE);
    }
    if response.tle {
        verdict = verdict.max(Severity::TLE);
    }

    if !task.ignore_exit {
        if task.exit_code == 0 && exit_code != 0 {
            verdict = verdict.max(match phase {
                Phase::Build => Severity::CE,
                Phase::Judge => Severity::RE,
            });
        }
        if task.exit_code != 0 && exit_code == 0 {
            verdict = verdict.max(match phase {
                Phase::Build => Severity::RE,
                Phase::Judge => Severity::WA,
            });
        }
    }

    if phase == Phase::Judge {
        if let Some(want) = &expected.stdout {
            if !matcher::matches(want, &response.stdout) {
                verdict = verdict.max(Severity::WA);
            }
        }
        if let Some(want) = &expected.stderr {
            if !matcher::matches(want, &response.stderr) {
                verdict = verdict.max(Severity::WA);
            }
        }
    }

    verdict
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(exit_code: i64, ignore_exit: bool) -> TestCase {
        TestCase {
            id: 1,
            command: "./main".to_string(),
            exit_code,
            ignore_exit,
            ..Default::default()
        }
    }

    fn response(stdout: &str) -> WatchdogResponse {
        WatchdogResponse {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_clean_run_is_accepted() {
        let expected = Expected {
            stdout: Some("3".to_string()),
            stderr: None,
        };
        let verdict = classify(Phase::Judge, &task(0, false), &response("3\n"), 0, &expected);
        assert_eq!(verdict, Severity::AC);
    }

    #[test]
    fn test_build_nonzero_exit_is_compile_error() {
        let verdict = classify(Phase::Build, &task(0, false), &response(""), 1, &Expected::default());
        assert_eq!(verdict, Severity::CE);
    }

    #[test]
    fn test_judge_nonzero_exit_is_runtime_error() {
        let verdict = classify(Phase::Judge, &task(0, false), &response(""), 139, &Expected::default());
        assert_eq!(verdict, Severity::RE);
    }

    #[test]
    fn test_expected_failure_that_succeeds() {
        assert_eq!(
            classify(Phase::Build, &task(1, false), &response(""), 0, &Expected::default()),
            Severity::RE
        );
        assert_eq!(
            classify(Phase::Judge, &task(1, false), &response(""), 0, &Expected::default()),
            Severity::WA
        );
    }

    #[test]
    fn test_ignore_exit_skips_exit_checks() {
        let verdict = classify(Phase::Build, &task(0, true), &response(""), 2, &Expected::default());
        assert_eq!(verdict, Severity::AC);
    }

    #[test]
    fn test_limit_flags_combine_by_max() {
        let mut resp = response("");
        resp.tle = true;
        resp.mle = true;
        assert_eq!(classify(Phase::Judge, &task(0, false), &resp, 0, &Expected::default()), Severity::MLE);

        resp.ole = true;
        assert_eq!(classify(Phase::Judge, &task(0, false), &resp, 0, &Expected::default()), Severity::OLE);
    }

    #[test]
    fn test_output_mismatch_is_wrong_answer() {
        let expected = Expected {
            stdout: Some("3".to_string()),
            stderr: Some("".to_string()),
        };
        let verdict = classify(Phase::Judge, &task(0, false), &response("4"), 0, &expected);
        assert_eq!(verdict, Severity::WA);

        let mut resp = response("3");
        resp.stderr = "warning".to_string();
        assert_eq!(classify(Phase::Judge, &task(0, false), &resp, 0, &expected), Severity::WA);
    }

    #[test]
    fn test_build_phase_never_compares_output() {
        let expected = Expected {
            stdout: Some("something else".to_string()),
            stderr: None,
        };
        let verdict = classify(Phase::Build, &task(0, false), &response("3"), 0, &expected);
        assert_eq!(verdict, Severity::AC);
    }
}
