use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Result severity of a task, a job, or a request.
///
/// Variants are ordered from best to worst. Combining two outcomes always
/// keeps the worse one (see [`Severity::max`]), so the verdict of a job is the
/// fold of every task verdict it produced.
///
/// `Judging` and `WJ` (waiting for judge) are placeholders the web layer shows
/// while a request is still in flight; the executor never produces them.
///
/// Serialized as the integer ordinal, which is what the request tables store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum Severity {
    /// Accepted
    #[default]
    AC = 0,
    /// Wrong answer
    WA = 1,
    /// Time limit exceeded
    TLE = 2,
    /// Memory limit exceeded
    MLE = 3,
    /// Runtime error
    RE = 4,
    /// Compile error
    CE = 5,
    /// Output limit exceeded
    OLE = 6,
    /// Internal error
    IE = 7,
    /// File not found
    FN = 8,
    Judging = 9,
    /// Waiting for judge
    WJ = 10,
}

impl Severity {
    pub const ALL: [Severity; 11] = [
        Severity::AC,
        Severity::WA,
        Severity::TLE,
        Severity::MLE,
        Severity::RE,
        Severity::CE,
        Severity::OLE,
        Severity::IE,
        Severity::FN,
        Severity::Judging,
        Severity::WJ,
    ];

    /// Keep the worse of two outcomes. `AC` is the identity.
    pub fn max(self, other: Severity) -> Severity {
        std::cmp::max(self, other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::AC => "AC",
            Severity::WA => "WA",
            Severity::TLE => "TLE",
            Severity::MLE => "MLE",
            Severity::RE => "RE",
            Severity::CE => "CE",
            Severity::OLE => "OLE",
            Severity::IE => "IE",
            Severity::FN => "FN",
            Severity::Judging => "Judging",
            Severity::WJ => "WJ",
        }
    }
}

impl From<Severity> for i64 {
    fn from(value: Severity) -> Self {
        value as i64
    }
}

impl TryFrom<i64> for Severity {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Severity::ALL
            .iter()
            .copied()
            .find(|s| *s as i64 == value)
            .ok_or_else(|| format!("unknown severity ordinal: {}", value))
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job queue state machine.
///
/// `Pending -> Fetched -> Processing -> {Done | Failed}`. `Fetched` marks a job
/// claimed by the dispatcher but not yet started by a worker, which lets stale
/// reclamation tell "claimed but never started" apart from "crashed mid-run".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Fetched,
    Processing,
    Done,
    Failed,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 5] = [
        QueueStatus::Pending,
        QueueStatus::Fetched,
        QueueStatus::Processing,
        QueueStatus::Done,
        QueueStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Fetched => "fetched",
            QueueStatus::Processing => "processing",
            QueueStatus::Done => "done",
            QueueStatus::Failed => "failed",
        }
    }

}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueStatus::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown queue status: {}", s))
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
