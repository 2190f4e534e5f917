use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection parameters of one candidate, as sent to the boundary service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProbeTarget {
    pub server: String,
    pub port: u16,
    pub secret: String,
}

/// A validated candidate endpoint. Only the parser constructs these.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    #[serde(flatten)]
    target: ProbeTarget,
    original: String,
}

impl Descriptor {
    pub(crate) fn new(target: ProbeTarget, original: String) -> Self {
        Self { target, original }
    }

    pub fn target(&self) -> &ProbeTarget {
        &self.target
    }

    pub fn server(&self) -> &str {
        &self.target.server
    }

    pub fn port(&self) -> u16 {
        self.target.port
    }

    pub fn secret(&self) -> &str {
        &self.target.secret
    }

    /// The link text this descriptor was parsed from (trimmed and normalized).
    pub fn original(&self) -> &str {
        &self.original
    }
}

/// Outcome of a single probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Working { latency_ms: u64 },
    Failed,
}

impl ProbeResult {
    pub fn is_working(&self) -> bool {
        matches!(self, ProbeResult::Working { .. })
    }

    pub fn latency_ms(&self) -> Option<u64> {
        match self {
            ProbeResult::Working { latency_ms } => Some(*latency_ms),
            ProbeResult::Failed => None,
        }
    }
}

/// Wire form of a [`ProbeResult`]: `{"ok":true,"ping":120}` or `{"ok":false}`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<u64>,
}

impl From<ProbeResult> for CheckResponse {
    fn from(result: ProbeResult) -> Self {
        Self {
            ok: result.is_working(),
            ping: result.latency_ms(),
        }
    }
}

/// One working candidate in the ranked output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkingEntry {
    pub link: String,
    pub ping_ms: u64,
}

/// Progress counters of a run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub total: u64,
    pub completed: u64,
    pub working: u64,
    pub skipped: u64,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Status: {} / {} | Working: {}",
            self.completed, self.total, self.working
        )
    }
}
