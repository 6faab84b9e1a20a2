use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProbeError;

/// A host to probe: an IPv4 literal or a resolvable hostname.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct Target(String);

impl Target {
    pub fn new(host: impl Into<String>) -> Self {
        Target(host.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for Target {
    fn from(s: &str) -> Self {
        Target(s.to_string())
    }
}

impl From<String> for Target {
    fn from(s: String) -> Self {
        Target(s)
    }
}

/// Result of one (target, port) connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Open,
    /// No connection: refused, reset, unreachable or timed out.
    Closed,
    Error(ProbeError),
}

impl ProbeOutcome {
    pub fn is_open(&self) -> bool {
        matches!(self, ProbeOutcome::Open)
    }

    pub fn flag(&self) -> ResponseFlag {
        match self {
            ProbeOutcome::Open => ResponseFlag::Yes,
            ProbeOutcome::Closed => ResponseFlag::No,
            ProbeOutcome::Error(_) => ResponseFlag::Error,
        }
    }
}

/// Response column of the full-scan log.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFlag {
    #[serde(rename = "Y")]
    Yes,
    #[serde(rename = "N")]
    No,
    #[serde(rename = "E")]
    Error,
}

impl ResponseFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseFlag::Yes => "Y",
            ResponseFlag::No => "N",
            ResponseFlag::Error => "E",
        }
    }
}

/// One row of the full-scan log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanRecord {
    pub target: Target,
    pub port: u16,
    pub timestamp: String,
    pub response: ResponseFlag,
}

/// Where the scheduler is. Published on a watch channel while scanning.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case", tag = "state", content = "batch")]
pub enum ScanState {
    #[default]
    Idle,
    BatchInProgress(usize),
    BatchComplete(usize),
    AllBatchesComplete,
    Cancelled,
    Failed,
}

/// Aggregate counters for a finished (or stopped) scan.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub batches_total: usize,
    pub batches_completed: usize,
    pub probes: u64,
    pub open: u64,
    pub closed: u64,
    pub errors: u64,
    pub state: ScanState,
    pub elapsed_ms: u64,
}
