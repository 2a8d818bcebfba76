use crate::identity::UnitIdentity;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Finished,
    Cached,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::Finished => "finished",
            RunStatus::Cached => "cached",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one bundle run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub bundle_index: usize,
    pub units: Vec<UnitIdentity>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub elapsed_secs: f64,
}

impl ExecutionResult {
    pub fn failed(bundle_index: usize, units: Vec<UnitIdentity>, message: impl Into<String>) -> Self {
        Self {
            bundle_index,
            units,
            status: RunStatus::Failed,
            message: Some(message.into()),
            elapsed_secs: 0.0,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }
}

/// Count of results per status, in the order the statuses are declared.
pub fn status_counts(results: &[ExecutionResult]) -> Vec<(RunStatus, usize)> {
    [
        RunStatus::Started,
        RunStatus::Finished,
        RunStatus::Cached,
        RunStatus::Failed,
    ]
    .into_iter()
    .map(|status| (status, results.iter().filter(|r| r.status == status).count()))
    .collect()
}
