use serde::{Deserialize, Serialize};

/// One line of the operator-facing event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts_unix_ms: i64,
    pub message: String,
}
