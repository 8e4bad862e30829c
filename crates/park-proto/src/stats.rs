use serde::{Deserialize, Serialize};

/// Periodic session snapshot, one JSON line per record in the statistics log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub ts_unix_ms: i64,
    pub source: Option<String>,
    pub reference: String,
    pub mode: String,
    pub running: bool,
    pub total_spaces: u32,
    pub free_spaces: u32,
    pub occupied_spaces: u32,
    pub vehicle_counter: u64,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    // ML
    pub use_ml_detection: bool,
    pub ml_confidence: f32,
}

impl StatsSnapshot {
    /// Share of free spaces in percent, `None` for an empty layout.
    pub fn free_ratio_pct(&self) -> Option<f32> {
        if self.total_spaces == 0 {
            return None;
        }
        Some(self.free_spaces as f32 * 100.0 / self.total_spaces as f32)
    }
}
