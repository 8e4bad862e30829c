use park_layout::RegionStore;
use park_proto::stats::StatsSnapshot;
use park_vision::occupancy::tally;
use park_vision::{CountingParams, DetectionMode, FrameSettings, OccupancyResult};
use serde::Deserialize;

pub const ML_CONFIDENCE_RANGE: (f32, f32) = (0.1, 0.9);
pub const PARKING_THRESHOLD_RANGE: (u32, u32) = (100, 1000);

/// Startup values for the operator controls.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionDefaults {
    pub mode: DetectionMode,
    pub use_ml_detection: bool,
    pub ml_confidence: f32,
    pub parking_threshold: u32,
    pub frame_skip: u32,
    pub counting: CountingParams,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            mode: DetectionMode::Parking,
            use_ml_detection: false,
            ml_confidence: 0.6,
            parking_threshold: 500,
            frame_skip: 3,
            counting: CountingParams::default(),
        }
    }
}

/// Everything the control surface polls. Guarded by one lock together with
/// the active regions, so counts are never observed half-updated.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub running: bool,
    pub total_spaces: u32,
    pub free_spaces: u32,
    pub occupied_spaces: u32,
    pub vehicle_counter: u64,
    pub detection_mode: DetectionMode,
    pub use_ml_detection: bool,
    pub ml_confidence: f32,
    pub parking_threshold: u32,
    pub frame_skip: u32,
    pub counting: CountingParams,

    pub source: Option<String>,
    pub reference: String,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub last_results: Vec<OccupancyResult>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(&SessionDefaults::default())
    }
}

impl SessionState {
    pub fn new(d: &SessionDefaults) -> Self {
        Self {
            running: false,
            total_spaces: 0,
            free_spaces: 0,
            occupied_spaces: 0,
            vehicle_counter: 0,
            detection_mode: d.mode,
            use_ml_detection: d.use_ml_detection,
            ml_confidence: clamp_confidence(d.ml_confidence),
            parking_threshold: clamp_threshold(d.parking_threshold),
            frame_skip: d.frame_skip.max(1),
            counting: d.counting,
            source: None,
            reference: String::new(),
            frames_processed: 0,
            frames_dropped: 0,
            last_results: Vec::new(),
        }
    }

    /// A fresh layout counts every space occupied until the first pass.
    pub fn apply_layout(&mut self, store: &RegionStore) {
        self.reference = store.reference().to_string();
        self.total_spaces = store.len() as u32;
        self.free_spaces = 0;
        self.occupied_spaces = self.total_spaces;
        self.last_results.clear();
    }

    pub fn apply_occupancy(&mut self, results: Vec<OccupancyResult>) {
        let (free, occupied) = tally(&results);
        self.total_spaces = results.len() as u32;
        self.free_spaces = free;
        self.occupied_spaces = occupied;
        self.last_results = results;
    }

    pub fn add_vehicles(&mut self, delta: u32) {
        self.vehicle_counter = self.vehicle_counter.saturating_add(u64::from(delta));
    }

    /// Zeroes the vehicle counter and forgets per-region results.
    pub fn reset_counters(&mut self) {
        self.vehicle_counter = 0;
        self.last_results.clear();
        self.free_spaces = 0;
        self.occupied_spaces = self.total_spaces;
        self.frames_processed = 0;
        self.frames_dropped = 0;
    }

    pub fn set_ml_confidence(&mut self, v: f32) -> f32 {
        self.ml_confidence = clamp_confidence(v);
        self.ml_confidence
    }

    pub fn set_parking_threshold(&mut self, v: u32) -> u32 {
        self.parking_threshold = clamp_threshold(v);
        self.parking_threshold
    }

    pub fn set_frame_skip(&mut self, v: u32) -> u32 {
        self.frame_skip = v.max(1);
        self.frame_skip
    }

    pub fn frame_settings(&self) -> FrameSettings {
        FrameSettings {
            mode: self.detection_mode,
            use_ml: self.use_ml_detection,
            parking_threshold: self.parking_threshold,
            frame_skip: self.frame_skip,
            counting: self.counting,
        }
    }

    pub fn status_text(&self) -> String {
        format!(
            "Total Spaces: {}\nFree Spaces: {}\nOccupied: {}\nVehicles Counted: {}",
            self.total_spaces, self.free_spaces, self.occupied_spaces, self.vehicle_counter
        )
    }

    pub fn to_snapshot(&self, ts_unix_ms: i64) -> StatsSnapshot {
        StatsSnapshot {
            ts_unix_ms,
            source: self.source.clone(),
            reference: self.reference.clone(),
            mode: self.detection_mode.to_string(),
            running: self.running,
            total_spaces: self.total_spaces,
            free_spaces: self.free_spaces,
            occupied_spaces: self.occupied_spaces,
            vehicle_counter: self.vehicle_counter,
            frames_processed: self.frames_processed,
            frames_dropped: self.frames_dropped,
            use_ml_detection: self.use_ml_detection,
            ml_confidence: self.ml_confidence,
        }
    }
}

fn clamp_confidence(v: f32) -> f32 {
    if v.is_nan() {
        return 0.6;
    }
    v.clamp(ML_CONFIDENCE_RANGE.0, ML_CONFIDENCE_RANGE.1)
}

fn clamp_threshold(v: u32) -> u32 {
    v.clamp(PARKING_THRESHOLD_RANGE.0, PARKING_THRESHOLD_RANGE.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use park_layout::Region;

    fn store(n: u32) -> RegionStore {
        let regions = (0..n).map(|i| Region::new(i, i as i32 * 20, 0, 10, 10)).collect();
        RegionStore::new("carParkImg.png", regions).unwrap()
    }

    fn result(id: u32, occupied: bool) -> OccupancyResult {
        OccupancyResult { region_id: id, occupied, pixel_count: if occupied { 900 } else { 10 } }
    }

    #[test]
    fn defaults_match_control_panel() {
        let s = SessionState::default();
        assert!(!s.running);
        assert_eq!(s.detection_mode, DetectionMode::Parking);
        assert!(!s.use_ml_detection);
        assert_eq!(s.ml_confidence, 0.6);
        assert_eq!(s.parking_threshold, 500);
        assert_eq!(s.frame_skip, 3);
        assert_eq!(s.counting.line_height, 400);
    }

    #[test]
    fn fresh_layout_is_all_occupied() {
        let mut s = SessionState::default();
        s.apply_layout(&store(4));
        assert_eq!((s.total_spaces, s.free_spaces, s.occupied_spaces), (4, 0, 4));
        assert_eq!(s.reference, "carParkImg.png");
    }

    #[test]
    fn occupancy_pass_keeps_totals_consistent() {
        let mut s = SessionState::default();
        s.apply_layout(&store(3));
        s.apply_occupancy(vec![result(0, true), result(1, false), result(2, false)]);
        assert_eq!((s.total_spaces, s.free_spaces, s.occupied_spaces), (3, 2, 1));
        assert_eq!(s.total_spaces, s.free_spaces + s.occupied_spaces);
    }

    #[test]
    fn controls_are_clamped() {
        let mut s = SessionState::default();
        assert_eq!(s.set_ml_confidence(0.05), 0.1);
        assert_eq!(s.set_ml_confidence(0.95), 0.9);
        assert_eq!(s.set_ml_confidence(0.45), 0.45);
        assert_eq!(s.set_parking_threshold(20), 100);
        assert_eq!(s.set_parking_threshold(5000), 1000);
        assert_eq!(s.set_frame_skip(0), 1);
        assert_eq!(s.set_frame_skip(8), 8);
    }

    #[test]
    fn status_text_layout() {
        let mut s = SessionState::default();
        s.apply_layout(&store(2));
        s.apply_occupancy(vec![result(0, true), result(1, false)]);
        s.add_vehicles(3);
        assert_eq!(s.status_text(), "Total Spaces: 2\nFree Spaces: 1\nOccupied: 1\nVehicles Counted: 3");
    }

    #[test]
    fn reset_zeroes_counter_and_results() {
        let mut s = SessionState::default();
        s.apply_layout(&store(2));
        s.apply_occupancy(vec![result(0, false), result(1, false)]);
        s.add_vehicles(5);
        s.reset_counters();
        assert_eq!(s.vehicle_counter, 0);
        assert!(s.last_results.is_empty());
        assert_eq!(s.total_spaces, s.free_spaces + s.occupied_spaces);
    }

    #[test]
    fn snapshot_mirrors_state() {
        let mut s = SessionState::default();
        s.source = Some("carPark.mp4".into());
        s.apply_layout(&store(2));
        s.add_vehicles(1);
        let snap = s.to_snapshot(42);
        assert_eq!(snap.ts_unix_ms, 42);
        assert_eq!(snap.mode, "parking");
        assert_eq!(snap.total_spaces, 2);
        assert_eq!(snap.vehicle_counter, 1);
        assert_eq!(snap.source.as_deref(), Some("carPark.mp4"));
    }
}
