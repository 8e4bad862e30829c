use std::sync::Arc;

use park_layout::Region;
use tracing::{debug, warn};

use crate::cadence::InferenceCadence;
use crate::occupancy::OccupancyConfig;
use crate::tracker::TrackerConfig;
use crate::{annotate, CountingParams, DetectionBox, DetectionMode, Frame, ImageOps, MlDetector, OccupancyEngine, OccupancyResult, TrackedPoint, VehicleTracker};

/// Knobs read from the session once per frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSettings {
    pub mode: DetectionMode,
    pub use_ml: bool,
    pub parking_threshold: u32,
    pub frame_skip: u32,
    pub counting: CountingParams,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            mode: DetectionMode::Parking,
            use_ml: false,
            parking_threshold: crate::occupancy::DEFAULT_THRESHOLD,
            frame_skip: 3,
            counting: CountingParams::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FrameResult {
    pub mode: DetectionMode,
    /// Set in parking mode only.
    pub occupancy: Option<Vec<OccupancyResult>>,
    pub vehicle_delta: u32,
    pub active_points: Vec<TrackedPoint>,
    /// Boxes in effect for this frame, fresh or carried over from the last inference.
    pub detections: Vec<DetectionBox>,
    pub ml_ran: bool,
    pub annotated: Option<Frame>,
}

/// Runs one frame through the classical pipeline of the active mode and
/// fuses in ML boxes on the frame-skip cadence.
pub struct FrameProcessor {
    occupancy: OccupancyEngine,
    tracker: VehicleTracker,
    detector: Option<MlDetector>,
    cadence: InferenceCadence,
    last_boxes: Vec<DetectionBox>,
    last_mode: Option<DetectionMode>,
    annotate: bool,
}

impl FrameProcessor {
    pub fn new(ops: Arc<dyn ImageOps>, occupancy: OccupancyConfig, tracker: TrackerConfig) -> Self {
        Self {
            occupancy: OccupancyEngine::new(ops.clone(), occupancy),
            tracker: VehicleTracker::new(tracker, ops),
            detector: None,
            cadence: InferenceCadence::new(1),
            last_boxes: Vec::new(),
            last_mode: None,
            annotate: true,
        }
    }

    pub fn set_annotate(&mut self, on: bool) {
        self.annotate = on;
    }

    /// Replaces the detector; the previous one is released first.
    pub fn install_detector(&mut self, detector: MlDetector) {
        self.release_detector();
        self.detector = Some(detector);
        self.cadence.reset();
    }

    pub fn release_detector(&mut self) {
        if let Some(mut d) = self.detector.take() {
            d.release();
        }
        self.last_boxes.clear();
    }

    pub fn has_detector(&self) -> bool {
        self.detector.is_some()
    }

    pub fn detector_mut(&mut self) -> Option<&mut MlDetector> {
        self.detector.as_mut()
    }

    /// Clears tracked points, cached boxes and the inference phase.
    pub fn reset(&mut self) {
        self.tracker.reset();
        self.last_boxes.clear();
        self.cadence.reset();
    }

    pub fn process(&mut self, frame: &Frame, settings: &FrameSettings, regions: &[Region]) -> FrameResult {
        if self.last_mode != Some(settings.mode) {
            // background model from another mode is stale
            self.tracker.reset();
            self.last_mode = Some(settings.mode);
        }
        self.cadence.set_every_n(settings.frame_skip);

        let (ml_active, fresh) = self.run_ml(frame, settings.use_ml);
        let mut result = FrameResult { mode: settings.mode, ml_ran: fresh.is_some(), ..FrameResult::default() };

        match settings.mode {
            DetectionMode::Parking => {
                let mut occupancy = self.occupancy.evaluate(frame, regions, settings.parking_threshold);
                if ml_active {
                    mark_boxed_regions(&mut occupancy, regions, &self.last_boxes);
                }
                result.occupancy = Some(occupancy);
            }
            DetectionMode::Vehicle => {
                let mut centroids = self.tracker.centroids(frame, &settings.counting);
                if let Some(boxes) = &fresh {
                    let max_d = self.tracker.config().max_match_distance;
                    merge_box_centres(&mut centroids, boxes, max_d);
                }
                let update = self.tracker.update_centroids(&centroids, &settings.counting);
                result.vehicle_delta = update.delta;
                result.active_points = update.points;
            }
        }

        if ml_active {
            result.detections = self.last_boxes.clone();
        }
        if self.annotate {
            result.annotated = Some(self.draw(frame, settings, regions, &result));
        }
        result
    }

    /// `(ml_active, fresh boxes if inference ran on this frame)`.
    fn run_ml(&mut self, frame: &Frame, use_ml: bool) -> (bool, Option<Vec<DetectionBox>>) {
        let Some(detector) = self.detector.as_mut().filter(|_| use_ml) else {
            self.cadence.reset();
            self.last_boxes.clear();
            return (false, None);
        };
        if !self.cadence.tick_should_infer() {
            return (true, None);
        }
        match detector.detect(frame) {
            Ok(boxes) => {
                debug!("processor: inference returned {} boxes", boxes.len());
                self.last_boxes = boxes.clone();
                (true, Some(boxes))
            }
            Err(e) => {
                warn!("processor: inference failed: {}", e);
                self.last_boxes.clear();
                (true, Some(Vec::new()))
            }
        }
    }

    fn draw(&self, frame: &Frame, settings: &FrameSettings, regions: &[Region], result: &FrameResult) -> Frame {
        let mut out = frame.clone();
        match settings.mode {
            DetectionMode::Parking => {
                annotate::regions(&mut out, regions, result.occupancy.as_deref().unwrap_or_default());
            }
            DetectionMode::Vehicle => {
                annotate::counting_line(&mut out, settings.counting.line_height);
                annotate::points(&mut out, &result.active_points);
            }
        }
        annotate::boxes(&mut out, &result.detections);
        out
    }
}

fn mark_boxed_regions(occupancy: &mut [OccupancyResult], regions: &[Region], boxes: &[DetectionBox]) {
    for (result, region) in occupancy.iter_mut().zip(regions) {
        if !result.occupied {
            result.occupied = boxes.iter().any(|b| {
                let (cx, cy) = b.centre();
                region.contains(cx, cy)
            });
        }
    }
}

/// Adds box centres that no contour centroid already accounts for.
fn merge_box_centres(centroids: &mut Vec<(f32, f32)>, boxes: &[DetectionBox], max_d: f32) {
    let contour_count = centroids.len();
    for b in boxes {
        let (bx, by) = b.centre();
        let covered = centroids[..contour_count]
            .iter()
            .any(|&(x, y)| (x - bx).powi(2) + (y - by).powi(2) <= max_d * max_d);
        if !covered {
            centroids.push((bx, by));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_ops::ScalarOps;
    use crate::{DetectorBackend, VisionError};
    use image::Rgb;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        calls: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
        boxes: Vec<DetectionBox>,
        fail: bool,
    }

    impl DetectorBackend for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn infer(&mut self, _frame: &Frame, _min: f32) -> Result<Vec<DetectionBox>, VisionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(VisionError::Inference("boom".into()));
            }
            Ok(self.boxes.clone())
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fixed(releases: &Arc<AtomicUsize>) -> MlDetector {
        let backend = Fixed { calls: Arc::default(), releases: releases.clone(), boxes: vec![], fail: false };
        MlDetector::new(Box::new(backend), 0.6, vec!["car".into()])
    }

    fn car_at(cx: f32, cy: f32) -> DetectionBox {
        DetectionBox { x: cx - 20.0, y: cy - 10.0, width: 40.0, height: 20.0, confidence: 0.9, class_label: "car".into() }
    }

    fn processor(boxes: Vec<DetectionBox>, fail: bool) -> (FrameProcessor, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut p = FrameProcessor::new(Arc::new(ScalarOps), OccupancyConfig::default(), TrackerConfig::default());
        let backend = Fixed { calls: calls.clone(), releases: Arc::default(), boxes, fail };
        p.install_detector(MlDetector::new(Box::new(backend), 0.6, vec!["car".into()]));
        (p, calls)
    }

    fn blank() -> Frame {
        Frame::from_pixel(200, 120, Rgb([128, 128, 128]))
    }

    fn parking(use_ml: bool, frame_skip: u32) -> FrameSettings {
        FrameSettings { mode: DetectionMode::Parking, use_ml, frame_skip, ..FrameSettings::default() }
    }

    #[test]
    fn inference_runs_once_per_skip_window() {
        let (mut p, calls) = processor(vec![], false);
        let ran: Vec<bool> = (0..10).map(|_| p.process(&blank(), &parking(true, 3), &[]).ml_ran).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(ran, vec![true, false, false, true, false, false, true, false, false, true]);
    }

    #[test]
    fn ml_off_never_calls_detector() {
        let (mut p, calls) = processor(vec![car_at(10.0, 10.0)], false);
        for _ in 0..5 {
            let r = p.process(&blank(), &parking(false, 1), &[]);
            assert!(r.detections.is_empty());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cached_boxes_keep_space_occupied_on_skipped_frames() {
        let (mut p, calls) = processor(vec![car_at(40.0, 40.0)], false);
        let regions = [Region::new(1, 10, 10, 60, 60), Region::new(2, 100, 10, 60, 60)];
        for _ in 0..3 {
            let r = p.process(&blank(), &parking(true, 3), &regions);
            let occ = r.occupancy.unwrap();
            assert!(occ[0].occupied);
            assert_eq!(occ[0].pixel_count, 0);
            assert!(!occ[1].occupied);
            assert_eq!(r.detections.len(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // without ML only pixels count
        let r = p.process(&blank(), &parking(false, 3), &regions);
        assert!(r.occupancy.unwrap().iter().all(|o| !o.occupied));
    }

    #[test]
    fn inference_error_means_no_boxes() {
        let (mut p, calls) = processor(vec![car_at(40.0, 40.0)], true);
        let regions = [Region::new(1, 10, 10, 60, 60)];
        let r = p.process(&blank(), &parking(true, 1), &regions);
        assert!(r.ml_ran);
        assert!(r.detections.is_empty());
        assert!(!r.occupancy.unwrap()[0].occupied);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn vehicle_mode_adds_unmatched_box_centres() {
        let (mut p, _) = processor(vec![car_at(60.0, 398.0)], false);
        let settings = FrameSettings { mode: DetectionMode::Vehicle, use_ml: true, frame_skip: 1, ..FrameSettings::default() };
        let frame = Frame::from_pixel(200, 480, Rgb([0, 0, 0]));
        let r = p.process(&frame, &settings, &[]);
        assert!(r.occupancy.is_none());
        assert_eq!(r.active_points.len(), 1);
        assert_eq!((r.active_points[0].x, r.active_points[0].y), (60.0, 398.0));
    }

    #[test]
    fn box_centre_near_contour_is_not_duplicated() {
        let mut centroids = vec![(100.0, 400.0)];
        merge_box_centres(&mut centroids, &[car_at(110.0, 405.0), car_at(300.0, 400.0)], 50.0);
        assert_eq!(centroids, vec![(100.0, 400.0), (300.0, 400.0)]);
    }

    #[test]
    fn annotation_is_optional() {
        let (mut p, _) = processor(vec![], false);
        assert!(p.process(&blank(), &parking(false, 1), &[]).annotated.is_some());
        p.set_annotate(false);
        assert!(p.process(&blank(), &parking(false, 1), &[]).annotated.is_none());
    }

    #[test]
    fn replacing_detector_releases_previous() {
        let mut p = FrameProcessor::new(Arc::new(ScalarOps), OccupancyConfig::default(), TrackerConfig::default());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        p.install_detector(fixed(&first));
        p.install_detector(fixed(&second));
        assert!(p.has_detector());
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        p.release_detector();
        p.release_detector();
        assert!(!p.has_detector());
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
