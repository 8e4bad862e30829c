//! Session lifecycle: Stopped -> Running -> Stopped.
//!
//! One OS thread reads and processes frames sequentially. Three locks are in
//! play and are always taken in the order processor -> state, never the
//! reverse; the capture lock is only held around a read or a source swap.
//! Stopping is cooperative: the worker checks `running` once per frame.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use park_layout::{LayoutCatalog, Region, RegionStore};
use park_proto::stats::StatsSnapshot;
use park_vision::{CountingParams, DetectionMode, Frame, FrameProcessor, MlConfig, MlDetector, VisionError};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::sink::EventSink;
use crate::source::{FrameSource, SourceFactory};
use crate::state::{SessionDefaults, SessionState};
use crate::{now_unix_ms, SessionError};

/// State, active regions and the last annotated frame, behind one lock.
pub struct Shared {
    pub state: SessionState,
    pub regions: Arc<[Region]>,
    pub latest: Option<Frame>,
}

pub type StateHandle = Arc<Mutex<Shared>>;

type Capture = Arc<Mutex<Option<Box<dyn FrameSource>>>>;

/// A panicked holder leaves plain data behind; keep using it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds ML detectors on demand, seeded with the current confidence.
pub trait DetectorFactory: Send + Sync {
    fn create(&self, confidence: f32) -> Result<MlDetector, VisionError>;
}

impl<F> DetectorFactory for F
where
    F: Fn(f32) -> Result<MlDetector, VisionError> + Send + Sync,
{
    fn create(&self, confidence: f32) -> Result<MlDetector, VisionError> {
        self(confidence)
    }
}

/// Detectors from the `[ml]` config section.
pub struct ConfigDetectorFactory(pub MlConfig);

impl DetectorFactory for ConfigDetectorFactory {
    fn create(&self, confidence: f32) -> Result<MlDetector, VisionError> {
        let cfg = MlConfig { confidence, ..self.0.clone() };
        MlDetector::from_config(&cfg)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Upper bound on processed frames per second; unset runs as fast as the source delivers.
    pub max_fps: Option<f32>,
    pub annotate: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { max_fps: None, annotate: true }
    }
}

pub struct SessionController {
    shared: StateHandle,
    capture: Capture,
    processor: Arc<Mutex<FrameProcessor>>,
    worker: Option<JoinHandle<()>>,

    layouts: LayoutCatalog,
    sources: Arc<dyn SourceFactory>,
    detectors: Arc<dyn DetectorFactory>,
    events: Arc<dyn EventSink>,
    cfg: ControllerConfig,
    shut_down: bool,
}

impl SessionController {
    pub fn new(
        mut processor: FrameProcessor,
        layouts: LayoutCatalog,
        sources: Arc<dyn SourceFactory>,
        detectors: Arc<dyn DetectorFactory>,
        events: Arc<dyn EventSink>,
        defaults: &SessionDefaults,
        cfg: ControllerConfig,
    ) -> Self {
        processor.set_annotate(cfg.annotate);
        let mut state = SessionState::new(defaults);
        state.use_ml_detection = false;
        state.reference = layouts.references().default_reference().to_string();

        let mut ctl = Self {
            shared: Arc::new(Mutex::new(Shared { state, regions: Arc::from(Vec::new()), latest: None })),
            capture: Arc::new(Mutex::new(None)),
            processor: Arc::new(Mutex::new(processor)),
            worker: None,
            layouts,
            sources,
            detectors,
            events,
            cfg,
            shut_down: false,
        };
        if defaults.use_ml_detection {
            ctl.set_ml_detection(true);
        }
        ctl
    }

    pub fn state_handle(&self) -> StateHandle {
        self.shared.clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared).state.running
    }

    pub fn snapshot(&self) -> SessionState {
        lock(&self.shared).state.clone()
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        lock(&self.shared).state.to_snapshot(now_unix_ms())
    }

    pub fn status_text(&self) -> String {
        lock(&self.shared).state.status_text()
    }

    pub fn regions(&self) -> Arc<[Region]> {
        lock(&self.shared).regions.clone()
    }

    /// Last annotated frame, if annotation is on and a frame was processed.
    pub fn latest_frame(&self) -> Option<Frame> {
        lock(&self.shared).latest.clone()
    }

    /// Opens `source_id`, switches to its layout and starts the frame loop.
    /// On any error the session stays stopped.
    pub fn start(&mut self, source_id: &str) -> Result<(), SessionError> {
        if self.is_running() {
            return Err(SessionError::Running);
        }
        // a loop that ended on its own still needs joining
        self.join_worker();

        let store = self.layouts.load_for_source(source_id)?;
        let dims = self.layouts.references().dimensions(store.reference());
        let source = match self.sources.open(source_id, dims) {
            Ok(s) => s,
            Err(e) => {
                self.events.record(&format!("Failed to open video source {source_id}: {e}"));
                return Err(e);
            }
        };

        replace_source(&self.capture, Some(source));
        lock(&self.processor).reset();
        {
            let mut g = lock(&self.shared);
            apply_store(&mut g, &store);
            g.state.source = Some(source_id.to_string());
            g.state.running = true;
        }

        let worker = Worker {
            shared: self.shared.clone(),
            capture: self.capture.clone(),
            processor: self.processor.clone(),
            events: self.events.clone(),
            pace: self.cfg.max_fps.filter(|f| *f > 0.0).map(|f| Duration::from_secs_f32(1.0 / f)),
        };
        let spawned = std::thread::Builder::new().name("parkwatch-frames".into()).spawn(move || worker.run());
        match spawned {
            Ok(handle) => self.worker = Some(handle),
            Err(e) => {
                lock(&self.shared).state.running = false;
                replace_source(&self.capture, None);
                return Err(SessionError::source_failed(source_id, format!("spawn frame loop: {e}")));
            }
        }

        info!("session: started on {} ({} spaces)", source_id, store.len());
        self.events.record(&format!("Detection started on {source_id}"));
        Ok(())
    }

    /// Signals the loop, waits for it and releases the source. Repeatable.
    pub fn stop(&mut self) {
        let was_running = {
            let mut g = lock(&self.shared);
            std::mem::replace(&mut g.state.running, false)
        };
        self.join_worker();
        replace_source(&self.capture, None);
        if was_running {
            info!("session: stopped");
            self.events.record("Detection stopped");
        }
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("session: frame loop panicked");
            }
        }
    }

    /// Zeroes the vehicle counter, per-region results and tracker state.
    pub fn reset(&mut self) -> Result<(), SessionError> {
        let mut processor = lock(&self.processor);
        let mut g = lock(&self.shared);
        if g.state.running {
            return Err(SessionError::Running);
        }
        processor.reset();
        g.state.reset_counters();
        g.latest = None;
        drop(g);
        drop(processor);
        self.events.record("Counters reset");
        Ok(())
    }

    pub fn set_mode(&self, mode: DetectionMode) {
        lock(&self.shared).state.detection_mode = mode;
        self.events.record(&format!("Switched to {mode} detection mode"));
    }

    /// Turns ML fusion on or off and returns the effective setting. A detector
    /// that fails to initialise leaves ML off; classical detection carries on.
    pub fn set_ml_detection(&mut self, on: bool) -> bool {
        let effective = if on { self.ensure_detector() } else { false };
        lock(&self.shared).state.use_ml_detection = effective;
        self.events.record(&format!("ML detection: {}", if effective { "On" } else { "Off" }));
        effective
    }

    fn ensure_detector(&mut self) -> bool {
        if lock(&self.processor).has_detector() {
            return true;
        }
        let confidence = lock(&self.shared).state.ml_confidence;
        // model loading can take a while; keep the frame loop unblocked
        match self.detectors.create(confidence) {
            Ok(detector) => {
                lock(&self.processor).install_detector(detector);
                true
            }
            Err(e) => {
                warn!("session: ML detector init failed: {}", e);
                self.events.record(&format!("Failed to initialize ML detector: {e}"));
                false
            }
        }
    }

    /// Clamped to the control range and pushed to the live detector.
    pub fn set_ml_confidence(&self, v: f32) -> f32 {
        let mut processor = lock(&self.processor);
        let clamped = lock(&self.shared).state.set_ml_confidence(v);
        if let Some(d) = processor.detector_mut() {
            d.set_confidence(clamped);
        }
        debug!("session: ml confidence {:.2}", clamped);
        clamped
    }

    pub fn set_parking_threshold(&self, v: u32) -> u32 {
        lock(&self.shared).state.set_parking_threshold(v)
    }

    pub fn set_frame_skip(&self, v: u32) -> u32 {
        lock(&self.shared).state.set_frame_skip(v)
    }

    pub fn set_counting(&self, params: CountingParams) {
        lock(&self.shared).state.counting = params;
    }

    /// Loads the layout for `source_id`. While running the source itself is
    /// swapped under the capture lock so no read is in flight.
    pub fn switch_source(&mut self, source_id: &str) -> Result<(), SessionError> {
        let store = self.layouts.load_for_source(source_id)?;

        if self.is_running() {
            let dims = self.layouts.references().dimensions(store.reference());
            let source = self.sources.open(source_id, dims)?;
            replace_source(&self.capture, Some(source));
            lock(&self.processor).reset();
        }
        {
            let mut g = lock(&self.shared);
            apply_store(&mut g, &store);
            g.state.source = Some(source_id.to_string());
            g.latest = None;
        }
        self.events.record(&format!("Switched video source to {source_id}"));
        Ok(())
    }

    /// Stops the session and releases the detector. Also runs on drop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.stop();
        lock(&self.processor).release_detector();
        self.shut_down = true;
        info!("session: shut down");
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn apply_store(g: &mut Shared, store: &RegionStore) {
    g.state.apply_layout(store);
    g.regions = store.shared();
}

/// Swaps the capture handle, releasing whatever it held.
fn replace_source(capture: &Capture, next: Option<Box<dyn FrameSource>>) {
    let prev = std::mem::replace(&mut *lock(capture), next);
    if let Some(mut src) = prev {
        src.release();
    }
}

struct Worker {
    shared: StateHandle,
    capture: Capture,
    processor: Arc<Mutex<FrameProcessor>>,
    events: Arc<dyn EventSink>,
    pace: Option<Duration>,
}

impl Worker {
    fn run(self) {
        debug!("session: frame loop up");
        loop {
            let started = Instant::now();
            let (settings, regions) = {
                let g = lock(&self.shared);
                if !g.state.running {
                    break;
                }
                (g.state.frame_settings(), g.regions.clone())
            };

            let read = match lock(&self.capture).as_mut() {
                Some(src) => src.read(),
                None => Ok(None),
            };

            match read {
                Ok(Some(frame)) => self.process(&frame, &settings, regions),
                Ok(None) => {
                    self.finish("End of video stream");
                    break;
                }
                Err(SessionError::TransientFrame(reason)) => {
                    debug!("session: {}", reason);
                    lock(&self.shared).state.frames_dropped += 1;
                }
                Err(e) => {
                    warn!("session: {}", e);
                    self.finish(&format!("Video source error: {e}"));
                    break;
                }
            }

            if let Some(pace) = self.pace {
                std::thread::sleep(pace.saturating_sub(started.elapsed()));
            }
        }
        debug!("session: frame loop down");
    }

    fn process(&self, frame: &Frame, settings: &park_vision::FrameSettings, regions: Arc<[Region]>) {
        let mut processor = lock(&self.processor);
        let result = processor.process(frame, settings, &regions);
        let mut g = lock(&self.shared);
        g.state.frames_processed += 1;
        match result.mode {
            DetectionMode::Parking => {
                if let Some(occupancy) = result.occupancy {
                    if Arc::ptr_eq(&g.regions, &regions) {
                        g.state.apply_occupancy(occupancy);
                    } else {
                        debug!("session: layout switched mid-frame, dropping pass");
                    }
                }
            }
            DetectionMode::Vehicle => g.state.add_vehicles(result.vehicle_delta),
        }
        if result.annotated.is_some() {
            g.latest = result.annotated;
        }
    }

    /// The loop ended on its own: flip to Stopped and release the source here.
    fn finish(&self, message: &str) {
        lock(&self.shared).state.running = false;
        replace_source(&self.capture, None);
        info!("session: {}", message);
        self.events.record(message);
    }
}
