use serde::Deserialize;
use tracing::{debug, info};

use crate::{DetectionBox, Frame, OutputLayout, VisionError};

/// A learned object detector. Boxes are in the pixel space of `frame`.
pub trait DetectorBackend: Send {
    fn name(&self) -> &str;

    fn infer(&mut self, frame: &Frame, min_confidence: f32) -> Result<Vec<DetectionBox>, VisionError>;

    /// Frees accelerator memory. Called at most once per backend.
    fn release(&mut self) {}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MlConfig {
    pub backend: String,
    pub use_coral: bool,
    pub model_path: String,
    pub model_path_edgetpu: String,
    pub threads: u32,

    pub img_w: u32,
    pub img_h: u32,
    pub class_names: Vec<String>,
    /// Labels reported to the session; everything else is dropped.
    pub vehicle_classes: Vec<String>,

    pub confidence: f32,
    pub nms_iou_threshold: f32,
    pub max_detections: usize,
    pub output_layout: OutputLayout,
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            backend: "tflite".into(),
            use_coral: false,
            model_path: "models/yolov8n_int8.tflite".into(),
            model_path_edgetpu: "models/yolov8n_int8_edgetpu.tflite".into(),
            threads: 2,
            img_w: 640,
            img_h: 640,
            class_names: COCO_CLASSES.iter().map(|s| s.to_string()).collect(),
            vehicle_classes: ["car", "motorcycle", "bus", "truck"].iter().map(|s| s.to_string()).collect(),
            confidence: 0.6,
            nms_iou_threshold: 0.45,
            max_detections: 100,
            output_layout: OutputLayout::default(),
        }
    }
}

/// Vehicle detector with a mutable confidence threshold.
///
/// Owns its backend exclusively; [`MlDetector::release`] hands accelerator
/// memory back and is safe to repeat. Dropping the detector releases too.
pub struct MlDetector {
    backend: Option<Box<dyn DetectorBackend>>,
    confidence: f32,
    keep_classes: Vec<String>,
}

impl MlDetector {
    pub fn new(backend: Box<dyn DetectorBackend>, confidence: f32, keep_classes: Vec<String>) -> Self {
        Self { backend: Some(backend), confidence: confidence.clamp(0.0, 1.0), keep_classes }
    }

    /// Builds the configured backend. Fails when the weights are missing or
    /// the runtime was not compiled in; callers fall back to classical detection.
    pub fn from_config(cfg: &MlConfig) -> Result<Self, VisionError> {
        let backend: Box<dyn DetectorBackend> = match cfg.backend.as_str() {
            #[cfg(feature = "ml-tflite")]
            "tflite" => Box::new(crate::tflite::TfliteBackend::new(cfg.clone())?),
            #[cfg(not(feature = "ml-tflite"))]
            "tflite" => {
                return Err(VisionError::DetectorInit("built without the ml-tflite feature".into()));
            }
            other => return Err(VisionError::DetectorInit(format!("unknown ml backend: {other}"))),
        };
        info!("ml: {} backend ready (confidence {:.2})", backend.name(), cfg.confidence);
        Ok(Self::new(backend, cfg.confidence, cfg.vehicle_classes.clone()))
    }

    pub fn name(&self) -> &str {
        self.backend.as_ref().map_or("released", |b| b.name())
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn set_confidence(&mut self, confidence: f32) {
        self.confidence = confidence.clamp(0.0, 1.0);
    }

    /// Vehicle boxes at or above the current confidence threshold.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionBox>, VisionError> {
        let Some(backend) = self.backend.as_mut() else {
            return Err(VisionError::Inference("detector released".into()));
        };
        let threshold = self.confidence;
        let mut boxes = backend.infer(frame, threshold)?;
        boxes.retain(|b| b.confidence >= threshold && self.keeps(&b.class_label));
        debug!("ml: {} vehicle boxes", boxes.len());
        Ok(boxes)
    }

    fn keeps(&self, label: &str) -> bool {
        self.keep_classes.is_empty() || self.keep_classes.iter().any(|c| c == label)
    }

    pub fn release(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.release();
            info!("ml: released {} backend", backend.name());
        }
    }

    pub fn is_released(&self) -> bool {
        self.backend.is_none()
    }
}

impl Drop for MlDetector {
    fn drop(&mut self) {
        self.release();
    }
}

const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Canned {
        boxes: Vec<DetectionBox>,
        released: Arc<AtomicUsize>,
    }

    impl DetectorBackend for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        fn infer(&mut self, _frame: &Frame, _min: f32) -> Result<Vec<DetectionBox>, VisionError> {
            Ok(self.boxes.clone())
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn det(label: &str, confidence: f32) -> DetectionBox {
        DetectionBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0, confidence, class_label: label.into() }
    }

    fn detector(released: Arc<AtomicUsize>) -> MlDetector {
        let boxes = vec![det("car", 0.9), det("car", 0.5), det("person", 0.95), det("truck", 0.7)];
        MlDetector::new(Box::new(Canned { boxes, released }), 0.6, MlConfig::default().vehicle_classes)
    }

    #[test]
    fn filters_by_confidence_and_class() {
        let mut d = detector(Arc::default());
        let frame = Frame::new(4, 4);
        let labels: Vec<String> = d.detect(&frame).unwrap().into_iter().map(|b| b.class_label).collect();
        assert_eq!(labels, vec!["car", "truck"]);

        d.set_confidence(0.8);
        assert_eq!(d.detect(&frame).unwrap().len(), 1);
        d.set_confidence(0.3);
        assert_eq!(d.detect(&frame).unwrap().len(), 3);
    }

    #[test]
    fn confidence_is_clamped() {
        let mut d = detector(Arc::default());
        d.set_confidence(1.7);
        assert_eq!(d.confidence(), 1.0);
        d.set_confidence(-0.2);
        assert_eq!(d.confidence(), 0.0);
    }

    #[test]
    fn release_is_idempotent_and_runs_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut d = detector(released.clone());
        d.release();
        d.release();
        assert!(d.is_released());
        assert!(d.detect(&Frame::new(2, 2)).is_err());
        drop(d);
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let released = Arc::new(AtomicUsize::new(0));
        drop(detector(released.clone()));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[cfg(not(feature = "ml-tflite"))]
    #[test]
    fn missing_runtime_is_an_init_error() {
        let err = MlDetector::from_config(&MlConfig::default()).err().unwrap();
        assert!(matches!(err, VisionError::DetectorInit(_)));
    }

    #[test]
    fn unknown_backend_is_an_init_error() {
        let cfg = MlConfig { backend: "onnx".into(), ..MlConfig::default() };
        assert!(matches!(MlDetector::from_config(&cfg), Err(VisionError::DetectorInit(_))));
    }
}
