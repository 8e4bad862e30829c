mod nms;
pub mod annotate;
pub mod cadence;
pub mod detector;
pub mod image_ops;
pub mod occupancy;
pub mod processor;
pub mod tracker;
#[cfg(feature = "ml-tflite")]
pub mod tflite;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use detector::{DetectorBackend, MlConfig, MlDetector};
pub use image_ops::ImageOps;
pub use occupancy::{OccupancyEngine, OccupancyResult};
pub use processor::{FrameProcessor, FrameResult, FrameSettings};
pub use tracker::{CountingParams, TrackedPoint, VehicleTracker};

/// Decoded RGB frame, already scaled to the reference layout's size.
pub type Frame = image::RgbImage;

#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("detector unavailable: {0}")]
    DetectorInit(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("invalid vision config: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    #[default]
    Parking,
    Vehicle,
}

impl fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionMode::Parking => f.write_str("parking"),
            DetectionMode::Vehicle => f.write_str("vehicle"),
        }
    }
}

impl FromStr for DetectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parking" => Ok(DetectionMode::Parking),
            "vehicle" => Ok(DetectionMode::Vehicle),
            other => Err(format!("unknown detection mode: {other}")),
        }
    }
}

/// Detector output in frame pixel coordinates (top-left corner + size).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    pub class_label: String,
}

impl DetectionBox {
    pub fn centre(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Tensor layout of the detector's first output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputLayout {
    /// `[1, 4+C, N]`: attribute-major, class scores only (YOLOv8 exports).
    #[default]
    Yolov8,
    /// `[1, N, 5+C]`: one row per prediction with an objectness column.
    #[serde(alias = "ultralytics")]
    Yolov5,
}

fn best_class(scores: impl Iterator<Item = f32>) -> Option<(usize, f32)> {
    scores.enumerate().fold(None, |best, (c, p)| match best {
        Some((_, bp)) if bp >= p => best,
        _ => Some((c, p)),
    })
}

/// Normalised centre/size to a pixel box in a `fw` x `fh` frame.
fn pixel_box(xywh: [f32; 4], confidence: f32, label: &str, fw: f32, fh: f32) -> DetectionBox {
    let [cx, cy, w, h] = xywh;
    DetectionBox {
        x: (cx - w / 2.0) * fw,
        y: (cy - h / 2.0) * fh,
        width: w * fw,
        height: h * fh,
        confidence,
        class_label: label.to_string(),
    }
}

/// Decodes a YOLOv8 export: `raw[a * num_preds + i]` is attribute `a`
/// (`cx, cy, w, h, cls0..`) of prediction `i`, normalised to the model input.
/// Confidence is the best class score.
pub fn postprocess_yolov8(
    raw: &[f32],
    num_preds: usize,
    class_names: &[String],
    conf_th: f32,
    frame_w: u32,
    frame_h: u32,
) -> Vec<DetectionBox> {
    let attrs = 4 + class_names.len();
    if raw.len() < attrs * num_preds {
        return Vec::new();
    }
    let at = |a: usize, i: usize| raw[a * num_preds + i];
    let (fw, fh) = (frame_w as f32, frame_h as f32);

    (0..num_preds)
        .filter_map(|i| {
            let (c, p) = best_class((4..attrs).map(|a| at(a, i)))?;
            (p >= conf_th).then(|| pixel_box([at(0, i), at(1, i), at(2, i), at(3, i)], p, &class_names[c], fw, fh))
        })
        .collect()
}

/// Decodes a YOLOv5 export `[cx, cy, w, h, obj, cls0..]` per prediction
/// (normalised to the model input) into pixel boxes for a `frame_w` x `frame_h` frame.
pub fn postprocess_yolov5(
    raw: &[f32],
    num_preds: usize,
    class_names: &[String],
    conf_th: f32,
    frame_w: u32,
    frame_h: u32,
) -> Vec<DetectionBox> {
    let stride = 5 + class_names.len();
    let (fw, fh) = (frame_w as f32, frame_h as f32);
    let mut out = Vec::new();

    for pred in raw.chunks_exact(stride).take(num_preds) {
        let Some((best_c, best_p)) = best_class(pred[5..].iter().copied()) else {
            continue;
        };
        let conf = pred[4] * best_p;
        if conf >= conf_th {
            out.push(pixel_box([pred[0], pred[1], pred[2], pred[3]], conf, &class_names[best_c], fw, fh));
        }
    }
    out
}

/// Checks the output tensor shape against `layout` and decodes it.
///
/// YOLOv8 outputs are accepted in either orientation; `[N, 4+C]` is
/// transposed before decoding.
pub fn decode_output(
    layout: OutputLayout,
    dims: &[usize],
    raw: &[f32],
    class_names: &[String],
    conf_th: f32,
    frame_w: u32,
    frame_h: u32,
) -> Result<Vec<DetectionBox>, VisionError> {
    let (rows, cols) = match dims {
        [1, r, c] | [r, c] => (*r, *c),
        other => {
            return Err(VisionError::Configuration(format!(
                "unexpected output dims {other:?}; run `parkwatch vision inspect` and set ml.output_layout"
            )))
        }
    };
    if raw.len() < rows * cols {
        return Err(VisionError::Configuration(format!("output holds {} values, dims {dims:?} need {}", raw.len(), rows * cols)));
    }
    let mismatch = |expected: usize| {
        VisionError::Configuration(format!(
            "{layout:?} output needs {expected} attributes per prediction, got dims {dims:?}"
        ))
    };

    match layout {
        OutputLayout::Yolov8 => {
            let attrs = 4 + class_names.len();
            if rows == attrs {
                Ok(postprocess_yolov8(raw, cols, class_names, conf_th, frame_w, frame_h))
            } else if cols == attrs {
                let mut t = vec![0.0; rows * cols];
                for (i, pred) in raw.chunks_exact(cols).take(rows).enumerate() {
                    for (a, &v) in pred.iter().enumerate() {
                        t[a * rows + i] = v;
                    }
                }
                Ok(postprocess_yolov8(&t, rows, class_names, conf_th, frame_w, frame_h))
            } else {
                Err(mismatch(attrs))
            }
        }
        OutputLayout::Yolov5 => {
            let stride = 5 + class_names.len();
            if cols != stride {
                return Err(mismatch(stride));
            }
            Ok(postprocess_yolov5(raw, rows, class_names, conf_th, frame_w, frame_h))
        }
    }
}

pub fn nms_filter(mut dets: Vec<DetectionBox>, iou_th: f32, max_det: usize) -> Vec<DetectionBox> {
    dets.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
    let mut kept: Vec<DetectionBox> = Vec::new();

    'outer: for d in dets {
        if kept.len() >= max_det {
            break;
        }
        for k in &kept {
            if k.class_label == d.class_label && nms::iou(&d, k) >= iou_th {
                continue 'outer;
            }
        }
        kept.push(d);
    }
    kept
}
