//! Line-crossing vehicle counter.
//!
//! Moving blobs come from a running-average background model. Their centroids
//! are associated greedily with the points tracked on the previous frames:
//! each centroid takes the nearest free point within `max_match_distance`,
//! earlier-created points winning ties. This is not an optimal assignment and
//! there is no identity across occlusions, so two cars merging into one blob
//! near the line count once. Accepted for a counting overlay.

use std::sync::Arc;

use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Frame, ImageOps};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackedPoint {
    pub x: f32,
    pub y: f32,
    /// Consecutive frames since the point was last matched.
    pub age: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountDirection {
    /// Increasing y (top of the image towards the bottom).
    #[default]
    Downward,
    Upward,
}

impl CountDirection {
    fn crossed(self, line: f32, prev_y: f32, y: f32) -> bool {
        match self {
            CountDirection::Downward => prev_y < line && y >= line,
            CountDirection::Upward => prev_y > line && y <= line,
        }
    }
}

/// Per-call geometry, adjustable while a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CountingParams {
    pub line_height: i32,
    pub offset: i32,
    pub min_contour_width: u32,
    pub min_contour_height: u32,
}

impl Default for CountingParams {
    fn default() -> Self {
        Self { line_height: 400, offset: 10, min_contour_width: 40, min_contour_height: 40 }
    }
}

impl CountingParams {
    fn band(&self) -> (f32, f32) {
        ((self.line_height - self.offset) as f32, (self.line_height + self.offset) as f32)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub direction: CountDirection,
    /// Points unmatched for more than this many frames are dropped uncounted.
    pub max_age: u32,
    pub max_match_distance: f32,
    pub max_points: usize,
    /// Absolute grey-level difference from the background that counts as motion.
    pub diff_threshold: u8,
    pub learning_rate: f32,
    pub close_iterations: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            direction: CountDirection::Downward,
            max_age: 5,
            max_match_distance: 50.0,
            max_points: 64,
            diff_threshold: 30,
            learning_rate: 0.05,
            close_iterations: 2,
        }
    }
}

/// Bounding box of a connected foreground component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blob {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Blob {
    pub fn centroid(&self) -> (f32, f32) {
        (self.x as f32 + self.width as f32 / 2.0, self.y as f32 + self.height as f32 / 2.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerUpdate {
    pub delta: u32,
    pub points: Vec<TrackedPoint>,
}

pub struct VehicleTracker {
    cfg: TrackerConfig,
    ops: Arc<dyn ImageOps>,
    background: Option<Background>,
    points: Vec<TrackedPoint>,
}

struct Background {
    width: u32,
    height: u32,
    model: Vec<f32>,
}

impl VehicleTracker {
    pub fn new(cfg: TrackerConfig, ops: Arc<dyn ImageOps>) -> Self {
        Self { cfg, ops, background: None, points: Vec::new() }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.cfg
    }

    pub fn points(&self) -> &[TrackedPoint] {
        &self.points
    }

    /// Forgets tracked points and the background model.
    pub fn reset(&mut self) {
        self.points.clear();
        self.background = None;
    }

    pub fn update(&mut self, frame: &Frame, params: &CountingParams) -> TrackerUpdate {
        let centroids = self.centroids(frame, params);
        self.update_centroids(&centroids, params)
    }

    /// Centroids of the moving blobs large enough to be vehicles.
    pub fn centroids(&mut self, frame: &Frame, params: &CountingParams) -> Vec<(f32, f32)> {
        let mask = self.foreground(frame);
        blobs(&mask)
            .into_iter()
            .filter(|b| b.width >= params.min_contour_width && b.height >= params.min_contour_height)
            .map(|b| b.centroid())
            .collect()
    }

    /// Motion mask against the running background, closed to fill gaps.
    /// The first frame (or a size change) only primes the model.
    pub fn foreground(&mut self, frame: &Frame) -> GrayImage {
        let gray = self.ops.blur3(&self.ops.grayscale(frame));
        let (w, h) = gray.dimensions();

        let primed = matches!(&self.background, Some(bg) if bg.width == w && bg.height == h);
        if !primed {
            self.background = Some(Background {
                width: w,
                height: h,
                model: gray.as_raw().iter().map(|&v| f32::from(v)).collect(),
            });
            return GrayImage::new(w, h);
        }
        let Some(bg) = self.background.as_mut() else {
            return GrayImage::new(w, h);
        };

        let threshold = f32::from(self.cfg.diff_threshold);
        let model = &bg.model;
        let mut mask = self.ops.map_rows(w, h, &|y, out| {
            let start = (y * w) as usize;
            let row = &gray.as_raw()[start..start + w as usize];
            for ((o, &v), &b) in out.iter_mut().zip(row).zip(&model[start..start + w as usize]) {
                *o = if (f32::from(v) - b).abs() > threshold { 255 } else { 0 };
            }
        });

        let a = self.cfg.learning_rate.clamp(0.0, 1.0);
        for (b, &v) in bg.model.iter_mut().zip(gray.as_raw()) {
            *b += a * (f32::from(v) - *b);
        }

        for _ in 0..self.cfg.close_iterations {
            mask = self.ops.dilate3(&mask);
        }
        for _ in 0..self.cfg.close_iterations {
            mask = self.ops.erode3(&mask);
        }
        mask
    }

    /// Association and counting on already extracted centroids.
    pub fn update_centroids(&mut self, centroids: &[(f32, f32)], params: &CountingParams) -> TrackerUpdate {
        let (lo, hi) = params.band();
        let line = params.line_height as f32;
        let max_d2 = self.cfg.max_match_distance * self.cfg.max_match_distance;

        for p in &mut self.points {
            p.age = p.age.saturating_add(1);
        }

        let mut matched = vec![false; self.points.len()];
        let mut counted = vec![false; self.points.len()];
        let mut spawned = Vec::new();
        let mut delta = 0;

        for &(cx, cy) in centroids {
            if cy < lo || cy > hi {
                continue;
            }

            let mut best: Option<(usize, f32)> = None;
            for (i, p) in self.points.iter().enumerate() {
                if matched[i] {
                    continue;
                }
                let d2 = (p.x - cx).powi(2) + (p.y - cy).powi(2);
                if d2 > max_d2 {
                    continue;
                }
                // strict: an equidistant later point never displaces an earlier one
                if best.map_or(true, |(_, bd2)| d2 < bd2) {
                    best = Some((i, d2));
                }
            }

            match best {
                Some((i, _)) => {
                    matched[i] = true;
                    let p = &mut self.points[i];
                    if self.cfg.direction.crossed(line, p.y, cy) {
                        counted[i] = true;
                        delta += 1;
                        debug!("tracker: counted point at ({:.0}, {:.0})", cx, cy);
                    }
                    *p = TrackedPoint { x: cx, y: cy, age: 0 };
                }
                None => spawned.push(TrackedPoint { x: cx, y: cy, age: 0 }),
            }
        }

        let max_age = self.cfg.max_age;
        let mut i = 0;
        self.points.retain(|p| {
            let keep = !counted[i] && p.age <= max_age;
            i += 1;
            keep
        });

        let room = self.cfg.max_points.saturating_sub(self.points.len());
        self.points.extend(spawned.into_iter().take(room));

        TrackerUpdate { delta, points: self.points.clone() }
    }
}

/// Bounding boxes of the 8-connected components of the non-zero pixels,
/// in raster order of their first pixel.
pub fn blobs(mask: &GrayImage) -> Vec<Blob> {
    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));
    let mut extents: Vec<Option<(u32, u32, u32, u32)>> = Vec::new();

    for (x, y, label) in labels.enumerate_pixels() {
        let Some(idx) = (label.0[0] as usize).checked_sub(1) else {
            continue;
        };
        if extents.len() <= idx {
            extents.resize(idx + 1, None);
        }
        let e = &mut extents[idx];
        *e = Some(match *e {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }

    extents
        .into_iter()
        .flatten()
        .map(|(x0, y0, x1, y1)| Blob { x: x0, y: y0, width: x1 - x0 + 1, height: y1 - y0 + 1 })
        .collect()
}
