use std::sync::Arc;

use image::GrayImage;
use park_layout::Region;
use serde::{Deserialize, Serialize};

use crate::{Frame, ImageOps};

pub const DEFAULT_THRESHOLD: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyResult {
    pub region_id: u32,
    pub occupied: bool,
    pub pixel_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OccupancyConfig {
    /// Odd window size of the adaptive threshold.
    pub block_size: u32,
    /// Constant subtracted from the local mean.
    pub c: i32,
}

impl Default for OccupancyConfig {
    fn default() -> Self {
        Self { block_size: 25, c: 16 }
    }
}

/// Classical per-space occupancy from edge density inside each region.
pub struct OccupancyEngine {
    ops: Arc<dyn ImageOps>,
    cfg: OccupancyConfig,
}

impl OccupancyEngine {
    pub fn new(ops: Arc<dyn ImageOps>, cfg: OccupancyConfig) -> Self {
        Self { ops, cfg }
    }

    /// Binary mask where 255 marks texture (car edges, shadows), 0 empty tarmac.
    pub fn preprocess(&self, frame: &Frame) -> GrayImage {
        let gray = self.ops.grayscale(frame);
        let blurred = self.ops.blur3(&gray);
        let mask = self.ops.adaptive_threshold_inv(&blurred, self.cfg.block_size | 1, self.cfg.c);
        let mask = self.ops.median3(&mask);
        self.ops.dilate3(&mask)
    }

    pub fn evaluate(&self, frame: &Frame, regions: &[Region], threshold: u32) -> Vec<OccupancyResult> {
        evaluate_mask(&self.preprocess(frame), regions, threshold)
    }
}

/// One result per region, in region order. Occupied iff `pixel_count > threshold`.
pub fn evaluate_mask(mask: &GrayImage, regions: &[Region], threshold: u32) -> Vec<OccupancyResult> {
    regions
        .iter()
        .map(|r| {
            let pixel_count = count_foreground(mask, r);
            OccupancyResult { region_id: r.id, occupied: pixel_count > threshold, pixel_count }
        })
        .collect()
}

/// Non-zero pixels of `mask` inside `region`, clipped to the mask bounds.
pub fn count_foreground(mask: &GrayImage, region: &Region) -> u32 {
    let Some(c) = region.clamp_to(mask.width(), mask.height()) else {
        return 0;
    };
    let stride = mask.width() as usize;
    let raw = mask.as_raw();
    (c.y0..c.y1)
        .map(|y| {
            let start = y as usize * stride;
            raw[start + c.x0 as usize..start + c.x1 as usize].iter().filter(|&&v| v != 0).count() as u32
        })
        .sum()
}

/// `(free, occupied)`.
pub fn tally(results: &[OccupancyResult]) -> (u32, u32) {
    let occupied = results.iter().filter(|r| r.occupied).count() as u32;
    (results.len() as u32 - occupied, occupied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_ops::ScalarOps;
    use image::{Luma, Rgb};

    /// Mask with exactly `n` foreground pixels laid out row-major from (x, y).
    fn paint(mask: &mut GrayImage, x: u32, y: u32, w: u32, n: u32) {
        for i in 0..n {
            mask.put_pixel(x + i % w, y + i / w, Luma([255]));
        }
    }

    #[test]
    fn two_region_scenario() {
        let mut mask = GrayImage::new(200, 100);
        paint(&mut mask, 0, 0, 50, 600);
        paint(&mut mask, 100, 0, 50, 100);
        let regions = [Region::new(1, 0, 0, 50, 50), Region::new(2, 100, 0, 50, 50)];

        let results = evaluate_mask(&mask, &regions, 500);
        assert_eq!(
            results,
            vec![
                OccupancyResult { region_id: 1, occupied: true, pixel_count: 600 },
                OccupancyResult { region_id: 2, occupied: false, pixel_count: 100 },
            ]
        );
        assert_eq!(tally(&results), (1, 1));
    }

    #[test]
    fn count_equal_to_threshold_is_free() {
        let mut mask = GrayImage::new(50, 50);
        paint(&mut mask, 0, 0, 50, 500);
        let regions = [Region::new(0, 0, 0, 50, 50)];
        for (threshold, occupied) in [(499, true), (500, false), (501, false), (0, true)] {
            let r = evaluate_mask(&mask, &regions, threshold);
            assert_eq!(r[0].pixel_count, 500);
            assert_eq!(r[0].occupied, occupied, "threshold {threshold}");
        }
    }

    #[test]
    fn region_is_clamped_to_frame() {
        let mask = GrayImage::from_pixel(40, 30, Luma([255]));
        let partial = Region::new(0, 30, 20, 50, 50);
        let outside = Region::new(1, 100, 100, 10, 10);
        let negative = Region::new(2, -10, -10, 15, 12);
        let results = evaluate_mask(&mask, &[partial, outside, negative], 0);
        assert_eq!(results[0].pixel_count, 10 * 10);
        assert_eq!(results[1], OccupancyResult { region_id: 1, occupied: false, pixel_count: 0 });
        assert_eq!(results[2].pixel_count, 5 * 2);
    }

    #[test]
    fn results_follow_region_order() {
        let mask = GrayImage::new(10, 10);
        let regions = [Region::new(7, 0, 0, 2, 2), Region::new(3, 2, 2, 2, 2), Region::new(5, 4, 4, 2, 2)];
        let ids: Vec<u32> = evaluate_mask(&mask, &regions, 1).iter().map(|r| r.region_id).collect();
        assert_eq!(ids, vec![7, 3, 5]);
    }

    #[test]
    fn car_shaped_blob_occupies_its_space_only() {
        let frame = Frame::from_fn(200, 100, |x, y| {
            if (20..60).contains(&x) && (30..70).contains(&y) { Rgb([20, 20, 20]) } else { Rgb([230, 230, 230]) }
        });
        let engine = OccupancyEngine::new(Arc::new(ScalarOps), OccupancyConfig::default());
        let regions = [Region::new(0, 10, 20, 60, 60), Region::new(1, 120, 20, 60, 60)];
        let results = engine.evaluate(&frame, &regions, 50);
        assert!(results[0].occupied, "{:?}", results[0]);
        assert_eq!(results[1].pixel_count, 0);
        assert!(!results[1].occupied);
    }
}
