//! Pixel kernels behind a dispatch strategy.
//!
//! Per-pixel kernels are written once as row functions. An [`ImageOps`]
//! implementation only decides how rows are scheduled: [`ScalarOps`] walks
//! them on the calling thread, [`ParallelOps`] hands bands of rows to the
//! rayon pool. Neighbourhood filters come from `imageproc` and are shared by
//! both. Output is identical either way, so the strategy is chosen once at
//! startup by [`probe`] and never branched on per call.

use std::sync::Arc;

use image::{imageops::FilterType, GrayImage};
use imageproc::distance_transform::Norm;
use imageproc::{filter, morphology};
use rayon::prelude::*;
use serde::Deserialize;
use tracing::info;

use crate::Frame;

pub type RowKernel<'a> = dyn Fn(u32, &mut [u8]) + Sync + 'a;

pub trait ImageOps: Send + Sync {
    fn name(&self) -> &'static str;

    /// Builds a `width` x `height` image by calling `row(y, out_row)` for every row.
    fn map_rows(&self, width: u32, height: u32, row: &RowKernel<'_>) -> GrayImage;

    fn grayscale(&self, frame: &Frame) -> GrayImage {
        let w = frame.width() as usize;
        let raw = frame.as_raw();
        self.map_rows(frame.width(), frame.height(), &|y, out| {
            let start = y as usize * w * 3;
            for (o, px) in out.iter_mut().zip(raw[start..start + w * 3].chunks_exact(3)) {
                let (r, g, b) = (u32::from(px[0]), u32::from(px[1]), u32::from(px[2]));
                *o = ((299 * r + 587 * g + 114 * b + 500) / 1000) as u8;
            }
        })
    }

    /// 3x3 mean, borders replicated.
    fn blur3(&self, src: &GrayImage) -> GrayImage {
        if is_empty(src) {
            return src.clone();
        }
        filter::box_filter(src, 1, 1)
    }

    /// Inverse binary threshold against the local mean minus `c`:
    /// 255 where `pixel <= mean(block) - c`, else 0.
    fn adaptive_threshold_inv(&self, src: &GrayImage, block: u32, c: i32) -> GrayImage {
        if is_empty(src) {
            return src.clone();
        }
        let r = block / 2;
        let mean = filter::box_filter(src, r, r);
        let w = src.width() as usize;
        let (pixels, means) = (src.as_raw(), mean.as_raw());
        self.map_rows(src.width(), src.height(), &|y, out| {
            let start = y as usize * w;
            let row = pixels[start..start + w].iter().zip(&means[start..start + w]);
            for (o, (&p, &m)) in out.iter_mut().zip(row) {
                *o = if i32::from(p) <= i32::from(m) - c { 255 } else { 0 };
            }
        })
    }

    fn median3(&self, src: &GrayImage) -> GrayImage {
        if is_empty(src) {
            return src.clone();
        }
        filter::median_filter(src, 1, 1)
    }

    /// Grows non-zero pixels by one in the 8-neighbourhood.
    fn dilate3(&self, src: &GrayImage) -> GrayImage {
        morphology::dilate(src, Norm::LInf, 1)
    }

    fn erode3(&self, src: &GrayImage) -> GrayImage {
        morphology::erode(src, Norm::LInf, 1)
    }

    fn resize(&self, frame: &Frame, width: u32, height: u32) -> Frame {
        if frame.dimensions() == (width, height) {
            return frame.clone();
        }
        image::imageops::resize(frame, width, height, FilterType::Triangle)
    }
}

fn is_empty(src: &GrayImage) -> bool {
    src.width() == 0 || src.height() == 0
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ScalarOps;

impl ImageOps for ScalarOps {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn map_rows(&self, width: u32, height: u32, row: &RowKernel<'_>) -> GrayImage {
        let mut out = GrayImage::new(width, height);
        if width == 0 {
            return out;
        }
        for (y, line) in out.chunks_exact_mut(width as usize).enumerate() {
            row(y as u32, line);
        }
        out
    }
}

/// Row bands spread over the rayon pool, `workers` bands per image.
#[derive(Debug, Clone, Copy)]
pub struct ParallelOps {
    workers: usize,
}

impl ParallelOps {
    pub fn new(workers: usize) -> Self {
        Self { workers: workers.max(1) }
    }
}

impl ImageOps for ParallelOps {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn map_rows(&self, width: u32, height: u32, row: &RowKernel<'_>) -> GrayImage {
        let mut out = GrayImage::new(width, height);
        if width == 0 || height == 0 {
            return out;
        }
        let w = width as usize;
        let band_rows = (height as usize).div_ceil(self.workers);
        let buf: &mut [u8] = &mut out;
        buf.par_chunks_mut(band_rows * w).enumerate().for_each(|(band, chunk)| {
            for (i, line) in chunk.chunks_exact_mut(w).enumerate() {
                row((band * band_rows + i) as u32, line);
            }
        });
        out
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpsKind {
    #[default]
    Auto,
    Scalar,
    Parallel,
}

/// Picks the strategy once for the lifetime of the process.
pub fn probe() -> Arc<dyn ImageOps> {
    select(OpsKind::Auto)
}

pub fn select(kind: OpsKind) -> Arc<dyn ImageOps> {
    let cores = rayon::current_num_threads();
    let ops: Arc<dyn ImageOps> = match kind {
        OpsKind::Scalar => Arc::new(ScalarOps),
        OpsKind::Parallel => Arc::new(ParallelOps::new(cores)),
        OpsKind::Auto if cores > 1 => Arc::new(ParallelOps::new(cores)),
        OpsKind::Auto => Arc::new(ScalarOps),
    };
    info!("image ops: {} ({} cores)", ops.name(), cores);
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    fn scene() -> Frame {
        Frame::from_fn(97, 61, |x, y| {
            let v = ((x * 7 + y * 13) % 251) as u8;
            if (30..60).contains(&x) && (20..40).contains(&y) {
                Rgb([10, 10, 10])
            } else {
                Rgb([v, 255 - v, 200])
            }
        })
    }

    #[test]
    fn grayscale_weights() {
        let f = Frame::from_pixel(2, 1, Rgb([255, 0, 0]));
        assert_eq!(ScalarOps.grayscale(&f).get_pixel(0, 0).0[0], 76);
        let f = Frame::from_pixel(2, 1, Rgb([255, 255, 255]));
        assert_eq!(ScalarOps.grayscale(&f).get_pixel(1, 0).0[0], 255);
    }

    #[test]
    fn parallel_matches_scalar() {
        let par = ParallelOps::new(4);
        let gray = ScalarOps.grayscale(&scene());
        assert_eq!(par.grayscale(&scene()), gray);
        assert_eq!(par.blur3(&gray), ScalarOps.blur3(&gray));
        assert_eq!(par.adaptive_threshold_inv(&gray, 25, 16), ScalarOps.adaptive_threshold_inv(&gray, 25, 16));
        assert_eq!(par.median3(&gray), ScalarOps.median3(&gray));
        let mask = ScalarOps.adaptive_threshold_inv(&gray, 25, 16);
        assert_eq!(par.dilate3(&mask), ScalarOps.dilate3(&mask));
        assert_eq!(par.erode3(&mask), ScalarOps.erode3(&mask));
    }

    #[test]
    fn more_workers_than_rows() {
        let gray = GrayImage::from_pixel(5, 3, Luma([9]));
        assert_eq!(ParallelOps::new(16).blur3(&gray), gray);
    }

    #[test]
    fn uniform_image_has_no_adaptive_foreground() {
        let gray = GrayImage::from_pixel(40, 40, Luma([120]));
        let mask = ScalarOps.adaptive_threshold_inv(&gray, 25, 16);
        assert!(mask.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn dark_edge_on_bright_background_is_foreground() {
        let gray = GrayImage::from_fn(60, 60, |x, _| if x < 30 { Luma([0]) } else { Luma([255]) });
        let mask = ScalarOps.adaptive_threshold_inv(&gray, 25, 16);
        assert_eq!(mask.get_pixel(29, 30).0[0], 255);
        assert_eq!(mask.get_pixel(45, 30).0[0], 0);
        assert_eq!(mask.get_pixel(2, 30).0[0], 0);
    }

    #[test]
    fn morphology_grows_and_shrinks_a_dot() {
        let mut gray = GrayImage::new(9, 9);
        gray.put_pixel(4, 4, Luma([255]));
        let grown = ScalarOps.dilate3(&gray);
        assert_eq!(grown.pixels().filter(|p| p.0[0] == 255).count(), 9);
        assert_eq!(ScalarOps.erode3(&grown), gray);
        assert_eq!(ScalarOps.median3(&gray).pixels().filter(|p| p.0[0] != 0).count(), 0);
    }

    #[test]
    fn empty_images_are_fine() {
        let gray = GrayImage::new(0, 0);
        assert_eq!(ParallelOps::new(4).blur3(&gray).dimensions(), (0, 0));
        assert_eq!(ScalarOps.adaptive_threshold_inv(&gray, 25, 16).dimensions(), (0, 0));
        assert_eq!(ScalarOps.median3(&gray).dimensions(), (0, 0));
        assert_eq!(ParallelOps::new(4).grayscale(&Frame::new(0, 4)).dimensions(), (0, 4));
    }

    #[test]
    fn blur_replicates_borders() {
        let gray = GrayImage::from_fn(6, 6, |x, _| if x == 0 { Luma([90]) } else { Luma([0]) });
        let blurred = ScalarOps.blur3(&gray);
        // column 0 sees itself twice through the replicated border
        assert_eq!(blurred.get_pixel(0, 3).0[0], 60);
        assert_eq!(blurred.get_pixel(1, 3).0[0], 30);
        assert_eq!(blurred.get_pixel(3, 3).0[0], 0);
    }
}
