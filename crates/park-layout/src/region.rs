use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::LayoutError;

/// One parking space, in the pixel space of its reference image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: u32,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Half-open pixel rectangle `[x0, x1) x [y0, y1)` inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clamped {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl Clamped {
    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }
}

impl Region {
    pub fn new(id: u32, x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { id, x, y, width, height }
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.width <= 0 || self.height <= 0 {
            return Err(LayoutError::InvalidRegion {
                id: self.id,
                reason: format!("non-positive size {}x{}", self.width, self.height),
            });
        }
        Ok(())
    }

    /// Intersection with a `width` x `height` frame, `None` when empty.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Clamped> {
        let x0 = i64::from(self.x).max(0);
        let y0 = i64::from(self.y).max(0);
        let x1 = (i64::from(self.x) + i64::from(self.width)).min(i64::from(width));
        let y1 = (i64::from(self.y) + i64::from(self.height)).min(i64::from(height));
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Clamped {
            x0: x0 as u32,
            y0: y0 as u32,
            x1: x1 as u32,
            y1: y1 as u32,
        })
    }

    pub fn contains(&self, px: f32, py: f32) -> bool {
        px >= self.x as f32
            && py >= self.y as f32
            && px < self.x.saturating_add(self.width) as f32
            && py < self.y.saturating_add(self.height) as f32
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.x < other.x.saturating_add(other.width)
            && other.x < self.x.saturating_add(self.width)
            && self.y < other.y.saturating_add(other.height)
            && other.y < self.y.saturating_add(self.height)
    }
}

/// Validated, ordered regions of one reference layout.
///
/// The region slice is reference counted so the frame loop can hold on to a
/// snapshot while the layout is swapped underneath it.
#[derive(Debug, Clone)]
pub struct RegionStore {
    reference: String,
    regions: Arc<[Region]>,
}

impl RegionStore {
    pub fn new(reference: impl Into<String>, regions: Vec<Region>) -> Result<Self, LayoutError> {
        let mut seen = HashSet::with_capacity(regions.len());
        for r in &regions {
            r.validate()?;
            if !seen.insert(r.id) {
                return Err(LayoutError::DuplicateRegion(r.id));
            }
        }
        Ok(Self { reference: reference.into(), regions: regions.into() })
    }

    pub fn empty(reference: impl Into<String>) -> Self {
        Self { reference: reference.into(), regions: Arc::from(Vec::new()) }
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn shared(&self) -> Arc<[Region]> {
        self.regions.clone()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// One past the highest id in use.
    pub fn next_id(&self) -> u32 {
        self.regions.iter().map(|r| r.id + 1).max().unwrap_or(0)
    }
}
