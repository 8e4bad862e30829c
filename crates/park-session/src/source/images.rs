use std::path::PathBuf;

use image::imageops::FilterType;
use park_vision::Frame;
use tracing::{debug, info};

use super::FrameSource;
use crate::SessionError;

const EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Still images of a directory played back in file-name order.
pub struct ImageSequence {
    id: String,
    files: Vec<PathBuf>,
    next: usize,
    dims: (u32, u32),
    looping: bool,
    released: bool,
}

impl ImageSequence {
    pub fn open(dir: &str, dims: (u32, u32), looping: bool) -> Result<Self, SessionError> {
        let entries = std::fs::read_dir(dir).map_err(|e| SessionError::source_failed(dir, e))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            })
            .collect();
        if files.is_empty() {
            return Err(SessionError::source_failed(dir, "no images in directory"));
        }
        files.sort();
        info!("source: {} images from {}", files.len(), dir);
        Ok(Self { id: dir.to_string(), files, next: 0, dims, looping, released: false })
    }
}

impl FrameSource for ImageSequence {
    fn identifier(&self) -> &str {
        &self.id
    }

    fn read(&mut self) -> Result<Option<Frame>, SessionError> {
        if self.released {
            return Ok(None);
        }
        if self.next >= self.files.len() {
            if !self.looping {
                return Ok(None);
            }
            self.next = 0;
        }
        let path = &self.files[self.next];
        self.next += 1;

        let img = image::open(path)
            .map_err(|e| SessionError::TransientFrame(format!("{}: {}", path.display(), e)))?
            .to_rgb8();
        let (w, h) = self.dims;
        if img.dimensions() == (w, h) {
            return Ok(Some(img));
        }
        debug!("source: scaling {} to {}x{}", path.display(), w, h);
        Ok(Some(image::imageops::resize(&img, w, h, FilterType::Triangle)))
    }

    fn release(&mut self) {
        self.released = true;
    }
}
