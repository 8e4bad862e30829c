//! Sequential frame sources.
//!
//! A source yields RGB frames already scaled to the reference layout's
//! dimensions. `read` returns `Ok(None)` at end of stream and
//! `Err(SessionError::TransientFrame)` for a single undecodable frame.

pub mod ffmpeg;
pub mod images;

use std::path::Path;

use park_vision::Frame;
use serde::Deserialize;

use crate::SessionError;

pub trait FrameSource: Send {
    fn identifier(&self) -> &str;

    fn read(&mut self) -> Result<Option<Frame>, SessionError>;

    /// Idempotent; reads after release report end of stream.
    fn release(&mut self);
}

pub trait SourceFactory: Send + Sync {
    /// Opens `id`, producing frames of `dims` (width, height).
    fn open(&self, id: &str, dims: (u32, u32)) -> Result<Box<dyn FrameSource>, SessionError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub ffmpeg_bin: String,
    /// Camera device for numeric identifiers; `{}` is replaced by the index.
    pub camera_device: String,
    pub camera_format: String,
    /// Wraps image-sequence directories around instead of ending the stream.
    pub loop_images: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            ffmpeg_bin: "ffmpeg".into(),
            camera_device: "/dev/video{}".into(),
            camera_format: "video4linux2".into(),
            loop_images: false,
        }
    }
}

/// Directories become image sequences, bare integers select a camera,
/// anything else is handed to ffmpeg as a video file.
#[derive(Debug, Clone, Default)]
pub struct DefaultSourceFactory {
    cfg: SourceConfig,
}

impl DefaultSourceFactory {
    pub fn new(cfg: SourceConfig) -> Self {
        Self { cfg }
    }
}

impl SourceFactory for DefaultSourceFactory {
    fn open(&self, id: &str, dims: (u32, u32)) -> Result<Box<dyn FrameSource>, SessionError> {
        if let Ok(index) = id.parse::<u32>() {
            let device = self.cfg.camera_device.replace("{}", &index.to_string());
            let src = ffmpeg::FfmpegSource::camera(&self.cfg, id, &device, dims)?;
            return Ok(Box::new(src));
        }

        let path = Path::new(id);
        if path.is_dir() {
            return Ok(Box::new(images::ImageSequence::open(id, dims, self.cfg.loop_images)?));
        }
        if !path.is_file() {
            return Err(SessionError::source_failed(id, "no such file or directory"));
        }
        Ok(Box::new(ffmpeg::FfmpegSource::file(&self.cfg, id, dims)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_is_a_source_error() {
        let f = DefaultSourceFactory::default();
        let err = f.open("/definitely/not/here.mp4", (64, 48)).err().unwrap();
        assert!(matches!(err, SessionError::Source { .. }));
    }
}
