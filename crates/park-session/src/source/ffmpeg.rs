use std::io::{ErrorKind, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

use park_vision::Frame;
use tracing::{debug, info, warn};

use super::{FrameSource, SourceConfig};
use crate::SessionError;

/// Decodes a file or camera with an `ffmpeg` child process writing raw
/// rgb24 frames, already scaled to the layout size, to its stdout.
///
/// ffmpeg reports an unusable input only through its exit status, so a
/// source counts as open once the first frame has arrived.
pub struct FfmpegSource {
    id: String,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    dims: (u32, u32),
    pending: Option<Frame>,
}

impl FfmpegSource {
    pub fn file(cfg: &SourceConfig, path: &str, dims: (u32, u32)) -> Result<Self, SessionError> {
        let mut cmd = Command::new(&cfg.ffmpeg_bin);
        cmd.args(["-hide_banner", "-loglevel", "error", "-i", path]);
        Self::spawn(cmd, path, dims)
    }

    pub fn camera(cfg: &SourceConfig, id: &str, device: &str, dims: (u32, u32)) -> Result<Self, SessionError> {
        if matches!(cfg.camera_format.as_str(), "video4linux2" | "v4l2") && !Path::new(device).exists() {
            return Err(SessionError::source_failed(id, format!("camera device {device} not found")));
        }
        let mut cmd = Command::new(&cfg.ffmpeg_bin);
        cmd.args(["-hide_banner", "-loglevel", "error", "-f", cfg.camera_format.as_str(), "-i", device]);
        Self::spawn(cmd, id, dims)
    }

    fn spawn(mut cmd: Command, id: &str, (w, h): (u32, u32)) -> Result<Self, SessionError> {
        // ffmpeg -i <input> -vf scale=WxH -f rawvideo -pix_fmt rgb24 -
        let scale = format!("scale={w}:{h}");
        cmd.args(["-vf", scale.as_str(), "-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        debug!("source: spawning {:?}", cmd);
        let mut child = cmd.spawn().map_err(|e| SessionError::source_failed(id, format!("run ffmpeg: {e}")))?;
        let stdout = child.stdout.take();
        let mut src = Self { id: id.to_string(), child: Some(child), stdout, dims: (w, h), pending: None };
        if src.stdout.is_none() {
            return Err(SessionError::source_failed(id, "ffmpeg stdout unavailable"));
        }

        match src.next_frame()? {
            Some(frame) => src.pending = Some(frame),
            None => return Err(SessionError::source_failed(id, "no frames decoded")),
        }
        info!("source: opened {} at {}x{}", id, w, h);
        Ok(src)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SessionError> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };
        let (w, h) = self.dims;
        let mut buf = vec![0u8; w as usize * h as usize * 3];
        match stdout.read_exact(&mut buf) {
            Ok(()) => {}
            // a truncated last frame ends the stream too
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return self.finish(),
            Err(e) => return Err(SessionError::source_failed(&self.id, e)),
        }
        match Frame::from_raw(w, h, buf) {
            Some(frame) => Ok(Some(frame)),
            None => Err(SessionError::TransientFrame(format!("{}: short frame buffer", self.id))),
        }
    }

    /// Output closed: a clean exit is end of stream, anything else a failed source.
    fn finish(&mut self) -> Result<Option<Frame>, SessionError> {
        self.stdout = None;
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };
        match child.wait() {
            Ok(status) if status.success() => {
                debug!("source: ffmpeg finished {}", self.id);
                Ok(None)
            }
            Ok(status) => Err(SessionError::source_failed(&self.id, format!("ffmpeg exited with {status}"))),
            Err(e) => Err(SessionError::source_failed(&self.id, format!("wait for ffmpeg: {e}"))),
        }
    }
}

impl FrameSource for FfmpegSource {
    fn identifier(&self) -> &str {
        &self.id
    }

    fn read(&mut self) -> Result<Option<Frame>, SessionError> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        self.next_frame()
    }

    fn release(&mut self) {
        self.stdout = None;
        self.pending = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!("source: ffmpeg already exited: {}", e);
            }
            if let Err(e) = child.wait() {
                warn!("source: reaping ffmpeg failed: {}", e);
            }
            info!("source: released {}", self.id);
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{DefaultSourceFactory, SourceFactory};

    #[test]
    fn missing_binary_is_a_source_error() {
        let cfg = SourceConfig { ffmpeg_bin: "/nonexistent/ffmpeg".into(), ..SourceConfig::default() };
        let err = FfmpegSource::file(&cfg, "clip.mp4", (64, 48)).err().unwrap();
        assert!(matches!(err, SessionError::Source { .. }));
    }

    #[test]
    fn missing_camera_device_is_a_source_error() {
        let cfg = SourceConfig { camera_device: "/dev/no_such_video{}".into(), ..SourceConfig::default() };
        let err = DefaultSourceFactory::new(cfg).open("0", (64, 48)).err().unwrap();
        match err {
            SessionError::Source { id, reason } => {
                assert_eq!(id, "0");
                assert!(reason.contains("/dev/no_such_video0"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    mod fake_ffmpeg {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// A stand-in binary that ignores its arguments and runs `body`.
        fn script(dir: &Path, body: &str) -> SourceConfig {
            let path = dir.join("fake-ffmpeg");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            SourceConfig { ffmpeg_bin: path.display().to_string(), ..SourceConfig::default() }
        }

        #[test]
        fn failing_ffmpeg_fails_open() {
            let dir = tempfile::tempdir().unwrap();
            let cfg = script(dir.path(), "exit 1");
            let err = FfmpegSource::file(&cfg, "clip.mp4", (2, 2)).err().unwrap();
            match err {
                SessionError::Source { reason, .. } => assert!(reason.contains("exited"), "{reason}"),
                other => panic!("unexpected error: {other}"),
            }
        }

        #[test]
        fn clean_exit_without_frames_fails_open() {
            let dir = tempfile::tempdir().unwrap();
            let cfg = script(dir.path(), "exit 0");
            let err = FfmpegSource::file(&cfg, "clip.mp4", (2, 2)).err().unwrap();
            assert!(matches!(err, SessionError::Source { .. }));
        }

        #[test]
        fn error_exit_after_frames_is_a_source_error() {
            let dir = tempfile::tempdir().unwrap();
            // one 2x2 rgb24 frame, then a decoder failure
            let cfg = script(dir.path(), "head -c 12 /dev/zero\nexit 3");
            let mut src = FfmpegSource::file(&cfg, "clip.mp4", (2, 2)).unwrap();
            assert_eq!(src.read().unwrap().unwrap().dimensions(), (2, 2));
            assert!(matches!(src.read(), Err(SessionError::Source { .. })));
            assert!(src.read().unwrap().is_none());
            src.release();
        }

        #[test]
        fn clean_exit_is_end_of_stream() {
            let dir = tempfile::tempdir().unwrap();
            let cfg = script(dir.path(), "head -c 24 /dev/zero");
            let mut src = FfmpegSource::file(&cfg, "clip.mp4", (2, 2)).unwrap();
            assert!(src.read().unwrap().is_some());
            assert!(src.read().unwrap().is_some());
            assert!(src.read().unwrap().is_none());
        }
    }
}
