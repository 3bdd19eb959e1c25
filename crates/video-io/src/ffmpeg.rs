//! `ffmpeg` child processes exchanging raw `rgb24` frames over pipes

use crate::probe::probe_file;
use crate::{FrameSink, FrameSource, VideoBackend, VideoError, VideoProbe, VideoResult};
use image::RgbImage;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Drain stderr on a helper thread so a chatty child never blocks on a full pipe
fn collect_stderr(child: &mut Child) -> Option<JoinHandle<String>> {
    child.stderr.take().map(|mut stderr| {
        std::thread::spawn(move || {
            let mut buffer = String::new();
            let _ = stderr.read_to_string(&mut buffer);
            buffer
        })
    })
}

fn join_stderr(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn kill_quietly(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Decoder reading frames from `ffmpeg -f rawvideo -pix_fmt rgb24 -`
pub struct FfmpegFrameReader {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    width: u32,
    height: u32,
    frame_len: usize,
    finished: bool,
}

impl FfmpegFrameReader {
    pub fn open(path: &Path, width: u32, height: u32) -> VideoResult<Self> {
        let mut child = Command::new("ffmpeg")
            .args(["-v", "error", "-nostdin", "-i"])
            .arg(path)
            .args(["-an", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| VideoError::Decode(format!("Failed to execute ffmpeg: {e}")))?;

        let stderr = collect_stderr(&mut child);
        let Some(stdout) = child.stdout.take() else {
            kill_quietly(&mut child);
            return Err(VideoError::Decode("ffmpeg stdout unavailable".to_string()));
        };

        debug!("Decoding {} as {}x{} rgb24", path.display(), width, height);
        Ok(Self {
            child,
            stdout,
            stderr,
            width,
            height,
            frame_len: width as usize * height as usize * 3,
            finished: false,
        })
    }

    /// Wait for the decoder once its output is exhausted
    fn finish(&mut self) -> VideoResult<()> {
        self.finished = true;
        let status = self.child.wait()?;
        let stderr = join_stderr(self.stderr.take());
        if status.success() {
            Ok(())
        } else {
            Err(VideoError::Decode(format!("ffmpeg exited with {status}: {stderr}")))
        }
    }
}

impl FrameSource for FfmpegFrameReader {
    fn next_frame(&mut self) -> VideoResult<Option<RgbImage>> {
        if self.finished {
            return Ok(None);
        }

        let mut buffer = vec![0u8; self.frame_len];
        let mut filled = 0;
        while filled < self.frame_len {
            match self.stdout.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(VideoError::Decode(e.to_string())),
            }
        }

        if filled < self.frame_len {
            if filled > 0 {
                warn!("Dropping truncated trailing frame ({} of {} bytes)", filled, self.frame_len);
            }
            self.finish()?;
            return Ok(None);
        }

        RgbImage::from_raw(self.width, self.height, buffer)
            .map(Some)
            .ok_or_else(|| VideoError::Decode("Frame buffer size mismatch".to_string()))
    }
}

impl Drop for FfmpegFrameReader {
    fn drop(&mut self) {
        if !self.finished {
            kill_quietly(&mut self.child);
        }
    }
}

/// H.264 encoder fed through `ffmpeg -f rawvideo -i -`
pub struct FfmpegFrameWriter {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<String>>,
    path: PathBuf,
    width: u32,
    height: u32,
    done: bool,
}

impl FfmpegFrameWriter {
    pub fn create(path: &Path, width: u32, height: u32, fps: f64) -> VideoResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut child = Command::new("ffmpeg")
            .args(["-y", "-v", "error", "-f", "rawvideo", "-pix_fmt", "rgb24"])
            .args(["-s", &format!("{width}x{height}")])
            .args(["-r", &format!("{fps:.6}")])
            .args(["-i", "-", "-an"])
            .args(["-c:v", "libx264", "-preset", "veryfast", "-pix_fmt", "yuv420p"])
            // yuv420p needs even dimensions
            .args(["-vf", "scale=trunc(iw/2)*2:trunc(ih/2)*2"])
            .args(["-f", "mp4"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| VideoError::Encode(format!("Failed to execute ffmpeg: {e}")))?;

        let stderr = collect_stderr(&mut child);
        let stdin = child.stdin.take();
        if stdin.is_none() {
            kill_quietly(&mut child);
            return Err(VideoError::Encode("ffmpeg stdin unavailable".to_string()));
        }

        Ok(Self {
            child,
            stdin,
            stderr,
            path: path.to_path_buf(),
            width,
            height,
            done: false,
        })
    }

    fn discard(&mut self) {
        self.done = true;
        self.stdin.take();
        kill_quietly(&mut self.child);
        join_stderr(self.stderr.take());
        let _ = std::fs::remove_file(&self.path);
    }
}

impl FrameSink for FfmpegFrameWriter {
    fn write_frame(&mut self, frame: &RgbImage) -> VideoResult<()> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(VideoError::Encode(format!(
                "Frame is {}x{}, encoder expects {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| VideoError::Encode("Encoder already closed".to_string()))?;
        stdin
            .write_all(frame.as_raw())
            .map_err(|e| VideoError::Encode(format!("{}: {e}", self.path.display())))
    }

    fn finish(mut self: Box<Self>) -> VideoResult<()> {
        self.done = true;
        // Closing stdin signals end of input
        self.stdin.take();
        let status = self.child.wait()?;
        let stderr = join_stderr(self.stderr.take());

        if status.success() {
            debug!("Encoded {}", self.path.display());
            Ok(())
        } else {
            let _ = std::fs::remove_file(&self.path);
            Err(VideoError::Encode(format!("ffmpeg exited with {status}: {stderr}")))
        }
    }

    fn abort(mut self: Box<Self>) {
        self.discard();
    }
}

impl Drop for FfmpegFrameWriter {
    fn drop(&mut self) {
        if !self.done {
            self.discard();
        }
    }
}

/// [`VideoBackend`] over the `ffmpeg` and `ffprobe` binaries
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Whether `ffmpeg` can be executed
    #[must_use]
    pub fn is_available() -> bool {
        Command::new("ffmpeg")
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }
}

impl VideoBackend for FfmpegBackend {
    fn probe(&self, path: &Path) -> VideoResult<VideoProbe> {
        probe_file(path)
    }

    fn open_source(&self, path: &Path, probe: &VideoProbe) -> VideoResult<Box<dyn FrameSource>> {
        Ok(Box::new(FfmpegFrameReader::open(
            path,
            probe.width,
            probe.height,
        )?))
    }

    fn open_sink(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: f64,
    ) -> VideoResult<Box<dyn FrameSink>> {
        Ok(Box::new(FfmpegFrameWriter::create(path, width, height, fps)?))
    }

    fn remux(&self, input: &Path, output: &Path) -> VideoResult<()> {
        let result = Command::new("ffmpeg")
            .args(["-y", "-v", "error", "-nostdin", "-i"])
            .arg(input)
            .args(["-c", "copy", "-movflags", "faststart"])
            .arg(output)
            .output()
            .map_err(|e| VideoError::Remux(format!("Failed to execute ffmpeg: {e}")))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(VideoError::Remux(format!(
                "{}: {}",
                input.display(),
                stderr.trim()
            )));
        }

        debug!("Remuxed {} -> {}", input.display(), output.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_remux() {
        if !FfmpegBackend::is_available() {
            eprintln!("ffmpeg not available, skipping");
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let encoded = dir.path().join("encoded.mp4");
        let remuxed = dir.path().join("remuxed.mp4");
        let backend = FfmpegBackend::new();

        let mut sink = backend.open_sink(&encoded, 64, 48, 10.0).unwrap();
        for i in 0..10u8 {
            let frame = RgbImage::from_pixel(64, 48, image::Rgb([i * 20, 100, 200]));
            sink.write_frame(&frame).unwrap();
        }
        sink.finish().unwrap();

        backend.remux(&encoded, &remuxed).unwrap();

        let probe = backend.probe(&remuxed).unwrap();
        assert_eq!((probe.width, probe.height), (64, 48));

        let mut source = backend.open_source(&remuxed, &probe).unwrap();
        let mut frames = 0;
        while source.next_frame().unwrap().is_some() {
            frames += 1;
        }
        assert_eq!(frames, 10);
    }

    #[test]
    fn test_abort_removes_output() {
        if !FfmpegBackend::is_available() {
            eprintln!("ffmpeg not available, skipping");
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aborted.mp4");
        let mut sink = FfmpegBackend::new().open_sink(&path, 32, 32, 30.0).unwrap();
        sink.write_frame(&RgbImage::new(32, 32)).unwrap();
        sink.abort();
        assert!(!path.exists());
    }

    #[test]
    fn test_writer_rejects_wrong_frame_size() {
        if !FfmpegBackend::is_available() {
            eprintln!("ffmpeg not available, skipping");
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let mut sink = FfmpegBackend::new()
            .open_sink(&dir.path().join("x.mp4"), 32, 32, 30.0)
            .unwrap();
        assert!(matches!(
            sink.write_frame(&RgbImage::new(16, 16)),
            Err(VideoError::Encode(_))
        ));
        sink.abort();
    }

    #[test]
    fn test_remux_missing_input() {
        if !FfmpegBackend::is_available() {
            eprintln!("ffmpeg not available, skipping");
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let err = FfmpegBackend::new()
            .remux(&dir.path().join("missing.mp4"), &dir.path().join("out.mp4"))
            .unwrap_err();
        assert!(matches!(err, VideoError::Remux(_)));
    }
}
