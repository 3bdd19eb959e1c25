//! Video decode, encode, remux and frame annotation
//!
//! The frame loop only sees the [`VideoBackend`] trait: probe a file, pull
//! RGB frames from a [`FrameSource`], push RGB frames into a [`FrameSink`],
//! and remux a finished file into a streaming-friendly MP4. [`FfmpegBackend`]
//! implements it with `ffprobe`/`ffmpeg` child processes exchanging raw
//! `rgb24` frames over pipes.
//!
//! # Example
//! ```no_run
//! use std::path::Path;
//! use video_track_video::{FfmpegBackend, VideoBackend};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = FfmpegBackend::new();
//! let probe = backend.probe(Path::new("input.mp4"))?;
//! let mut source = backend.open_source(Path::new("input.mp4"), &probe)?;
//! let mut sink = backend.open_sink(Path::new("copy.mp4"), probe.width, probe.height, probe.fps)?;
//!
//! while let Some(frame) = source.next_frame()? {
//!     sink.write_frame(&frame)?;
//! }
//! sink.finish()?;
//! backend.remux(Path::new("copy.mp4"), Path::new("copy_faststart.mp4"))?;
//! # Ok(())
//! # }
//! ```

pub mod annotate;
pub mod ffmpeg;
pub mod probe;

use image::RgbImage;
use std::path::Path;
use thiserror::Error;

pub use annotate::Annotator;
pub use ffmpeg::{FfmpegBackend, FfmpegFrameReader, FfmpegFrameWriter};
pub use probe::{parse_frame_rate, VideoProbe};

/// Errors from video processing
#[derive(Error, Debug)]
pub enum VideoError {
    #[error("ffprobe failed: {0}")]
    Probe(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Remux failed: {0}")]
    Remux(String),

    #[error("Font error: {0}")]
    Font(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for video operations
pub type VideoResult<T> = Result<T, VideoError>;

/// Sequential source of decoded frames
pub trait FrameSource: Send {
    /// Next frame, or `None` once the stream is exhausted
    fn next_frame(&mut self) -> VideoResult<Option<RgbImage>>;
}

/// Sequential sink of frames to encode
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &RgbImage) -> VideoResult<()>;

    /// Flush and close the output file
    fn finish(self: Box<Self>) -> VideoResult<()>;

    /// Stop encoding and discard the output file
    fn abort(self: Box<Self>);
}

/// Video codec operations used by the pipeline
pub trait VideoBackend: Send + Sync {
    fn probe(&self, path: &Path) -> VideoResult<VideoProbe>;

    fn open_source(&self, path: &Path, probe: &VideoProbe) -> VideoResult<Box<dyn FrameSource>>;

    fn open_sink(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: f64,
    ) -> VideoResult<Box<dyn FrameSink>>;

    /// Rewrite `input` into `output` without re-encoding
    fn remux(&self, input: &Path, output: &Path) -> VideoResult<()>;
}
