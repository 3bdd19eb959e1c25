//! Stream metadata through `ffprobe`

use crate::{VideoError, VideoResult};
use serde::Deserialize;
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Fallback when the container reports no usable frame rate
const DEFAULT_FPS: f64 = 30.0;

/// What the frame loop needs to know about an input video
#[derive(Debug, Clone, PartialEq)]
pub struct VideoProbe {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Frame count reported by the container, or estimated from the duration
    pub total_frames: u64,
    pub duration_secs: f64,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Parse "30000/1001" or "25" into frames per second
#[must_use]
pub fn parse_frame_rate(raw: &str) -> Option<f64> {
    let fps = match raw.split_once('/') {
        Some((num, den)) => {
            let num = num.trim().parse::<f64>().ok()?;
            let den = den.trim().parse::<f64>().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.trim().parse::<f64>().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

/// Run `ffprobe` on a file
pub fn probe_file(path: &Path) -> VideoResult<VideoProbe> {
    if !path.exists() {
        return Err(VideoError::Probe(format!(
            "File not found: {}",
            path.display()
        )));
    }

    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .output()
        .map_err(|e| VideoError::Probe(format!("Failed to execute ffprobe: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(VideoError::Probe(stderr.trim().to_string()));
    }

    let probe = parse_probe_json(&String::from_utf8_lossy(&output.stdout))?;
    debug!(
        "Probed {}: {}x{} @ {:.3} fps, {} frames",
        path.display(),
        probe.width,
        probe.height,
        probe.fps,
        probe.total_frames
    );
    Ok(probe)
}

pub(crate) fn parse_probe_json(json: &str) -> VideoResult<VideoProbe> {
    let parsed: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| VideoError::Probe(format!("Failed to parse ffprobe JSON: {e}")))?;

    let stream = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| VideoError::Probe("No video stream".to_string()))?;

    let width = stream.width.unwrap_or(0);
    let height = stream.height.unwrap_or(0);
    if width == 0 || height == 0 {
        return Err(VideoError::Probe(format!(
            "Invalid frame size {width}x{height}"
        )));
    }

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
        .unwrap_or(DEFAULT_FPS);

    let duration_secs = stream
        .duration
        .as_deref()
        .or_else(|| parsed.format.as_ref().and_then(|f| f.duration.as_deref()))
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let total_frames = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or_else(|| (duration_secs * fps).round().max(0.0) as u64);

    Ok(VideoProbe {
        width,
        height,
        fps,
        total_frames,
        duration_secs,
    })
}
