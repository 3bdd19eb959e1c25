//! Detection and tracking capability for the video tracking pipeline
//!
//! A detection module is a YOLO model exported to ONNX and dropped into the
//! model directory. [`OnnxModelFactory`] discovers the modules, and each
//! created capability pairs a [`YoloDetector`] with an [`IouTracker`] so that
//! detections carry a track id that stays stable across consecutive frames.
//!
//! # Example
//! ```no_run
//! use video_track_detection::{DetectorConfig, DetectorFactory, OnnxModelFactory};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = OnnxModelFactory::new(DetectorConfig::default());
//! let module = factory.resolve(Some("logo")).ok_or("unknown module")?;
//! let mut capability = factory.create(&module)?;
//!
//! let frame = image::open("frame.jpg")?.to_rgb8();
//! for detection in capability.detect(&frame, 0)? {
//!     println!("#{} {} {:.2}", detection.track_id, detection.class_label, detection.confidence);
//! }
//! # Ok(())
//! # }
//! ```

pub mod factory;
pub mod tracker;
pub mod yolo;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use video_track_common::Detection;

pub use factory::OnnxModelFactory;
pub use tracker::{IouTracker, TrackerConfig};
pub use yolo::{RawDetection, YoloConfig, YoloDetector, COCO_CLASSES};

/// Error types for detection
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Unknown detection module: {0}")]
    UnknownModule(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Invalid class list: {0}")]
    ClassList(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for detection operations
pub type DetectionResult<T> = Result<T, DetectionError>;

/// Per-frame detection with tracking continuity
///
/// Frames must be passed in order; the capability keeps the state needed to
/// hand out the same `track_id` for the same object in consecutive frames.
pub trait DetectionCapability: Send {
    fn detect(&mut self, frame: &RgbImage, frame_index: u64) -> DetectionResult<Vec<Detection>>;
}

/// Creates detection capabilities keyed by module name
pub trait DetectorFactory: Send + Sync {
    /// Names of the available modules
    fn modules(&self) -> Vec<String>;

    /// Map a requested module (or none, for the default) to an available one
    fn resolve(&self, module_name: Option<&str>) -> Option<String>;

    /// Class names a module can report
    fn class_names(&self, module: &str) -> Option<Vec<String>>;

    /// Build a fresh capability with empty tracking state
    fn create(&self, module: &str) -> DetectionResult<Box<dyn DetectionCapability>>;
}

/// Detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Directory holding `*.onnx` models and optional `<model>.yaml` class lists
    pub model_dir: PathBuf,

    /// Module used when a task names none
    pub default_module: Option<String>,

    pub yolo: YoloConfig,

    pub tracker: TrackerConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_dir: std::env::var("MODEL_DIR")
                .map_or_else(|_| PathBuf::from("models"), PathBuf::from),
            default_module: std::env::var("DEFAULT_MODULE").ok(),
            yolo: YoloConfig::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

/// A YOLO detector followed by the IoU tracker
pub struct TrackedDetector {
    detector: YoloDetector,
    tracker: IouTracker,
}

impl TrackedDetector {
    #[must_use]
    pub fn new(detector: YoloDetector, tracker: IouTracker) -> Self {
        Self { detector, tracker }
    }
}

impl DetectionCapability for TrackedDetector {
    fn detect(&mut self, frame: &RgbImage, frame_index: u64) -> DetectionResult<Vec<Detection>> {
        let raw = self.detector.detect(frame)?;
        Ok(self.tracker.update(&raw, frame_index))
    }
}
