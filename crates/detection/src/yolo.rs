//! YOLO inference through ONNX Runtime
//!
//! Works with any class count: the output tensor is `(1, 4 + classes, anchors)`
//! and the class list comes from the model's sidecar file or COCO.

use crate::{DetectionError, DetectionResult};
use image::RgbImage;
use ndarray::Array;
use ort::{
    session::{Session, SessionOutputs},
    value::TensorRef,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};
use video_track_common::BoundingBox;

/// Inference configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct YoloConfig {
    /// Minimum confidence threshold for detections (0.0-1.0)
    pub confidence_threshold: f32,
    /// `IoU` threshold for non-maximum suppression (0.0-1.0)
    pub iou_threshold: f32,
    /// Maximum number of detections to return per frame
    pub max_detections: usize,
    /// Square input size of the model
    pub input_size: u32,
}

impl Default for YoloConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
            max_detections: 300,
            input_size: 640,
        }
    }
}

/// Detection before a track id is assigned
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub class_id: usize,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// YOLO detector over one ONNX session
pub struct YoloDetector {
    session: Session,
    config: YoloConfig,
    class_names: Vec<String>,
}

impl YoloDetector {
    /// Load a model from disk
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        class_names: Vec<String>,
        config: YoloConfig,
    ) -> DetectionResult<Self> {
        info!("Loading YOLO model from {:?}", model_path.as_ref());

        let session = Session::builder()
            .map_err(|e| DetectionError::ModelLoad(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| DetectionError::ModelLoad(e.to_string()))?;

        Ok(Self {
            session,
            config,
            class_names,
        })
    }

    /// Detect objects in one frame
    pub fn detect(&mut self, image: &RgbImage) -> DetectionResult<Vec<RawDetection>> {
        let input = preprocess(image, self.config.input_size);

        let input_tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| DetectionError::Inference(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![input_tensor])
            .map_err(|e| DetectionError::Inference(e.to_string()))?;

        let raw = decode_outputs(&outputs, &self.config, &self.class_names)?;
        let detections = non_max_suppression(raw, self.config.iou_threshold);

        debug!("Detected {} objects", detections.len());
        Ok(detections
            .into_iter()
            .take(self.config.max_detections)
            .collect())
    }
}

/// Resize and convert to a normalized `(1, 3, H, W)` tensor
fn preprocess(image: &RgbImage, input_size: u32) -> Array<f32, ndarray::Dim<[usize; 4]>> {
    let resized = image::imageops::resize(
        image,
        input_size,
        input_size,
        image::imageops::FilterType::Triangle,
    );

    let size = input_size as usize;
    let mut input = Array::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        input[[0, 0, y, x]] = f32::from(pixel[0]) / 255.0;
        input[[0, 1, y, x]] = f32::from(pixel[1]) / 255.0;
        input[[0, 2, y, x]] = f32::from(pixel[2]) / 255.0;
    }
    input
}

fn decode_outputs(
    outputs: &SessionOutputs,
    config: &YoloConfig,
    class_names: &[String],
) -> DetectionResult<Vec<RawDetection>> {
    let (shape, data) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| DetectionError::Inference(format!("Failed to extract tensor: {e}")))?;

    let dims = shape.as_ref();
    if dims.len() != 3 || dims[1] < 5 {
        return Err(DetectionError::Inference(format!(
            "Unexpected output shape {dims:?}"
        )));
    }

    let num_features = dims[1] as usize;
    let num_anchors = dims[2] as usize;
    Ok(decode_anchors(data, num_features, num_anchors, config, class_names))
}

/// Turn the `[features, anchors]` layout into thresholded detections
pub(crate) fn decode_anchors(
    data: &[f32],
    num_features: usize,
    num_anchors: usize,
    config: &YoloConfig,
    class_names: &[String],
) -> Vec<RawDetection> {
    let num_classes = num_features - 4;
    let scale = config.input_size as f32;
    let mut detections = Vec::with_capacity(num_anchors / 10);

    for anchor in 0..num_anchors {
        let feature = |index: usize| data[index * num_anchors + anchor];

        let mut best_score = 0.0f32;
        let mut best_class = 0usize;
        for class_id in 0..num_classes {
            let score = feature(4 + class_id);
            if score > best_score {
                best_score = score;
                best_class = class_id;
            }
        }

        if best_score < config.confidence_threshold {
            continue;
        }

        let (cx, cy, w, h) = (feature(0), feature(1), feature(2), feature(3));
        detections.push(RawDetection {
            class_id: best_class,
            class_name: class_names
                .get(best_class)
                .cloned()
                .unwrap_or_else(|| format!("class_{best_class}")),
            confidence: best_score.min(1.0),
            bbox: BoundingBox::new(
                (cx - w / 2.0) / scale,
                (cy - h / 2.0) / scale,
                w / scale,
                h / scale,
            ),
        });
    }

    detections
}

/// Class-aware non-maximum suppression, highest confidence first
pub(crate) fn non_max_suppression(
    mut detections: Vec<RawDetection>,
    iou_threshold: f32,
) -> Vec<RawDetection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<RawDetection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = keep.iter().any(|kept| {
            kept.class_id == candidate.class_id && kept.bbox.iou(&candidate.bbox) >= iou_threshold
        });
        if !suppressed {
            keep.push(candidate);
        }
    }
    keep
}

/// 80 COCO object classes (in order)
pub const COCO_CLASSES: &[&str] = &[
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];
