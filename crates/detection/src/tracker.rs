//! IoU tracker assigning persistent track ids
//!
//! Two-pass association in the ByteTrack manner: confident detections are
//! matched to predicted track boxes first, weaker detections may only extend
//! tracks left unmatched. Only confident detections start new tracks.

use crate::yolo::RawDetection;
use serde::{Deserialize, Serialize};
use tracing::debug;
use video_track_common::{BoundingBox, Detection};

/// Tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// `IoU` needed to match a confident detection to a track
    pub high_iou_threshold: f32,
    /// `IoU` needed to match a weak detection to a track
    pub low_iou_threshold: f32,
    /// Detections at or above this confidence may start tracks
    pub high_confidence: f32,
    /// Frames a track survives without a match
    pub max_age: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            high_iou_threshold: 0.3,
            low_iou_threshold: 0.2,
            high_confidence: 0.5,
            max_age: 30,
        }
    }
}

/// Constant-velocity box state with a fixed gain
#[derive(Debug, Clone)]
struct MotionState {
    /// [x, y, w, h, vx, vy]
    state: [f32; 6],
}

impl MotionState {
    fn new(bbox: &BoundingBox) -> Self {
        Self {
            state: [bbox.x, bbox.y, bbox.width, bbox.height, 0.0, 0.0],
        }
    }

    fn predict(&mut self) {
        self.state[0] += self.state[4];
        self.state[1] += self.state[5];
    }

    fn correct(&mut self, bbox: &BoundingBox) {
        const GAIN: f32 = 0.5;

        let previous = (self.state[0], self.state[1]);
        self.state[0] += GAIN * (bbox.x - self.state[0]);
        self.state[1] += GAIN * (bbox.y - self.state[1]);
        self.state[2] += GAIN * (bbox.width - self.state[2]);
        self.state[3] += GAIN * (bbox.height - self.state[3]);
        self.state[4] = self.state[0] - previous.0;
        self.state[5] = self.state[1] - previous.1;
    }

    fn bbox(&self) -> BoundingBox {
        BoundingBox::new(self.state[0], self.state[1], self.state[2], self.state[3])
    }
}

#[derive(Debug, Clone)]
struct TrackState {
    id: u32,
    motion: MotionState,
    frames_since_update: u32,
}

/// Tracker state for one video
pub struct IouTracker {
    config: TrackerConfig,
    tracks: Vec<TrackState>,
    next_id: u32,
}

impl IouTracker {
    #[must_use]
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::with_capacity(32),
            next_id: 1,
        }
    }

    /// Associate this frame's detections with tracks
    ///
    /// Returns the detections that belong to a track, each with its id.
    pub fn update(&mut self, detections: &[RawDetection], frame_index: u64) -> Vec<Detection> {
        for track in &mut self.tracks {
            track.motion.predict();
            track.frames_since_update += 1;
        }

        let (high, low): (Vec<&RawDetection>, Vec<&RawDetection>) = detections
            .iter()
            .partition(|d| d.confidence >= self.config.high_confidence);

        let mut track_taken = vec![false; self.tracks.len()];
        let mut output = Vec::with_capacity(detections.len());

        let high_matches = self.greedy_match(&high, &track_taken, self.config.high_iou_threshold);
        let mut high_taken = vec![false; high.len()];
        for (track_idx, det_idx) in high_matches {
            track_taken[track_idx] = true;
            high_taken[det_idx] = true;
            output.push(self.apply(track_idx, high[det_idx]));
        }

        let low_matches = self.greedy_match(&low, &track_taken, self.config.low_iou_threshold);
        for (track_idx, det_idx) in low_matches {
            track_taken[track_idx] = true;
            output.push(self.apply(track_idx, low[det_idx]));
        }

        for (det_idx, detection) in high.iter().enumerate() {
            if high_taken[det_idx] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.tracks.push(TrackState {
                id,
                motion: MotionState::new(&detection.bbox),
                frames_since_update: 0,
            });
            output.push(to_detection(id, detection));
        }

        let max_age = self.config.max_age;
        self.tracks.retain(|t| t.frames_since_update <= max_age);

        debug!(
            "Frame {}: {} detections, {} live tracks",
            frame_index,
            output.len(),
            self.tracks.len()
        );
        output
    }

    fn apply(&mut self, track_idx: usize, detection: &RawDetection) -> Detection {
        let track = &mut self.tracks[track_idx];
        track.motion.correct(&detection.bbox);
        track.frames_since_update = 0;
        to_detection(track.id, detection)
    }

    /// Greedy matching, highest `IoU` first
    fn greedy_match(
        &self,
        detections: &[&RawDetection],
        track_taken: &[bool],
        iou_threshold: f32,
    ) -> Vec<(usize, usize)> {
        let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
        for (track_idx, track) in self.tracks.iter().enumerate() {
            if track_taken[track_idx] {
                continue;
            }
            let predicted = track.motion.bbox();
            for (det_idx, detection) in detections.iter().enumerate() {
                let iou = predicted.iou(&detection.bbox);
                if iou > iou_threshold {
                    candidates.push((iou, track_idx, det_idx));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut used_tracks = vec![false; self.tracks.len()];
        let mut used_dets = vec![false; detections.len()];
        let mut matches = Vec::with_capacity(candidates.len().min(detections.len()));
        for (_, track_idx, det_idx) in candidates {
            if used_tracks[track_idx] || used_dets[det_idx] {
                continue;
            }
            used_tracks[track_idx] = true;
            used_dets[det_idx] = true;
            matches.push((track_idx, det_idx));
        }
        matches
    }
}

fn to_detection(track_id: u32, detection: &RawDetection) -> Detection {
    Detection {
        track_id,
        class_label: detection.class_name.clone(),
        confidence: detection.confidence,
        bbox: detection.bbox,
    }
}
