//! Lifecycle of detected objects during one task's frame loop
//!
//! An occurrence is created the first time a track id passes the class
//! filter and extended on every later observation. Nothing is evicted; the
//! registry is owned by a single run and dropped with it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use video_track_common::Detection;

/// Position of the current frame in the input
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameContext {
    pub frame_index: u64,
    /// `frame_index / fps`
    pub time_secs: f64,
}

impl FrameContext {
    #[must_use]
    pub fn new(frame_index: u64, fps: f64) -> Self {
        let time_secs = if fps > 0.0 {
            frame_index as f64 / fps
        } else {
            0.0
        };
        Self {
            frame_index,
            time_secs,
        }
    }
}

/// One tracked object across the frames it was seen in
#[derive(Debug, Clone, PartialEq)]
pub struct TrackOccurrence {
    pub track_id: u32,
    /// Label of the latest observation
    pub class_label: String,
    pub start_frame: u64,
    pub start_time: f64,
    pub end_frame: u64,
    pub end_time: f64,
    pub confidence_samples: Vec<f32>,
    /// Where this track's clip is encoded
    pub clip_path: PathBuf,
}

impl TrackOccurrence {
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    #[must_use]
    pub fn mean_confidence(&self) -> f32 {
        if self.confidence_samples.is_empty() {
            return 0.0;
        }
        self.confidence_samples.iter().sum::<f32>() / self.confidence_samples.len() as f32
    }

    /// Tracks seen for no measurable time are left out of the report and summary
    #[must_use]
    pub fn is_reportable(&self) -> bool {
        self.duration() > 0.0
    }
}

/// Track occurrences of one task, in first-observed order
#[derive(Debug)]
pub struct TrackRegistry {
    task_id: String,
    clip_dir: PathBuf,
    order: Vec<u32>,
    tracks: HashMap<u32, TrackOccurrence>,
}

impl TrackRegistry {
    pub fn new(task_id: impl Into<String>, clip_dir: impl Into<PathBuf>) -> Self {
        Self {
            task_id: task_id.into(),
            clip_dir: clip_dir.into(),
            order: Vec::new(),
            tracks: HashMap::new(),
        }
    }

    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    #[must_use]
    pub fn clip_dir(&self) -> &Path {
        &self.clip_dir
    }

    /// Record an observation of `track_id`
    ///
    /// Returns the occurrence and whether this call created it.
    pub fn upsert(
        &mut self,
        track_id: u32,
        detection: &Detection,
        frame: FrameContext,
    ) -> (&TrackOccurrence, bool) {
        let mut created = false;
        let clip_dir = &self.clip_dir;
        let order = &mut self.order;

        let occurrence = self.tracks.entry(track_id).or_insert_with(|| {
            created = true;
            order.push(track_id);
            TrackOccurrence {
                track_id,
                class_label: detection.class_label.clone(),
                start_frame: frame.frame_index,
                start_time: frame.time_secs,
                end_frame: frame.frame_index,
                end_time: frame.time_secs,
                confidence_samples: Vec::new(),
                clip_path: clip_dir.join(format!("{track_id}.mp4")),
            }
        });

        if !created {
            occurrence.end_frame = frame.frame_index;
            occurrence.end_time = frame.time_secs;
            if occurrence.class_label != detection.class_label {
                occurrence.class_label.clone_from(&detection.class_label);
            }
        }
        occurrence.confidence_samples.push(detection.confidence);

        (&*occurrence, created)
    }

    #[must_use]
    pub fn get(&self, track_id: u32) -> Option<&TrackOccurrence> {
        self.tracks.get(&track_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Every occurrence in first-observed order
    #[must_use]
    pub fn all(&self) -> Vec<&TrackOccurrence> {
        self.order
            .iter()
            .filter_map(|id| self.tracks.get(id))
            .collect()
    }

    /// Consume the registry, keeping first-observed order
    #[must_use]
    pub fn into_occurrences(mut self) -> Vec<TrackOccurrence> {
        self.order
            .iter()
            .filter_map(|id| self.tracks.remove(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use video_track_common::BoundingBox;

    fn detection(class_label: &str, confidence: f32) -> Detection {
        Detection {
            track_id: 0,
            class_label: class_label.to_string(),
            confidence,
            bbox: BoundingBox::new(0.1, 0.1, 0.2, 0.2),
        }
    }

    #[test]
    fn test_occurrence_over_frames_10_to_40() {
        let mut registry = TrackRegistry::new("T", "/tmp/clips");
        let mut expected_sum = 0.0f32;

        for frame in 10..=40u64 {
            let confidence = 0.5 + (frame % 5) as f32 * 0.1;
            expected_sum += confidence;
            let (_, created) =
                registry.upsert(3, &detection("car", confidence), FrameContext::new(frame, 30.0));
            assert_eq!(created, frame == 10);
        }

        let occurrence = registry.get(3).unwrap();
        assert_eq!(occurrence.start_frame, 10);
        assert_eq!(occurrence.end_frame, 40);
        assert!((occurrence.duration() - 1.0).abs() < 1e-9);
        assert!((occurrence.mean_confidence() - expected_sum / 31.0).abs() < 1e-6);
        assert_eq!(occurrence.clip_path, PathBuf::from("/tmp/clips/3.mp4"));
        assert!(occurrence.is_reportable());
    }

    #[test]
    fn test_first_observed_order() {
        let mut registry = TrackRegistry::new("T", "clips");
        registry.upsert(9, &detection("a", 0.9), FrameContext::new(0, 30.0));
        registry.upsert(2, &detection("b", 0.9), FrameContext::new(1, 30.0));
        registry.upsert(9, &detection("a", 0.9), FrameContext::new(2, 30.0));
        registry.upsert(5, &detection("c", 0.9), FrameContext::new(3, 30.0));

        let ids: Vec<u32> = registry.all().iter().map(|o| o.track_id).collect();
        assert_eq!(ids, vec![9, 2, 5]);

        let ids: Vec<u32> = registry
            .into_occurrences()
            .iter()
            .map(|o| o.track_id)
            .collect();
        assert_eq!(ids, vec![9, 2, 5]);
    }

    #[test]
    fn test_class_label_last_write_wins() {
        let mut registry = TrackRegistry::new("T", "clips");
        registry.upsert(1, &detection("cat", 0.6), FrameContext::new(0, 25.0));
        let (occurrence, created) =
            registry.upsert(1, &detection("dog", 0.8), FrameContext::new(1, 25.0));

        assert!(!created);
        assert_eq!(occurrence.class_label, "dog");
        assert_eq!(occurrence.confidence_samples, vec![0.6, 0.8]);
    }

    #[test]
    fn test_single_frame_track_not_reportable() {
        let mut registry = TrackRegistry::new("T", "clips");
        let (occurrence, _) = registry.upsert(4, &detection("logo", 0.7), FrameContext::new(12, 30.0));
        assert_eq!(occurrence.duration(), 0.0);
        assert!(!occurrence.is_reportable());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_frame_context_time() {
        let ctx = FrameContext::new(60, 30.0);
        assert!((ctx.time_secs - 2.0).abs() < 1e-12);
        assert_eq!(FrameContext::new(5, 0.0).time_secs, 0.0);
    }
}
