//! Frame-id keyed store of detection results with a persistence window

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::detection::DetectionResult;
use crate::{CompositorConfig, LastValidPolicy};

/// How the overlay for a frame was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayTag {
    /// Result computed for this exact frame
    Live,
    /// Reused from a frame this many ids earlier
    Age(u64),
}

impl OverlayTag {
    pub fn age(self) -> u64 {
        match self {
            OverlayTag::Live => 0,
            OverlayTag::Age(n) => n,
        }
    }
}

impl fmt::Display for OverlayTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlayTag::Live => write!(f, "LIVE"),
            OverlayTag::Age(n) => write!(f, "AGE:{}", n),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub result: Arc<DetectionResult>,
    pub tag: OverlayTag,
}

/// Owned by the display loop only; results reach it by message passing.
pub struct DetectionCache {
    results: HashMap<u64, Arc<DetectionResult>>,
    /// Insertion order, oldest first
    order: VecDeque<u64>,
    last_valid: Option<Arc<DetectionResult>>,
    capacity: usize,
    persistence_window: u64,
    policy: LastValidPolicy,
}

impl DetectionCache {
    pub fn new(capacity: usize, persistence_window: u64, policy: LastValidPolicy) -> Self {
        Self {
            results: HashMap::with_capacity(capacity + 1),
            order: VecDeque::with_capacity(capacity + 1),
            last_valid: None,
            capacity: capacity.max(1),
            persistence_window,
            policy,
        }
    }

    pub fn from_config(config: &CompositorConfig) -> Self {
        Self::new(
            config.cache_capacity,
            config.persistence_window,
            config.last_valid_policy,
        )
    }

    /// Store a result. Failed results are ignored; returns whether it was kept.
    pub fn insert(&mut self, result: DetectionResult) -> bool {
        if !result.is_valid() {
            return false;
        }
        let frame_id = result.frame_id;
        let result = Arc::new(result);

        if self.results.insert(frame_id, Arc::clone(&result)).is_none() {
            self.order.push_back(frame_id);
        }

        let replace = match (self.policy, &self.last_valid) {
            (LastValidPolicy::LastWrite, _) | (_, None) => true,
            (LastValidPolicy::HighestFrame, Some(current)) => frame_id >= current.frame_id,
        };
        if replace {
            self.last_valid = Some(result);
        }

        while self.results.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.results.remove(&oldest);
            trace!("Evicted result for frame {}", oldest);
        }
        true
    }

    /// Pick the overlay for frame `frame_id`: its own result, else the last
    /// valid one if it is at most `persistence_window` frames older.
    pub fn select(&self, frame_id: u64) -> Option<Selection> {
        if let Some(result) = self.results.get(&frame_id) {
            return Some(Selection {
                result: Arc::clone(result),
                tag: OverlayTag::Live,
            });
        }

        let last = self.last_valid.as_ref()?;
        let age = frame_id.checked_sub(last.frame_id)?;
        (age <= self.persistence_window).then(|| Selection {
            result: Arc::clone(last),
            tag: if age == 0 {
                OverlayTag::Live
            } else {
                OverlayTag::Age(age)
            },
        })
    }

    pub fn get(&self, frame_id: u64) -> Option<&DetectionResult> {
        self.results.get(&frame_id).map(|r| r.as_ref())
    }

    pub fn last_valid(&self) -> Option<&DetectionResult> {
        self.last_valid.as_deref()
    }

    /// Number of objects across every cached result
    pub fn total_detections(&self) -> usize {
        self.results.values().map(|r| r.detections.len()).sum()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn clear(&mut self) {
        self.results.clear();
        self.order.clear();
        self.last_valid = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BoundingBox, Detection};

    fn result(frame_id: u64, objects: usize) -> DetectionResult {
        DetectionResult {
            frame_id,
            processing_latency_ms: 40.0,
            detections: (0..objects)
                .map(|i| Detection {
                    class_id: 0,
                    label: "person".into(),
                    confidence: 0.9,
                    bbox: BoundingBox {
                        x: i as i32,
                        y: 0,
                        width: 10,
                        height: 10,
                    },
                })
                .collect(),
            success: true,
        }
    }

    #[test]
    fn evicts_oldest_inserted_beyond_capacity() {
        let mut cache = DetectionCache::new(3, 15, LastValidPolicy::LastWrite);
        for id in [10, 2, 7, 30] {
            cache.insert(result(id, 1));
            assert!(cache.len() <= 3);
        }
        assert!(cache.get(10).is_none(), "first inserted goes first, not lowest id");
        assert!(cache.get(2).is_some());
        assert!(cache.get(30).is_some());
    }

    #[test]
    fn reinsert_does_not_duplicate_order() {
        let mut cache = DetectionCache::new(2, 15, LastValidPolicy::LastWrite);
        cache.insert(result(1, 1));
        cache.insert(result(1, 2));
        cache.insert(result(2, 1));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(1).unwrap().detections.len(), 2);
    }

    #[test]
    fn exact_match_is_live() {
        let mut cache = DetectionCache::new(100, 15, LastValidPolicy::LastWrite);
        cache.insert(result(42, 1));
        let selection = cache.select(42).unwrap();
        assert_eq!(selection.tag, OverlayTag::Live);
        assert_eq!(selection.tag.to_string(), "LIVE");
    }

    #[test]
    fn persistence_window_bounds_reuse() {
        let mut cache = DetectionCache::new(100, 15, LastValidPolicy::LastWrite);
        cache.insert(result(100, 1));

        let selection = cache.select(114).unwrap();
        assert_eq!(selection.result.frame_id, 100);
        assert_eq!(selection.tag, OverlayTag::Age(14));
        assert_eq!(selection.tag.to_string(), "AGE:14");

        assert_eq!(cache.select(115).unwrap().tag.age(), 15);
        assert!(cache.select(116).is_none());
        assert!(cache.select(99).is_none(), "results never apply to earlier frames");
    }

    #[test]
    fn late_result_replaces_last_valid() {
        let mut cache = DetectionCache::new(100, 15, LastValidPolicy::LastWrite);
        cache.insert(result(60, 1));
        cache.insert(result(50, 2));

        let selection = cache.select(62).unwrap();
        assert_eq!(selection.result.frame_id, 50);
        assert_eq!(selection.tag, OverlayTag::Age(12));
        assert_eq!(cache.select(60).unwrap().tag, OverlayTag::Live);
    }

    #[test]
    fn delayed_result_covers_following_frames_on_redraw() {
        let mut cache = DetectionCache::new(100, 15, LastValidPolicy::LastWrite);
        for frame in 50..=60 {
            assert!(cache.select(frame).is_none());
        }

        cache.insert(result(50, 1));
        for frame in 51..=65 {
            assert_eq!(cache.select(frame).unwrap().tag, OverlayTag::Age(frame - 50));
        }
        assert!(cache.select(66).is_none());
    }

    #[test]
    fn highest_frame_policy_keeps_newest() {
        let mut cache = DetectionCache::new(100, 15, LastValidPolicy::HighestFrame);
        cache.insert(result(60, 1));
        cache.insert(result(50, 2));
        assert_eq!(cache.last_valid().unwrap().frame_id, 60);
        assert_eq!(cache.select(62).unwrap().tag, OverlayTag::Age(2));
    }

    #[test]
    fn failed_results_are_not_stored() {
        let mut cache = DetectionCache::new(100, 15, LastValidPolicy::LastWrite);
        let mut failed = result(5, 1);
        failed.success = false;
        assert!(!cache.insert(failed));
        assert!(cache.is_empty());
        assert!(cache.select(5).is_none());
    }

    #[test]
    fn counts_objects_and_clears() {
        let mut cache = DetectionCache::new(100, 15, LastValidPolicy::LastWrite);
        cache.insert(result(1, 2));
        cache.insert(result(2, 3));
        assert_eq!(cache.total_detections(), 5);

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.select(2).is_none());
    }
}
