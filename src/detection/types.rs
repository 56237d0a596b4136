use std::fmt;

use serde::{Deserialize, Serialize};

/// Axis-aligned box in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    /// Build from two corners; `None` unless both extents are positive.
    pub fn from_corners(x1: i32, y1: i32, x2: i32, y2: i32) -> Option<Self> {
        let width = x2.checked_sub(x1)?;
        let height = y2.checked_sub(y1)?;
        (width > 0 && height > 0).then_some(Self {
            x: x1,
            y: y1,
            width,
            height,
        })
    }
}

/// One detected object
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_id: i32,
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn is_valid(&self) -> bool {
        self.class_id >= 0
            && self.confidence > 0.0
            && self.bbox.width > 0
            && self.bbox.height > 0
    }
}

impl fmt::Display for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Detection[{}, {:.2}, ({},{},{},{})]",
            self.label, self.confidence, self.bbox.x, self.bbox.y, self.bbox.width, self.bbox.height
        )
    }
}

/// Everything the remote service reported for one frame
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub frame_id: u64,
    pub processing_latency_ms: f64,
    pub detections: Vec<Detection>,
    pub success: bool,
}

impl DetectionResult {
    pub fn is_valid(&self) -> bool {
        self.success
    }
}

impl fmt::Display for DetectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DetectionResult[Frame:{}, Objects:{}, Time:{:.1}ms, Success:{}]",
            self.frame_id,
            self.detections.len(),
            self.processing_latency_ms,
            if self.success { "Yes" } else { "No" }
        )
    }
}

/// Parameters sent with every request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionParams {
    pub confidence_threshold: f32,
    /// Non-max suppression IoU threshold
    pub nms_threshold: f32,
    pub max_detections: u32,
    /// Class labels to keep; empty keeps everything
    pub target_classes: Vec<String>,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.3,
            nms_threshold: 0.4,
            max_detections: 50,
            target_classes: vec!["person".into(), "car".into()],
        }
    }
}
