//! Local motion analysis on sampled frames

mod frame_diff;
mod worker;

use image::GrayImage;

pub use frame_diff::FrameDifference;
pub use worker::{preprocess, MotionController, MotionWorker};

/// What a motion pass found on one smoothed frame
#[derive(Debug, Clone)]
pub struct MotionOutcome {
    pub movement_detected: bool,
    /// Binary mask, 255 where the image changed
    pub mask: GrayImage,
}

impl MotionOutcome {
    pub fn still(width: u32, height: u32) -> Self {
        Self {
            movement_detected: false,
            mask: GrayImage::new(width, height),
        }
    }
}

/// Motion analysis algorithm plugged into the worker.
pub trait MotionCapability: Send {
    fn detect(&mut self, image: &GrayImage) -> MotionOutcome;

    /// Drop any state carried between frames, e.g. after a seek.
    fn reset(&mut self) {}
}

/// Emitted only for frames where movement was found
#[derive(Debug, Clone)]
pub struct MotionResult {
    pub frame_id: u64,
    pub mask: GrayImage,
}

impl MotionResult {
    /// Number of pixels set in the mask
    pub fn changed_pixels(&self) -> usize {
        self.mask.pixels().filter(|p| p[0] > 0).count()
    }
}
