use image::{GrayImage, Luma};

use super::{MotionCapability, MotionOutcome};
use crate::MotionConfig;

/// Compares each smoothed frame against the one before it.
pub struct FrameDifference {
    threshold: u8,
    min_changed_ratio: f32,
    previous: Option<GrayImage>,
}

impl FrameDifference {
    pub fn new(threshold: u8, min_changed_ratio: f32) -> Self {
        Self {
            threshold,
            min_changed_ratio,
            previous: None,
        }
    }

    pub fn from_config(config: &MotionConfig) -> Self {
        Self::new(config.diff_threshold, config.min_changed_ratio)
    }
}

impl MotionCapability for FrameDifference {
    fn detect(&mut self, image: &GrayImage) -> MotionOutcome {
        let Some(previous) = self.previous.replace(image.clone()) else {
            return MotionOutcome::still(image.width(), image.height());
        };
        if previous.dimensions() != image.dimensions() {
            return MotionOutcome::still(image.width(), image.height());
        }

        let mut changed = 0usize;
        let mask = GrayImage::from_fn(image.width(), image.height(), |x, y| {
            let a = previous.get_pixel(x, y)[0];
            let b = image.get_pixel(x, y)[0];
            if a.abs_diff(b) > self.threshold {
                changed += 1;
                Luma([255])
            } else {
                Luma([0])
            }
        });

        let total = (image.width() as usize * image.height() as usize).max(1);
        let ratio = changed as f32 / total as f32;
        MotionOutcome {
            movement_detected: changed > 0 && ratio >= self.min_changed_ratio,
            mask,
        }
    }

    fn reset(&mut self) {
        self.previous = None;
    }
}
