use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

/// Frame data with zero-copy semantics
///
/// Cloning a frame shares the pixel buffer; fan-out to several queues never
/// copies pixels, and nothing mutates a frame after the playback worker builds it.
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// When the playback worker produced the frame, for latency tracking
    pub produced_at: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Pipeline-assigned sequence id, monotonically increasing from 0
    pub id: u64,
    /// Position inside the source, in seconds
    pub timestamp: f64,
    /// Index of the frame inside the source
    pub position: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

impl Frame {
    pub fn from_rgb(id: u64, timestamp: f64, position: u64, image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: Bytes::from(image.into_raw()),
            meta: Arc::new(FrameMetadata {
                id,
                timestamp,
                position,
                width,
                height,
                format: PixelFormat::Rgb24,
            }),
            produced_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    /// A frame is usable when it carries exactly one image worth of pixels.
    pub fn is_valid(&self) -> bool {
        let expected = self.meta.width as usize
            * self.meta.height as usize
            * self.meta.format.bytes_per_pixel();
        expected > 0 && self.data.len() == expected
    }

    /// Copy the pixels out as an RGB image.
    pub fn to_rgb(&self) -> Option<RgbImage> {
        if !self.is_valid() {
            return None;
        }
        let (w, h) = (self.meta.width, self.meta.height);
        match self.meta.format {
            PixelFormat::Rgb24 => RgbImage::from_raw(w, h, self.data.to_vec()),
            PixelFormat::Gray8 => {
                let gray = GrayImage::from_raw(w, h, self.data.to_vec())?;
                Some(image::DynamicImage::ImageLuma8(gray).to_rgb8())
            }
        }
    }

    /// Single intensity channel view of the frame.
    pub fn to_gray(&self) -> Option<GrayImage> {
        if !self.is_valid() {
            return None;
        }
        match self.meta.format {
            PixelFormat::Gray8 => {
                GrayImage::from_raw(self.meta.width, self.meta.height, self.data.to_vec())
            }
            PixelFormat::Rgb24 => self.to_rgb().map(|rgb| image::imageops::grayscale(&rgb)),
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Frame[ID:{}, Time:{:.3}s, Number:{}, Size:{}x{}]",
            self.meta.id, self.meta.timestamp, self.meta.position, self.meta.width, self.meta.height
        )
    }
}
