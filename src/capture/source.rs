//! Frame source capability consumed by the playback worker

use image::RgbImage;

use crate::error::SourceError;

/// Static description of an opened source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceInfo {
    pub name: String,
    pub total_frames: u64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

impl SourceInfo {
    /// Total length in seconds
    pub fn duration(&self) -> f64 {
        if self.fps > 0.0 {
            self.total_frames as f64 / self.fps
        } else {
            0.0
        }
    }

    /// Playback progress in [0, 1] for a position index
    pub fn progress(&self, position: u64) -> f64 {
        if self.total_frames == 0 {
            return 0.0;
        }
        (position as f64 / self.total_frames as f64).min(1.0)
    }

    /// Timestamp in seconds of a position index
    pub fn timestamp(&self, position: u64) -> f64 {
        if self.fps > 0.0 {
            position as f64 / self.fps
        } else {
            0.0
        }
    }

    pub fn is_valid(&self) -> bool {
        self.total_frames > 0 && self.fps > 0.0 && self.width > 0 && self.height > 0
    }
}

impl std::fmt::Display for SourceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Video[{}, {}x{}, {:.1}FPS, {:.1}s, {} frames]",
            self.name,
            self.width,
            self.height,
            self.fps,
            self.duration(),
            self.total_frames
        )
    }
}

/// Outcome of a single read
pub enum SourceRead {
    Frame(RgbImage),
    EndOfStream,
}

/// Decoded-frame producer. Decoding itself lives behind this trait.
pub trait FrameSource: Send {
    fn info(&self) -> SourceInfo;

    /// Read the frame at the current position and advance by one.
    fn read(&mut self) -> Result<SourceRead, SourceError>;

    /// Reposition so the next `read` returns the frame at `position`.
    fn seek(&mut self, position: u64) -> Result<(), SourceError>;

    /// Index of the frame the next `read` will return.
    fn position(&self) -> u64;
}
