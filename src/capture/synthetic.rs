//! Deterministic generated source: a bright square sliding over a dark field

use image::{Rgb, RgbImage};

use crate::capture::source::{FrameSource, SourceInfo, SourceRead};
use crate::error::SourceError;

pub struct SyntheticSource {
    width: u32,
    height: u32,
    total_frames: u64,
    fps: f64,
    square: u32,
    position: u64,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, total_frames: u64, fps: f64) -> Self {
        Self {
            width,
            height,
            total_frames,
            fps,
            square: (width.min(height) / 6).max(1),
            position: 0,
        }
    }

    /// Square's top-left corner for a frame index
    pub fn square_origin(&self, position: u64) -> (u32, u32) {
        let span = self.width.saturating_sub(self.square).max(1) as u64;
        let x = (position * 4) % span;
        let y = self.height.saturating_sub(self.square) / 2;
        (x as u32, y)
    }

    fn render(&self, position: u64) -> RgbImage {
        let (sx, sy) = self.square_origin(position);
        let mut img = RgbImage::from_pixel(self.width, self.height, Rgb([16, 16, 16]));
        for y in sy..(sy + self.square).min(self.height) {
            for x in sx..(sx + self.square).min(self.width) {
                img.put_pixel(x, y, Rgb([230, 230, 230]));
            }
        }
        img
    }
}

impl FrameSource for SyntheticSource {
    fn info(&self) -> SourceInfo {
        SourceInfo {
            name: "synthetic".into(),
            total_frames: self.total_frames,
            fps: self.fps,
            width: self.width,
            height: self.height,
        }
    }

    fn read(&mut self) -> Result<SourceRead, SourceError> {
        if self.position >= self.total_frames {
            return Ok(SourceRead::EndOfStream);
        }
        let img = self.render(self.position);
        self.position += 1;
        Ok(SourceRead::Frame(img))
    }

    fn seek(&mut self, position: u64) -> Result<(), SourceError> {
        if position > self.total_frames {
            return Err(SourceError::SeekOutOfRange(position));
        }
        self.position = position;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }
}
