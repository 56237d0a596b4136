//! Still-image sequence source: every PNG/JPEG in a directory, in file-name order

use std::path::{Path, PathBuf};

use tracing::info;

use crate::capture::source::{FrameSource, SourceInfo, SourceRead};
use crate::error::SourceError;

const EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

pub struct ImageSequenceSource {
    name: String,
    files: Vec<PathBuf>,
    fps: f64,
    width: u32,
    height: u32,
    position: u64,
}

impl ImageSequenceSource {
    /// Scan `dir` for image files. Dimensions come from the first file.
    pub fn open(dir: &Path, fps: f64) -> Result<Self, SourceError> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_image {
                files.push(path);
            }
        }
        files.sort();

        let (width, height) = match files.first() {
            Some(first) => image::image_dimensions(first)
                .map_err(|e| SourceError::Read(format!("{}: {e}", first.display())))?,
            None => (0, 0),
        };

        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string());
        info!("Opened image sequence {}: {} frames", name, files.len());

        Ok(Self {
            name,
            files,
            fps,
            width,
            height,
            position: 0,
        })
    }
}

impl FrameSource for ImageSequenceSource {
    fn info(&self) -> SourceInfo {
        SourceInfo {
            name: self.name.clone(),
            total_frames: self.files.len() as u64,
            fps: self.fps,
            width: self.width,
            height: self.height,
        }
    }

    fn read(&mut self) -> Result<SourceRead, SourceError> {
        let Some(path) = self.files.get(self.position as usize) else {
            return Ok(SourceRead::EndOfStream);
        };
        if !path.exists() {
            return Err(SourceError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} disappeared", path.display()),
            )));
        }
        let img = image::open(path)
            .map_err(|e| SourceError::Read(format!("{}: {e}", path.display())))?
            .to_rgb8();
        self.position += 1;
        Ok(SourceRead::Frame(img))
    }

    fn seek(&mut self, position: u64) -> Result<(), SourceError> {
        if position > self.files.len() as u64 {
            return Err(SourceError::SeekOutOfRange(position));
        }
        self.position = position;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }
}
