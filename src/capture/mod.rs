pub mod frame;
pub mod sequence;
pub mod source;
pub mod synthetic;

pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use sequence::ImageSequenceSource;
pub use source::{FrameSource, SourceInfo, SourceRead};
pub use synthetic::SyntheticSource;
