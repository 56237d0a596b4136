pub mod cache;
pub mod compositor;
pub mod render;

pub use cache::{DetectionCache, OverlayTag, Selection};
pub use compositor::{Composited, Compositor, FpsCounter};
pub use render::Renderer;
