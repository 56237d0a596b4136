pub mod client;
pub mod mock;
pub mod protocol;
pub mod types;

pub use client::{ClientCommand, ClientState, ClientStatus, DetectionClient, DetectionController, DetectionEvent};
pub use mock::{MockDetector, MockOptions};
pub use types::{BoundingBox, Detection, DetectionParams, DetectionResult};
