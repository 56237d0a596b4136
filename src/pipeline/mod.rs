pub mod playback;
pub mod queue;
pub mod worker;

pub use playback::{
    playback_interval, FrameQueues, PlaybackCommand, PlaybackController, PlaybackEvent,
    PlaybackState, PlaybackWorker, SeekTarget,
};
pub use queue::{BoundedQueue, QueueStats};
pub use worker::{notify, JoinOutcome, StopFlag, WorkerHandle};
