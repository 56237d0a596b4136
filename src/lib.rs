pub mod capture;
pub mod detection;
pub mod display;
pub mod error;
pub mod motion;
pub mod pipeline;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{Frame, FrameSource};
pub use detection::{Detection, DetectionParams, DetectionResult};
pub use error::{ErrorKind, PipelineError};

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub queues: QueueConfig,
    pub playback: PlaybackConfig,
    pub detection: DetectionConfig,
    pub motion: MotionConfig,
    pub compositor: CompositorConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Capacity of the display, detection and motion frame queues
    pub frame_capacity: usize,
    pub motion_result_capacity: usize,
    /// Bound on each worker's notification channel
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Base scheduling interval at 1x speed
    pub tick_ms: u64,
    /// Every Nth frame id goes to the detection queue
    pub decimation: u64,
    pub speed: f64,
    pub motion_enabled: bool,
    pub detection_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub backoff_ms: u64,
    pub jpeg_quality: u8,
    /// Upper bound on a declared response length
    pub max_message_bytes: usize,
    pub params: DetectionParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Gaussian sigma of the smoothing pass (3.5 ~ a 21x21 kernel)
    pub blur_sigma: f32,
    /// Per-pixel intensity change that counts as motion
    pub diff_threshold: u8,
    /// Fraction of changed pixels above which movement is reported
    pub min_changed_ratio: f32,
}

/// Which result fills the "last valid" slot when results arrive out of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastValidPolicy {
    /// Most recently received result, regardless of frame id
    #[default]
    LastWrite,
    /// Result with the highest frame id seen so far
    HighestFrame,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositorConfig {
    pub cache_capacity: usize,
    /// Maximum frame distance over which a stale result is still drawn
    pub persistence_window: u64,
    pub last_valid_policy: LastValidPolicy,
    /// TTF/OTF font for label text; labels are background-only without one
    pub font_path: Option<PathBuf>,
    pub label_scale: f32,
    pub box_thickness: u32,
    /// Opacity of the label background
    pub label_opacity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    pub join_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queues: QueueConfig {
                frame_capacity: 50,
                motion_result_capacity: 50,
                event_capacity: 256,
            },
            playback: PlaybackConfig {
                tick_ms: 33, // ~30fps
                decimation: 3,
                speed: 1.0,
                motion_enabled: false,
                detection_enabled: true,
            },
            detection: DetectionConfig {
                host: "localhost".into(),
                port: 8888,
                connect_timeout_ms: 3000,
                response_timeout_ms: 5000,
                backoff_ms: 5000,
                jpeg_quality: 95,
                max_message_bytes: 64 * 1024 * 1024,
                params: DetectionParams::default(),
            },
            motion: MotionConfig {
                blur_sigma: 3.5,
                diff_threshold: 25,
                min_changed_ratio: 0.002,
            },
            compositor: CompositorConfig {
                cache_capacity: 100,
                persistence_window: 15,
                last_valid_policy: LastValidPolicy::LastWrite,
                font_path: None,
                label_scale: 20.0,
                box_thickness: 3,
                label_opacity: 0.3,
            },
            shutdown: ShutdownConfig {
                join_timeout_ms: 2000,
            },
        }
    }
}

impl Config {
    /// Defaults, then an optional TOML file, then `ARGUS_*` environment
    /// variables (`ARGUS_DETECTION__PORT=9000`).
    pub fn load(path: Option<&Path>) -> error::Result<Self> {
        let defaults = config::Config::try_from(&Config::default())
            .map_err(|e| PipelineError::Config(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("ARGUS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> error::Result<()> {
        let fail = |msg: &str| Err(PipelineError::Config(msg.to_string()));

        if self.queues.frame_capacity == 0 || self.queues.motion_result_capacity == 0 {
            return fail("queue capacity must be at least 1");
        }
        if self.queues.event_capacity == 0 {
            return fail("event capacity must be at least 1");
        }
        if self.playback.decimation == 0 {
            return fail("decimation factor must be at least 1");
        }
        if !(self.playback.speed > 0.0) {
            return fail("playback speed must be positive");
        }
        let conf = self.detection.params.confidence_threshold;
        if !(conf > 0.0 && conf <= 1.0) {
            return fail("confidence threshold must be in (0, 1]");
        }
        if self.compositor.cache_capacity == 0 {
            return fail("detection cache capacity must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.compositor.label_opacity) {
            return fail("label opacity must be in [0, 1]");
        }
        Ok(())
    }
}

impl PlaybackConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl DetectionConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl ShutdownConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}
