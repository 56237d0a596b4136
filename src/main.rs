//! Argus video analysis pipeline runner

use std::path::PathBuf;
use std::sync::Arc;

use argus::capture::{FrameSource, ImageSequenceSource, SyntheticSource};
use argus::detection::DetectionController;
use argus::display::Compositor;
use argus::motion::MotionController;
use argus::pipeline::{playback_interval, FrameQueues, PlaybackController, PlaybackEvent};
use argus::Config;
use clap::Parser;
use color_eyre::Result;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Frame pipeline with remote detection and local motion analysis", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of PNG/JPEG frames, played in name order
    #[arg(short, long)]
    frames_dir: Option<PathBuf>,

    /// Frame rate assigned to the source
    #[arg(long, default_value_t = 30.0)]
    fps: f64,

    /// Length of the generated clip when no frame directory is given
    #[arg(long, default_value_t = 300)]
    synthetic: u64,

    /// Enable motion analysis
    #[arg(short, long)]
    motion: bool,

    /// Playback speed multiplier
    #[arg(short, long)]
    speed: Option<f64>,

    /// Log every Nth composited frame
    #[arg(long, default_value_t = 30)]
    log_every: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "argus=info".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Argus launching...");

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if args.motion {
        config.playback.motion_enabled = true;
    }
    if let Some(speed) = args.speed {
        config.playback.speed = speed;
    }
    config.validate()?;

    let source: Box<dyn FrameSource> = match &args.frames_dir {
        Some(dir) => Box::new(ImageSequenceSource::open(dir, args.fps)?),
        None => Box::new(SyntheticSource::new(640, 480, args.synthetic, args.fps)),
    };

    let queues = FrameQueues::new(config.queues.frame_capacity);
    let mut playback = PlaybackController::spawn(&config.playback, queues.clone(), config.queues.event_capacity)?;
    let mut detection = DetectionController::spawn(
        &config.detection,
        Arc::clone(&queues.detection),
        config.queues.event_capacity,
    )?;
    let mut motion = MotionController::spawn(
        &config.motion,
        Arc::clone(&queues.motion),
        config.queues.motion_result_capacity,
    )?;
    let mut compositor = Compositor::new(&config.compositor, Arc::clone(&queues.display))?;

    playback.open(source);
    playback.play();

    let mut interval = tokio::time::interval(playback_interval(config.playback.tick(), config.playback.speed));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut finished = false;
    let mut shown = 0u64;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            _ = interval.tick() => {
                for event in playback.events().try_iter() {
                    match event {
                        PlaybackEvent::Opened(info) => {
                            info!("Opened {}", info);
                            compositor.reset();
                        }
                        PlaybackEvent::Seeked { position } => {
                            debug!("Seeked to {}", position);
                            compositor.reset();
                        }
                        PlaybackEvent::StateChanged(state) => debug!("Playback {:?}", state),
                        PlaybackEvent::Finished => finished = true,
                        PlaybackEvent::Error { kind, message } => {
                            warn!("Playback error ({}): {}", kind, message);
                            finished = true;
                        }
                        PlaybackEvent::FrameReady { .. } | PlaybackEvent::Progress(_) => {}
                    }
                }

                if let Some(composited) = compositor.tick(detection.events()) {
                    shown += 1;
                    if args.log_every > 0 && shown % args.log_every == 0 {
                        info!(
                            "{} | {:.1} FPS | {} objects cached",
                            composited.info_line(),
                            compositor.fps(),
                            compositor.total_detections()
                        );
                    }
                }

                while let Some(result) = motion.results().try_pop() {
                    info!("Movement in frame {} ({} px)", result.frame_id, result.changed_pixels());
                }

                if finished && queues.display.is_empty() {
                    info!("End of stream");
                    break;
                }
            }
        }
    }

    let timeout = config.shutdown.join_timeout();
    playback.shutdown(timeout);
    detection.shutdown(timeout);
    motion.shutdown(timeout);
    queues.close_all();

    if let Some(status) = compositor.status() {
        info!("{}", status);
    }
    info!("Argus shutting down after {} frames", shown);
    Ok(())
}
