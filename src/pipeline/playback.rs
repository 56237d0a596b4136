//! Frame-producing worker: reads the source on a schedule and fans frames out

use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::capture::{Frame, FrameSource, SourceInfo, SourceRead};
use crate::error::{ErrorKind, SourceError};
use crate::pipeline::queue::BoundedQueue;
use crate::pipeline::worker::{notify, StopFlag, Unblock, WorkerHandle};
use crate::PlaybackConfig;

/// How long an idle (not playing) worker waits for a command before
/// re-checking its stop flag.
const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
    Finished,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeekTarget {
    Frame(u64),
    /// 0.0 - 100.0 of the source length
    Percent(f64),
}

pub enum PlaybackCommand {
    Open(Box<dyn FrameSource>),
    Close,
    Play,
    Pause,
    Seek(SeekTarget),
    SetSpeed(f64),
    SetMotionEnabled(bool),
    SetDetectionEnabled(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Opened(SourceInfo),
    StateChanged(PlaybackState),
    FrameReady { frame_id: u64, position: u64 },
    Progress(f64),
    /// Downstream queues were flushed; earlier results no longer apply
    Seeked { position: u64 },
    Finished,
    Error { kind: ErrorKind, message: String },
}

/// Scheduling interval for a playback speed, never below 1ms.
pub fn playback_interval(tick: Duration, speed: f64) -> Duration {
    if speed <= 0.0 {
        return tick;
    }
    let nanos = (tick.as_nanos() as f64 / speed) as u64;
    Duration::from_nanos(nanos).max(Duration::from_millis(1))
}

/// The three downstream frame queues fed by playback
#[derive(Clone)]
pub struct FrameQueues {
    pub display: Arc<BoundedQueue<Frame>>,
    pub detection: Arc<BoundedQueue<Frame>>,
    pub motion: Arc<BoundedQueue<Frame>>,
}

impl FrameQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            display: Arc::new(BoundedQueue::new("display", capacity)),
            detection: Arc::new(BoundedQueue::new("detection", capacity)),
            motion: Arc::new(BoundedQueue::new("motion", capacity)),
        }
    }

    /// Drop everything queued before a discontinuity.
    pub fn clear_all(&self) {
        self.display.clear();
        self.detection.clear();
        self.motion.clear();
    }

    pub fn close_all(&self) {
        self.display.close();
        self.detection.close();
        self.motion.close();
    }
}

/// Which downstream queues a frame id is routed to
#[derive(Debug, Clone, Copy)]
pub struct SamplingPolicy {
    pub decimation: u64,
    pub detection_enabled: bool,
    pub motion_enabled: bool,
}

impl SamplingPolicy {
    pub fn to_detection(&self, frame_id: u64) -> bool {
        self.detection_enabled && frame_id % self.decimation.max(1) == 0
    }

    pub fn to_motion(&self) -> bool {
        self.motion_enabled
    }
}

pub struct PlaybackWorker {
    source: Option<Box<dyn FrameSource>>,
    info: SourceInfo,
    state: PlaybackState,
    next_id: u64,
    tick: Duration,
    speed: f64,
    sampling: SamplingPolicy,
    queues: FrameQueues,
    events: Sender<PlaybackEvent>,
}

impl PlaybackWorker {
    pub fn new(config: &PlaybackConfig, queues: FrameQueues, events: Sender<PlaybackEvent>) -> Self {
        Self {
            source: None,
            info: SourceInfo::default(),
            state: PlaybackState::Stopped,
            next_id: 0,
            tick: config.tick(),
            speed: config.speed,
            sampling: SamplingPolicy {
                decimation: config.decimation,
                detection_enabled: config.detection_enabled,
                motion_enabled: config.motion_enabled,
            },
            queues,
            events,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn info(&self) -> &SourceInfo {
        &self.info
    }

    pub fn interval(&self) -> Duration {
        playback_interval(self.tick, self.speed)
    }

    /// Replace the source; resets ids and state.
    pub fn open(&mut self, source: Box<dyn FrameSource>) {
        self.info = source.info();
        info!("Opened source: {}", self.info);
        self.source = Some(source);
        self.next_id = 0;
        self.queues.clear_all();
        notify(&self.events, PlaybackEvent::Opened(self.info.clone()));
        self.set_state(PlaybackState::Stopped);
    }

    pub fn close(&mut self) {
        if self.source.take().is_some() {
            info!("Closed source {}", self.info.name);
        }
        self.info = SourceInfo::default();
        self.next_id = 0;
        self.queues.clear_all();
        self.set_state(PlaybackState::Stopped);
    }

    pub fn play(&mut self) {
        match self.state {
            PlaybackState::Stopped | PlaybackState::Paused if self.source.is_some() => {
                self.set_state(PlaybackState::Playing)
            }
            state => debug!("Play ignored in state {:?}", state),
        }
    }

    pub fn pause(&mut self) {
        if self.state == PlaybackState::Playing {
            self.set_state(PlaybackState::Paused);
        }
    }

    #[instrument(skip(self))]
    pub fn seek(&mut self, target: SeekTarget) {
        if matches!(self.state, PlaybackState::Finished | PlaybackState::Error) {
            debug!("Seek ignored in terminal state {:?}", self.state);
            return;
        }
        let Some(source) = self.source.as_mut() else {
            return;
        };

        let position = match target {
            SeekTarget::Frame(n) => n,
            SeekTarget::Percent(p) => {
                let p = p.clamp(0.0, 100.0) / 100.0;
                (p * self.info.total_frames as f64) as u64
            }
        };

        match source.seek(position) {
            Ok(()) => {
                self.info = source.info();
                self.queues.clear_all();
                let progress = self.info.progress(position);
                debug!("Seeked to frame {} ({:.1}%)", position, progress * 100.0);
                notify(&self.events, PlaybackEvent::Seeked { position });
                notify(&self.events, PlaybackEvent::Progress(progress));
            }
            Err(e) => {
                warn!("Seek to {} failed: {}", position, e);
                notify(
                    &self.events,
                    PlaybackEvent::Error {
                        kind: ErrorKind::SourceRead,
                        message: e.to_string(),
                    },
                );
            }
        }
    }

    pub fn set_speed(&mut self, speed: f64) {
        if speed <= 0.0 || !speed.is_finite() {
            warn!("Ignoring playback speed {}", speed);
            return;
        }
        self.speed = speed;
        debug!("Playback speed {}x, interval {:?}", speed, self.interval());
    }

    pub fn set_motion_enabled(&mut self, enabled: bool) {
        self.sampling.motion_enabled = enabled;
        if !enabled {
            self.queues.motion.clear();
        }
    }

    pub fn set_detection_enabled(&mut self, enabled: bool) {
        self.sampling.detection_enabled = enabled;
        if !enabled {
            self.queues.detection.clear();
        }
    }

    /// Read exactly one frame and fan it out. No-op unless playing.
    pub fn step(&mut self) {
        if self.state != PlaybackState::Playing {
            return;
        }
        let Some(source) = self.source.as_mut() else {
            return;
        };

        match source.read() {
            Ok(SourceRead::Frame(img)) => {
                let position = source.position().saturating_sub(1);
                let frame = Frame::from_rgb(self.next_id, self.info.timestamp(position), position, img);
                self.next_id += 1;
                self.fan_out(frame);
                notify(&self.events, PlaybackEvent::Progress(self.info.progress(position + 1)));
            }
            Ok(SourceRead::EndOfStream) => {
                info!("End of stream after {} frames", self.next_id);
                self.finish();
            }
            Err(e) => self.on_read_error(e),
        }
    }

    fn fan_out(&self, frame: Frame) {
        let frame_id = frame.id();
        let position = frame.meta.position;
        trace!("Produced {:?}", frame);
        metrics::counter!("frames_produced_total").increment(1);

        if self.sampling.to_detection(frame_id) {
            self.queues.detection.push(frame.clone());
        }
        if self.sampling.to_motion() {
            self.queues.motion.push(frame.clone());
        }
        self.queues.display.push(frame);

        notify(&self.events, PlaybackEvent::FrameReady { frame_id, position });
    }

    fn on_read_error(&mut self, e: SourceError) {
        if e.is_fatal() {
            error!("Frame source failed: {}", e);
            notify(
                &self.events,
                PlaybackEvent::Error {
                    kind: ErrorKind::SourceRead,
                    message: e.to_string(),
                },
            );
            self.set_state(PlaybackState::Error);
        } else {
            warn!("Frame read failed, finishing playback: {}", e);
            self.finish();
        }
    }

    fn finish(&mut self) {
        notify(&self.events, PlaybackEvent::Finished);
        self.set_state(PlaybackState::Finished);
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state != state {
            debug!("Playback {:?} -> {:?}", self.state, state);
            self.state = state;
            notify(&self.events, PlaybackEvent::StateChanged(state));
        }
    }

    fn handle(&mut self, command: PlaybackCommand) {
        match command {
            PlaybackCommand::Open(source) => self.open(source),
            PlaybackCommand::Close => self.close(),
            PlaybackCommand::Play => self.play(),
            PlaybackCommand::Pause => self.pause(),
            PlaybackCommand::Seek(target) => self.seek(target),
            PlaybackCommand::SetSpeed(speed) => self.set_speed(speed),
            PlaybackCommand::SetMotionEnabled(on) => self.set_motion_enabled(on),
            PlaybackCommand::SetDetectionEnabled(on) => self.set_detection_enabled(on),
        }
    }

    /// Worker loop: commands are applied between ticks, one frame per tick.
    pub fn run(mut self, commands: Receiver<PlaybackCommand>, stop: StopFlag) {
        let mut next_tick = Instant::now();

        while !stop.is_stopped() {
            let wait = if self.state == PlaybackState::Playing {
                next_tick.saturating_duration_since(Instant::now())
            } else {
                IDLE_POLL
            };

            match commands.recv_timeout(wait) {
                Ok(command) => {
                    let was_playing = self.state == PlaybackState::Playing;
                    self.handle(command);
                    if !was_playing && self.state == PlaybackState::Playing {
                        next_tick = Instant::now();
                    }
                    continue;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if self.state == PlaybackState::Playing && Instant::now() >= next_tick {
                self.step();
                next_tick = Instant::now() + self.interval();
            }
        }
        info!("Playback loop exited at frame {}", self.next_id);
    }
}

/// Narrow control surface over a running playback worker
pub struct PlaybackController {
    commands: Sender<PlaybackCommand>,
    events: Receiver<PlaybackEvent>,
    handle: WorkerHandle,
}

impl PlaybackController {
    pub fn spawn(config: &PlaybackConfig, queues: FrameQueues, event_capacity: usize) -> std::io::Result<Self> {
        let (commands, command_rx) = flume::unbounded();
        let (event_tx, events) = flume::bounded(event_capacity);
        let worker = PlaybackWorker::new(config, queues.clone(), event_tx);

        let stop = StopFlag::new();
        let wake: Vec<Arc<dyn Unblock>> = Vec::new();
        let handle = {
            let stop = stop.clone();
            WorkerHandle::spawn("playback", stop.clone(), wake, move || worker.run(command_rx, stop))?
        };

        Ok(Self {
            commands,
            events,
            handle,
        })
    }

    fn send(&self, command: PlaybackCommand) {
        if self.commands.send(command).is_err() {
            warn!("Playback worker is gone, command dropped");
        }
    }

    pub fn open(&self, source: Box<dyn FrameSource>) {
        self.send(PlaybackCommand::Open(source));
    }

    pub fn close(&self) {
        self.send(PlaybackCommand::Close);
    }

    pub fn play(&self) {
        self.send(PlaybackCommand::Play);
    }

    pub fn pause(&self) {
        self.send(PlaybackCommand::Pause);
    }

    pub fn seek(&self, target: SeekTarget) {
        self.send(PlaybackCommand::Seek(target));
    }

    pub fn set_speed(&self, speed: f64) {
        self.send(PlaybackCommand::SetSpeed(speed));
    }

    pub fn set_motion_enabled(&self, enabled: bool) {
        self.send(PlaybackCommand::SetMotionEnabled(enabled));
    }

    pub fn set_detection_enabled(&self, enabled: bool) {
        self.send(PlaybackCommand::SetDetectionEnabled(enabled));
    }

    pub fn events(&self) -> &Receiver<PlaybackEvent> {
        &self.events
    }

    pub fn shutdown(&mut self, timeout: Duration) {
        self.handle.shutdown(timeout);
    }
}
