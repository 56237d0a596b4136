//! Pairs displayed frames with whatever detection overlay applies to them.
//!
//! Runs on the display loop only. Results computed by worker threads arrive
//! over channels and are folded into the cache on each tick.

use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::Receiver;
use image::RgbImage;
use tracing::{debug, trace, warn};

use super::cache::{DetectionCache, OverlayTag, Selection};
use super::render::Renderer;
use crate::capture::Frame;
use crate::detection::{ClientStatus, DetectionEvent, DetectionResult};
use crate::error::PipelineError;
use crate::pipeline::queue::BoundedQueue;
use crate::CompositorConfig;

/// One frame ready for a display sink
#[derive(Debug, Clone)]
pub struct Composited {
    pub frame_id: u64,
    pub timestamp: f64,
    pub image: RgbImage,
    pub tag: Option<OverlayTag>,
    pub objects: usize,
    /// Label of every drawn box, in drawing order
    pub labels: Vec<String>,
}

impl Composited {
    /// `Frame: 42 (1.40 s) - 2 objects [AGE:3]`
    pub fn info_line(&self) -> String {
        let mut line = format!(
            "Frame: {} ({:.2} s) - {} objects",
            self.frame_id, self.timestamp, self.objects
        );
        if let Some(tag) = self.tag {
            line.push_str(&format!(" [{}]", tag));
        }
        line
    }
}

/// Frames shown per second, measured over one-second windows.
#[derive(Debug)]
pub struct FpsCounter {
    window_start: Instant,
    frames: u32,
    fps: f64,
}

impl FpsCounter {
    const WINDOW: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            frames: 0,
            fps: 0.0,
        }
    }

    pub fn tick(&mut self, now: Instant) {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= Self::WINDOW {
            self.fps = self.frames as f64 / elapsed.as_secs_f64();
            self.frames = 0;
            self.window_start = now;
        }
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Compositor {
    cache: DetectionCache,
    renderer: Renderer,
    display: Arc<BoundedQueue<Frame>>,
    current: Option<Frame>,
    /// A result arrived that may change the current frame's overlay
    dirty: bool,
    status: Option<ClientStatus>,
    connected: bool,
    fps: FpsCounter,
}

impl Compositor {
    pub fn new(config: &CompositorConfig, display: Arc<BoundedQueue<Frame>>) -> Result<Self, PipelineError> {
        Ok(Self {
            cache: DetectionCache::from_config(config),
            renderer: Renderer::new(config)?,
            display,
            current: None,
            dirty: false,
            status: None,
            connected: false,
            fps: FpsCounter::new(),
        })
    }

    pub fn cache(&self) -> &DetectionCache {
        &self.cache
    }

    pub fn status(&self) -> Option<ClientStatus> {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn fps(&self) -> f64 {
        self.fps.fps()
    }

    pub fn total_detections(&self) -> usize {
        self.cache.total_detections()
    }

    /// Fold one result into the cache.
    pub fn on_result(&mut self, result: DetectionResult) -> bool {
        let frame_id = result.frame_id;
        if !self.cache.insert(result) {
            trace!("Dropped unsuccessful result for frame {}", frame_id);
            return false;
        }
        self.dirty = self.current.is_some();
        true
    }

    pub fn on_event(&mut self, event: DetectionEvent) {
        match event {
            DetectionEvent::Result(result) => {
                self.on_result(result);
            }
            DetectionEvent::Status(status) => self.status = Some(status),
            DetectionEvent::ConnectionChanged(connected) => {
                debug!("Detection service connected: {}", connected);
                self.connected = connected;
            }
            DetectionEvent::Error { kind, message } => {
                warn!("Detection error ({}): {}", kind, message);
            }
        }
    }

    /// Drain every pending notification without blocking.
    pub fn drain(&mut self, events: &Receiver<DetectionEvent>) {
        for event in events.try_iter() {
            self.on_event(event);
        }
    }

    /// Forget results and the current frame, e.g. after a seek or re-open.
    pub fn reset(&mut self) {
        self.cache.clear();
        self.current = None;
        self.dirty = false;
    }

    /// Overlay choice for `frame_id`.
    pub fn select(&self, frame_id: u64) -> Option<Selection> {
        self.cache.select(frame_id)
    }

    /// Composite `frame` with its selected overlay. Pure with respect to the
    /// compositor state.
    pub fn compose(&self, frame: &Frame) -> Option<Composited> {
        let mut image = frame.to_rgb()?;
        let selection = self.cache.select(frame.id());

        let (tag, objects, labels) = match &selection {
            Some(selection) => {
                let labels = self.renderer.draw_result(&mut image, &selection.result);
                self.renderer.draw_tag(&mut image, selection.tag);
                (Some(selection.tag), selection.result.detections.len(), labels)
            }
            None => (None, 0, Vec::new()),
        };

        Some(Composited {
            frame_id: frame.id(),
            timestamp: frame.meta.timestamp,
            image,
            tag,
            objects,
            labels,
        })
    }

    /// One display tick: apply pending results, then show the next queued
    /// frame, or re-composite the current one if new results arrived.
    pub fn tick(&mut self, events: &Receiver<DetectionEvent>) -> Option<Composited> {
        self.drain(events);

        if let Some(frame) = self.display.try_pop() {
            if !frame.is_valid() {
                return None;
            }
            self.fps.tick(Instant::now());
            self.dirty = false;
            let composited = self.compose(&frame);
            self.current = Some(frame);
            return composited;
        }

        if self.dirty {
            return self.redraw();
        }
        None
    }

    /// Re-composite the frame currently on screen.
    pub fn redraw(&mut self) -> Option<Composited> {
        self.dirty = false;
        let frame = self.current.as_ref()?;
        self.compose(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BoundingBox, Detection};
    use crate::Config;
    use image::Rgb;

    fn frame(id: u64) -> Frame {
        Frame::from_rgb(id, id as f64 / 30.0, id, RgbImage::from_pixel(64, 48, Rgb([20, 20, 20])))
    }

    fn result(frame_id: u64) -> DetectionResult {
        DetectionResult {
            frame_id,
            processing_latency_ms: 12.0,
            detections: vec![Detection {
                class_id: 0,
                label: "person".into(),
                confidence: 0.92,
                bbox: BoundingBox {
                    x: 10,
                    y: 30,
                    width: 20,
                    height: 15,
                },
            }],
            success: true,
        }
    }

    fn compositor() -> (Compositor, Arc<BoundedQueue<Frame>>) {
        let display = Arc::new(BoundedQueue::new("display", 8));
        let compositor = Compositor::new(&Config::default().compositor, Arc::clone(&display)).unwrap();
        (compositor, display)
    }

    #[test]
    fn frame_without_results_has_no_overlay() {
        let (compositor, _) = compositor();
        let composited = compositor.compose(&frame(3)).unwrap();
        assert_eq!(composited.tag, None);
        assert_eq!(composited.info_line(), "Frame: 3 (0.10 s) - 0 objects");
        assert_eq!(composited.image, frame(3).to_rgb().unwrap());
    }

    #[test]
    fn live_and_aged_overlays() {
        let (mut compositor, _) = compositor();
        compositor.on_result(result(30));

        let live = compositor.compose(&frame(30)).unwrap();
        assert_eq!(live.tag, Some(OverlayTag::Live));
        assert_eq!(live.labels, vec!["person 92%".to_string()]);
        assert_eq!(live.info_line(), "Frame: 30 (1.00 s) - 1 objects [LIVE]");

        let aged = compositor.compose(&frame(33)).unwrap();
        assert_eq!(aged.tag, Some(OverlayTag::Age(3)));
        assert!(aged.info_line().ends_with("[AGE:3]"));

        assert!(compositor.compose(&frame(46)).unwrap().tag.is_none());
    }

    #[test]
    fn tick_drains_events_and_pops_display() {
        let (mut compositor, display) = compositor();
        let (tx, rx) = flume::unbounded();

        assert!(compositor.tick(&rx).is_none());

        tx.send(DetectionEvent::ConnectionChanged(true)).unwrap();
        tx.send(DetectionEvent::Result(result(1))).unwrap();
        display.push(frame(1));

        let composited = compositor.tick(&rx).unwrap();
        assert!(compositor.is_connected());
        assert_eq!(composited.frame_id, 1);
        assert_eq!(composited.tag, Some(OverlayTag::Live));
        assert_eq!(compositor.total_detections(), 1);
    }

    #[test]
    fn late_result_triggers_redraw() {
        let (mut compositor, display) = compositor();
        let (tx, rx) = flume::unbounded();

        display.push(frame(5));
        assert_eq!(compositor.tick(&rx).unwrap().tag, None);
        assert!(compositor.tick(&rx).is_none(), "nothing new to show");

        tx.send(DetectionEvent::Result(result(5))).unwrap();
        let redrawn = compositor.tick(&rx).unwrap();
        assert_eq!(redrawn.frame_id, 5);
        assert_eq!(redrawn.tag, Some(OverlayTag::Live));
    }

    #[test]
    fn reset_forgets_results() {
        let (mut compositor, _) = compositor();
        compositor.on_result(result(7));
        compositor.reset();
        assert!(compositor.select(7).is_none());
        assert!(compositor.redraw().is_none());
    }

    #[test]
    fn fps_over_one_second_window() {
        let start = Instant::now();
        let mut fps = FpsCounter {
            window_start: start,
            frames: 0,
            fps: 0.0,
        };
        for i in 1..=30 {
            fps.tick(start + Duration::from_millis(i * 33));
        }
        assert_eq!(fps.fps(), 0.0);
        fps.tick(start + Duration::from_millis(1000));
        assert!((fps.fps() - 31.0).abs() < 0.01);
    }
}
