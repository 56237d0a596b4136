use std::sync::Arc;
use std::time::Duration;

use image::GrayImage;
use tracing::{debug, info, trace};

use super::{FrameDifference, MotionCapability, MotionResult};
use crate::capture::Frame;
use crate::pipeline::queue::BoundedQueue;
use crate::pipeline::worker::{StopFlag, Unblock, WorkerHandle};
use crate::MotionConfig;

/// Intensity conversion followed by a Gaussian smoothing pass.
pub fn preprocess(frame: &Frame, blur_sigma: f32) -> Option<GrayImage> {
    let gray = frame.to_gray()?;
    if blur_sigma > 0.0 {
        Some(imageproc::filter::gaussian_blur_f32(&gray, blur_sigma))
    } else {
        Some(gray)
    }
}

pub struct MotionWorker {
    capability: Box<dyn MotionCapability>,
    blur_sigma: f32,
    input: Arc<BoundedQueue<Frame>>,
    output: Arc<BoundedQueue<MotionResult>>,
    /// Input generation the reference state belongs to
    generation: u64,
    analysed: u64,
    detected: u64,
}

impl MotionWorker {
    pub fn new(
        config: &MotionConfig,
        capability: Box<dyn MotionCapability>,
        input: Arc<BoundedQueue<Frame>>,
        output: Arc<BoundedQueue<MotionResult>>,
    ) -> Self {
        Self {
            capability,
            blur_sigma: config.blur_sigma,
            generation: input.generation(),
            input,
            output,
            analysed: 0,
            detected: 0,
        }
    }

    /// Analyse one frame; returns the result when movement was found.
    pub fn process(&mut self, frame: &Frame) -> Option<MotionResult> {
        let image = preprocess(frame, self.blur_sigma)?;
        self.analysed += 1;

        let outcome = self.capability.detect(&image);
        if !outcome.movement_detected {
            trace!("No movement in frame {}", frame.id());
            return None;
        }

        self.detected += 1;
        metrics::counter!("motion_events_total").increment(1);
        debug!("Movement in frame {}", frame.id());
        Some(MotionResult {
            frame_id: frame.id(),
            mask: outcome.mask,
        })
    }

    /// Analyse a frame popped from the input in queue generation `generation`.
    /// A clear since the previous frame is a discontinuity, so the capability
    /// starts over.
    pub fn step(&mut self, frame: &Frame, generation: u64) -> Option<MotionResult> {
        if generation != self.generation {
            self.generation = generation;
            self.reset();
        }
        if !frame.is_valid() {
            return None;
        }
        self.process(frame)
    }

    fn reset(&mut self) {
        debug!("Motion reference reset");
        self.capability.reset();
    }

    pub fn run(mut self, stop: StopFlag) {
        while !stop.is_stopped() {
            let Some((frame, generation)) = self.input.pop_tagged() else {
                // Cleared by a seek or closed for shutdown
                continue;
            };
            if let Some(result) = self.step(&frame, generation) {
                self.output.push(result);
            }
        }
        info!(
            "Motion worker stopped: {} frames analysed, {} with movement",
            self.analysed, self.detected
        );
    }
}

pub struct MotionController {
    results: Arc<BoundedQueue<MotionResult>>,
    handle: WorkerHandle,
}

impl MotionController {
    /// Spawn with the default frame-difference capability.
    pub fn spawn(
        config: &MotionConfig,
        input: Arc<BoundedQueue<Frame>>,
        result_capacity: usize,
    ) -> std::io::Result<Self> {
        Self::spawn_with(config, Box::new(FrameDifference::from_config(config)), input, result_capacity)
    }

    pub fn spawn_with(
        config: &MotionConfig,
        capability: Box<dyn MotionCapability>,
        input: Arc<BoundedQueue<Frame>>,
        result_capacity: usize,
    ) -> std::io::Result<Self> {
        let results = Arc::new(BoundedQueue::new("motion_results", result_capacity));
        let worker = MotionWorker::new(config, capability, Arc::clone(&input), Arc::clone(&results));

        let stop = StopFlag::new();
        let wake: Vec<Arc<dyn Unblock>> = vec![input as Arc<dyn Unblock>];
        let handle = {
            let stop = stop.clone();
            WorkerHandle::spawn("motion", stop.clone(), wake, move || worker.run(stop))?
        };

        Ok(Self { results, handle })
    }

    pub fn results(&self) -> &Arc<BoundedQueue<MotionResult>> {
        &self.results
    }

    pub fn shutdown(&mut self, timeout: Duration) {
        self.handle.shutdown(timeout);
    }
}
