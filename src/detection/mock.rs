//! Stand-in detection service speaking the wire protocol, for local runs and
//! tests. Answers every frame request with one box over the frame centre.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::detection::protocol::{self, Corners, DetectionResponse, FrameRequest, MessageReader, WireDetection};
use crate::error::PipelineError;
use crate::pipeline::worker::StopFlag;

#[derive(Debug, Clone)]
pub struct MockOptions {
    pub class_id: i32,
    pub class_name: String,
    pub confidence: f32,
    /// Artificial inference latency
    pub delay: Duration,
    pub max_message_bytes: usize,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            class_id: 0,
            class_name: "person".into(),
            confidence: 0.9,
            delay: Duration::ZERO,
            max_message_bytes: 64 * 1024 * 1024,
        }
    }
}

pub struct MockDetector {
    listener: TcpListener,
    options: MockOptions,
    frames: u64,
}

impl MockDetector {
    pub fn bind(addr: &str, options: MockOptions) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            options,
            frames: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Canned answer for one request.
    pub fn respond(&self, request: &FrameRequest) -> DetectionResponse {
        let (w, h) = (request.width as f64, request.height as f64);
        DetectionResponse {
            frame_id: request.frame_id as i64,
            processing_time_ms: self.options.delay.as_secs_f64() * 1000.0,
            detections: vec![WireDetection {
                class_id: self.options.class_id,
                class_name: self.options.class_name.clone(),
                confidence: self.options.confidence,
                bbox: Corners {
                    x1: w / 4.0,
                    y1: h / 4.0,
                    x2: w * 3.0 / 4.0,
                    y2: h * 3.0 / 4.0,
                },
            }],
        }
    }

    /// Serve clients one at a time until `stop` is set.
    pub fn serve(mut self, stop: StopFlag) {
        info!("Mock detector listening on {:?}", self.listener.local_addr());
        while !stop.is_stopped() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!("Client connected: {}", peer);
                    if let Err(e) = self.handle(stream, &stop) {
                        warn!("Client {} dropped: {}", peer, e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
        info!("Mock detector stopped after {} frames", self.frames);
    }

    fn handle(&mut self, mut stream: TcpStream, stop: &StopFlag) -> Result<(), PipelineError> {
        stream.set_nonblocking(false).map_err(PipelineError::Connection)?;
        stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .map_err(PipelineError::Connection)?;
        let mut reader = MessageReader::new(self.options.max_message_bytes);

        while !stop.is_stopped() {
            let body = match reader.read_message(&mut stream) {
                Ok(Some(body)) => body,
                Ok(None) => return Ok(()),
                Err(PipelineError::Connection(e))
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            };

            let request = match protocol::parse_request(&body) {
                Ok(request) => request,
                Err(e) => {
                    debug!("Ignoring message: {}", e);
                    continue;
                }
            };
            if let Err(e) = request.decode_image() {
                warn!("Frame {} could not be decoded: {}", request.frame_id, e);
                continue;
            }

            let started = Instant::now();
            if !self.options.delay.is_zero() {
                thread::sleep(self.options.delay);
            }
            let response = self.respond(&request);
            let message = protocol::encode_response(&response)?;
            protocol::write_message(&mut stream, &message).map_err(PipelineError::Connection)?;

            self.frames += 1;
            debug!("Answered frame {} in {:?}", request.frame_id, started.elapsed());
        }
        Ok(())
    }
}
