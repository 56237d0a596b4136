//! Detection protocol client: one outstanding request at a time over a
//! persistent TCP connection, with fixed-backoff reconnects.

use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use crate::capture::Frame;
use crate::detection::protocol::{self, FrameRequest, MessageReader};
use crate::detection::types::{DetectionParams, DetectionResult};
use crate::error::{ErrorKind, PipelineError, ProtocolError};
use crate::pipeline::queue::BoundedQueue;
use crate::pipeline::worker::{notify, StopFlag, Unblock, WorkerHandle};
use crate::DetectionConfig;

/// Upper bound on a single blocking wait inside the loop, so commands and
/// the stop flag are observed promptly.
const POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    AwaitingResponse,
    Error,
}

/// Point-in-time connectivity and counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStatus {
    pub state: ClientState,
    pub frames_sent: u64,
    pub results_received: u64,
    pub errors: u64,
}

impl ClientStatus {
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            ClientState::Connected | ClientState::AwaitingResponse
        )
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "YOLO[Connected:{}, Sent:{}, Received:{}, Errors:{}]",
            if self.is_connected() { "Yes" } else { "No" },
            self.frames_sent,
            self.results_received,
            self.errors
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DetectionEvent {
    ConnectionChanged(bool),
    Status(ClientStatus),
    Result(DetectionResult),
    Error { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone)]
pub enum ClientCommand {
    Configure(DetectionParams),
}

/// Clone of the live socket so shutdown can break a blocking read.
#[derive(Default)]
struct SocketSlot(Mutex<Option<TcpStream>>);

impl SocketSlot {
    fn set(&self, stream: Option<TcpStream>) {
        *self.0.lock() = stream;
    }
}

impl Unblock for SocketSlot {
    fn unblock(&self) {
        if let Some(stream) = self.0.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

pub struct DetectionClient {
    config: DetectionConfig,
    params: DetectionParams,
    queue: Arc<BoundedQueue<Frame>>,
    events: Sender<DetectionEvent>,
    commands: Receiver<ClientCommand>,
    stream: Option<TcpStream>,
    socket: Arc<SocketSlot>,
    reader: MessageReader,
    status: ClientStatus,
}

impl DetectionClient {
    pub fn new(
        config: DetectionConfig,
        queue: Arc<BoundedQueue<Frame>>,
        events: Sender<DetectionEvent>,
        commands: Receiver<ClientCommand>,
    ) -> Self {
        let reader = MessageReader::new(config.max_message_bytes);
        Self {
            params: config.params.clone(),
            config,
            queue,
            events,
            commands,
            stream: None,
            socket: Arc::new(SocketSlot::default()),
            reader,
            status: ClientStatus {
                state: ClientState::Disconnected,
                frames_sent: 0,
                results_received: 0,
                errors: 0,
            },
        }
    }

    pub fn status(&self) -> ClientStatus {
        self.status
    }

    fn set_state(&mut self, state: ClientState) {
        if self.status.state != state {
            trace!("Detection client {:?} -> {:?}", self.status.state, state);
            self.status.state = state;
            notify(&self.events, DetectionEvent::Status(self.status));
        }
    }

    fn apply(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Configure(params) => {
                debug!("Detection parameters updated: {:?}", params);
                self.params = params;
            }
        }
    }

    fn apply_pending(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }
    }

    #[instrument(skip(self), fields(addr = %self.config.address()))]
    pub fn connect(&mut self) -> Result<(), PipelineError> {
        self.set_state(ClientState::Connecting);

        let addrs = self
            .config
            .address()
            .to_socket_addrs()
            .map_err(PipelineError::Connection)?;

        let mut last_err = io::Error::new(io::ErrorKind::AddrNotAvailable, "address did not resolve");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout()) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    self.socket.set(stream.try_clone().ok());
                    self.stream = Some(stream);
                    self.reader.clear();
                    info!("Connected to detection service at {}", addr);
                    self.set_state(ClientState::Connected);
                    notify(&self.events, DetectionEvent::ConnectionChanged(true));
                    return Ok(());
                }
                Err(e) => last_err = e,
            }
        }
        notify(&self.events, DetectionEvent::ConnectionChanged(false));
        Err(PipelineError::Connection(last_err))
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            self.socket.set(None);
            self.reader.clear();
            info!("Disconnected from detection service");
            notify(&self.events, DetectionEvent::ConnectionChanged(false));
        }
    }

    /// Send one frame and wait for its result.
    #[instrument(skip(self, frame), fields(frame_id = frame.id()))]
    pub fn round_trip(&mut self, frame: &Frame) -> Result<DetectionResult, PipelineError> {
        let frame_id = frame.id();
        let request = FrameRequest::from_frame(frame, &self.params, self.config.jpeg_quality)?;
        let message = protocol::encode_request(&request)?;

        let stream = self.stream.as_mut().ok_or_else(|| {
            PipelineError::Connection(io::Error::new(io::ErrorKind::NotConnected, "not connected"))
        })?;
        let timeout = self.config.response_timeout();
        stream
            .set_write_timeout(Some(timeout))
            .map_err(PipelineError::Connection)?;
        stream.write_all(&message).map_err(|e| write_error(e, timeout))?;
        stream.flush().map_err(|e| write_error(e, timeout))?;

        self.status.frames_sent += 1;
        self.set_state(ClientState::AwaitingResponse);
        debug!("Sent frame {} ({} bytes)", frame_id, message.len());

        let sent_at = Instant::now();
        let deadline = sent_at + timeout;

        loop {
            if let Some(body) = self.reader.next_message()? {
                match protocol::parse_response(&body) {
                    Ok(result) if result.frame_id == frame_id => {
                        let elapsed = sent_at.elapsed();
                        metrics::histogram!("detection_roundtrip_ms").record(elapsed.as_secs_f64() * 1000.0);
                        return Ok(result);
                    }
                    Ok(stale) => {
                        warn!("Skipping response for frame {} while waiting for {}", stale.frame_id, frame_id);
                        continue;
                    }
                    Err(ProtocolError::UnexpectedType(kind)) => {
                        debug!("Ignoring message of type {:?}", kind);
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PipelineError::Timeout(timeout));
            }

            let stream = self.stream.as_mut().ok_or_else(|| {
                PipelineError::Connection(io::Error::new(io::ErrorKind::NotConnected, "not connected"))
            })?;
            stream
                .set_read_timeout(Some(remaining))
                .map_err(PipelineError::Connection)?;

            match self.reader.fill(stream) {
                Ok(0) if self.reader.buffered() == 0 => {
                    return Err(PipelineError::Connection(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )))
                }
                Ok(0) => return Err(self.reader.truncated().into()),
                Ok(_) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(PipelineError::Connection(e)),
            }
        }
    }

    /// Count, report and, for connection-class failures, drop the connection.
    fn fail(&mut self, err: PipelineError) -> bool {
        let kind = err.kind();
        let reconnect = err.needs_reconnect();
        warn!("Detection error ({}): {}", kind, err);

        self.status.errors += 1;
        metrics::counter!("detection_errors_total", "kind" => kind.as_str()).increment(1);
        notify(
            &self.events,
            DetectionEvent::Error {
                kind,
                message: err.to_string(),
            },
        );

        if reconnect {
            self.set_state(ClientState::Error);
            self.disconnect();
        }
        reconnect
    }

    /// Sit out the backoff delay, still applying commands.
    fn backoff(&mut self, stop: &StopFlag) {
        let deadline = Instant::now() + self.config.backoff();
        debug!("Reconnecting in {:?}", self.config.backoff());
        while !stop.is_stopped() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.commands.recv_timeout(remaining.min(POLL)) {
                Ok(command) => self.apply(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => thread::sleep(remaining.min(POLL)),
            }
        }
        self.set_state(ClientState::Disconnected);
    }

    /// Worker loop. Transport failures never end it; only the stop flag does.
    pub fn run(mut self, stop: StopFlag) {
        while !stop.is_stopped() {
            self.apply_pending();

            if self.stream.is_none() {
                if let Err(e) = self.connect() {
                    self.fail(e);
                    self.backoff(&stop);
                    continue;
                }
            }

            let Some(frame) = self.queue.pop_timeout(POLL) else {
                continue;
            };
            if !frame.is_valid() {
                continue;
            }

            match self.round_trip(&frame) {
                Ok(result) => {
                    self.status.results_received += 1;
                    debug!("Received {}", result);
                    self.set_state(ClientState::Connected);
                    notify(&self.events, DetectionEvent::Result(result));
                }
                Err(e) => {
                    if self.fail(e) {
                        self.backoff(&stop);
                    } else {
                        self.set_state(ClientState::Connected);
                    }
                }
            }
        }

        self.disconnect();
        self.set_state(ClientState::Disconnected);
        info!("Detection client stopped: {}", self.status);
    }
}

/// A peer that stops reading stalls the write; that counts as a timeout.
fn write_error(e: io::Error, timeout: Duration) -> PipelineError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => PipelineError::Timeout(timeout),
        _ => PipelineError::Connection(e),
    }
}

/// Narrow control surface over a running detection client
pub struct DetectionController {
    commands: Sender<ClientCommand>,
    events: Receiver<DetectionEvent>,
    handle: WorkerHandle,
}

impl DetectionController {
    pub fn spawn(
        config: &DetectionConfig,
        queue: Arc<BoundedQueue<Frame>>,
        event_capacity: usize,
    ) -> std::io::Result<Self> {
        let (commands, command_rx) = flume::unbounded();
        let (event_tx, events) = flume::bounded(event_capacity);
        let client = DetectionClient::new(config.clone(), Arc::clone(&queue), event_tx, command_rx);

        let stop = StopFlag::new();
        let socket: Arc<dyn Unblock> = client.socket.clone();
        let wake: Vec<Arc<dyn Unblock>> = vec![queue as Arc<dyn Unblock>, socket];
        let handle = {
            let stop = stop.clone();
            WorkerHandle::spawn("detection", stop.clone(), wake, move || client.run(stop))?
        };

        Ok(Self {
            commands,
            events,
            handle,
        })
    }

    pub fn configure(&self, params: DetectionParams) {
        if self.commands.send(ClientCommand::Configure(params)).is_err() {
            warn!("Detection worker is gone, parameters dropped");
        }
    }

    pub fn events(&self) -> &Receiver<DetectionEvent> {
        &self.events
    }

    pub fn shutdown(&mut self, timeout: Duration) {
        self.handle.shutdown(timeout);
    }
}
