//! Per-stream frame source: connection state machine, reconnect bookkeeping and
//! the decode thread that feeds it.
//!
//! ```text
//! Disconnected → Connecting → Streaming ⇄ Stalled
//!       ↑             │            │         │
//!       └─────────────┴── Ending ←─┴─────────┘
//! ```
//!
//! The source is the only writer of its [`SourceHealth`] record; readers take
//! lock-free snapshots through the shared [`HealthCell`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use arc_swap::ArcSwap;
use flume::{Receiver, Sender};
use tracing::{debug, error, info, instrument, warn};

use super::decoder::{DecoderFactory, ReadOutcome};
use super::frame::{DecodedImage, Frame};
use crate::config::StreamConfig;
use crate::{Error, Result};

/// Connection state of one source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Disconnected,
    Connecting,
    Streaming,
    Stalled,
    Ending,
}

impl std::fmt::Display for SourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SourceState::Disconnected => "disconnected",
            SourceState::Connecting => "connecting",
            SourceState::Streaming => "streaming",
            SourceState::Stalled => "stalled",
            SourceState::Ending => "ending",
        };
        f.write_str(name)
    }
}

/// Liveness record for one stream
#[derive(Debug, Clone)]
pub struct SourceHealth {
    pub state: SourceState,
    pub consecutive_failures: u32,
    pub last_success: Option<Instant>,
    /// Earliest time an automatic restart may be attempted
    pub retry_at: Option<Instant>,
    /// Failure count reached the reconnect cap; only an operator start revives it
    pub exhausted: bool,
    /// Stopped by the operator; never restarted automatically
    pub operator_hold: bool,
    pub session: u32,
    pub frames: u64,
    pub dropped: u64,
    pub last_error: Option<String>,
}

impl Default for SourceHealth {
    fn default() -> Self {
        Self {
            state: SourceState::Disconnected,
            consecutive_failures: 0,
            last_success: None,
            retry_at: None,
            exhausted: false,
            operator_hold: false,
            session: 0,
            frames: 0,
            dropped: 0,
            last_error: None,
        }
    }
}

impl std::fmt::Display for SourceHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} failures={} frames={} dropped={}",
            self.state, self.consecutive_failures, self.frames, self.dropped
        )?;
        if let Some(at) = self.last_success {
            write!(f, " last_frame={}ms ago", at.elapsed().as_millis())?;
        }
        if self.exhausted {
            f.write_str(" [gave up]")?;
        }
        if self.operator_hold {
            f.write_str(" [held]")?;
        }
        if let Some(err) = &self.last_error {
            write!(f, " last_error=\"{}\"", err)?;
        }
        Ok(())
    }
}

/// Shared, atomically swapped health snapshot
pub type HealthCell = Arc<ArcSwap<SourceHealth>>;

pub fn health_cell() -> HealthCell {
    Arc::new(ArcSwap::from_pointee(SourceHealth::default()))
}

/// What `next_frame` produced
#[derive(Debug)]
pub enum NextFrame {
    Frame(Frame),
    /// No frame within the staleness timeout
    Stalled,
    /// End of stream; the source is Disconnected
    Ended,
    /// Connection lost or never made; the source is Disconnected
    Failed(Error),
    /// Source is not running
    Inactive,
}

/// Commands accepted by a running source task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceCommand {
    /// `operator` clears the failure count and any hold
    Start { operator: bool },
    /// `hold` keeps the health monitor from restarting it
    Stop { hold: bool },
    Shutdown,
}

enum WorkerEvent {
    Connected,
    Image(DecodedImage),
    DecodeFailed(Error),
    ConnectFailed(Error),
    Lost(Error),
    EndOfStream,
}

struct Worker {
    events: Receiver<WorkerEvent>,
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

/// One stream's frame producer
pub struct FrameSource {
    config: Arc<StreamConfig>,
    factory: Arc<dyn DecoderFactory>,
    health: HealthCell,
    state: SourceState,
    worker: Option<Worker>,
    session: u32,
    next_sequence: u64,
    streaming_since: Option<Instant>,
    decode_errors: u32,
    stalled_periods: u32,
}

impl FrameSource {
    pub fn new(config: Arc<StreamConfig>, factory: Arc<dyn DecoderFactory>, health: HealthCell) -> Self {
        Self {
            config,
            factory,
            health,
            state: SourceState::Disconnected,
            worker: None,
            session: 0,
            next_sequence: 0,
            streaming_since: None,
            decode_errors: 0,
            stalled_periods: 0,
        }
    }

    pub fn index(&self) -> usize {
        self.config.index
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != SourceState::Disconnected
    }

    /// Read-only snapshot
    pub fn health(&self) -> SourceHealth {
        (**self.health.load()).clone()
    }

    pub fn health_cell(&self) -> HealthCell {
        Arc::clone(&self.health)
    }

    fn publish(&self, update: impl FnOnce(&mut SourceHealth)) {
        let mut next = self.health();
        update(&mut next);
        next.state = self.state;
        self.health.store(Arc::new(next));
    }

    /// Operator intervention: forget past failures
    pub fn clear_failures(&mut self) {
        self.publish(|h| {
            h.consecutive_failures = 0;
            h.exhausted = false;
            h.retry_at = None;
        });
    }

    pub fn set_hold(&mut self, hold: bool) {
        self.publish(|h| h.operator_hold = hold);
    }

    /// Begin connecting. No-op unless Disconnected.
    #[instrument(skip(self), fields(stream = self.config.index))]
    pub fn start(&mut self) -> Result<()> {
        if self.state != SourceState::Disconnected {
            debug!("start ignored in state {}", self.state);
            return Ok(());
        }

        self.session += 1;
        let (tx, rx) = flume::bounded(self.config.queue_depth);
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let config = Arc::clone(&self.config);
            let factory = Arc::clone(&self.factory);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("argus-src-{}", self.config.index))
                .spawn(move || decode_loop(config, factory, tx, stop))?
        };

        self.worker = Some(Worker {
            events: rx,
            stop,
            handle,
        });
        self.state = SourceState::Connecting;
        self.streaming_since = None;
        self.decode_errors = 0;
        self.stalled_periods = 0;
        let session = self.session;
        self.publish(|h| {
            h.session = session;
            h.retry_at = None;
        });

        info!("Connecting to {} (session {})", self.config.uri, session);
        Ok(())
    }

    /// Graceful stop. Releases the decoder on every path; no-op when Disconnected.
    #[instrument(skip(self), fields(stream = self.config.index))]
    pub async fn stop(&mut self) {
        if self.state == SourceState::Disconnected {
            return;
        }

        info!("Stopping source");
        self.state = SourceState::Ending;
        self.publish(|_| {});

        let handle = self.detach_worker();
        self.settle_stable_run();
        self.state = SourceState::Disconnected;
        self.publish(|h| h.retry_at = None);
        join_worker(handle).await;
    }

    /// Wait for the next frame, bounded by the staleness (or connect) timeout.
    pub async fn next_frame(&mut self) -> NextFrame {
        loop {
            let Some(worker) = self.worker.as_ref() else {
                return NextFrame::Inactive;
            };

            let wait = match self.state {
                SourceState::Connecting => self.config.connect_timeout,
                _ => self.config.staleness,
            };

            let event = match tokio::time::timeout(wait, worker.events.recv_async()).await {
                Ok(Ok(event)) => event,
                Ok(Err(_)) => WorkerEvent::Lost(Error::connection(
                    self.config.index,
                    "decoder thread exited",
                )),
                Err(_) => match self.on_timeout().await {
                    Some(outcome) => return outcome,
                    None => continue,
                },
            };

            match event {
                WorkerEvent::Connected => {
                    debug!(stream = self.config.index, "Connected, waiting for first frame");
                }
                WorkerEvent::Image(image) => {
                    let sequence = self.next_sequence;
                    self.next_sequence += 1;

                    if !image.is_complete() {
                        let err = Error::decode(self.config.index, "incomplete pixel buffer");
                        if let Some(outcome) = self.on_decode_error(err).await {
                            return outcome;
                        }
                        continue;
                    }

                    return NextFrame::Frame(self.on_frame(image, sequence));
                }
                WorkerEvent::DecodeFailed(err) => {
                    self.next_sequence += 1;
                    if let Some(outcome) = self.on_decode_error(err).await {
                        return outcome;
                    }
                }
                WorkerEvent::ConnectFailed(err) | WorkerEvent::Lost(err) => {
                    return self.fail(err).await;
                }
                WorkerEvent::EndOfStream => {
                    return self.end_of_stream().await;
                }
            }
        }
    }

    fn on_frame(&mut self, image: DecodedImage, sequence: u64) -> Frame {
        let now = Instant::now();
        match self.state {
            SourceState::Connecting => {
                info!(stream = self.config.index, "Streaming ({}x{})", image.width, image.height);
                self.state = SourceState::Streaming;
                self.streaming_since = Some(now);
            }
            SourceState::Stalled => {
                info!(stream = self.config.index, "Recovered from stall");
                self.state = SourceState::Streaming;
            }
            _ => {}
        }
        self.decode_errors = 0;
        self.stalled_periods = 0;

        metrics::counter!("argus_frames_decoded", "stream" => self.config.index.to_string())
            .increment(1);
        self.publish(|h| {
            h.frames += 1;
            h.last_success = Some(now);
        });

        Frame::from_decoded(image, self.config.index, sequence, self.session)
    }

    async fn on_decode_error(&mut self, err: Error) -> Option<NextFrame> {
        self.decode_errors += 1;
        metrics::counter!("argus_frames_dropped", "stream" => self.config.index.to_string())
            .increment(1);
        self.publish(|h| h.dropped += 1);

        if self.decode_errors >= self.config.decode_error_threshold {
            warn!(
                stream = self.config.index,
                "{} consecutive decode errors, reconnecting", self.decode_errors
            );
            return Some(self.fail(err).await);
        }

        debug!(stream = self.config.index, "Dropped frame: {}", err);
        None
    }

    async fn on_timeout(&mut self) -> Option<NextFrame> {
        match self.state {
            SourceState::Connecting => {
                let err = Error::connection(
                    self.config.index,
                    format!("no frame within {:?} of connecting", self.config.connect_timeout),
                );
                Some(self.fail(err).await)
            }
            SourceState::Streaming => {
                warn!(
                    stream = self.config.index,
                    "No frame for {:?}, stalled", self.config.staleness
                );
                self.state = SourceState::Stalled;
                self.stalled_periods = 1;
                self.publish(|_| {});
                Some(NextFrame::Stalled)
            }
            SourceState::Stalled => {
                self.stalled_periods += 1;
                if self.stalled_periods >= self.config.stall_restart_after {
                    let err = Error::connection(
                        self.config.index,
                        format!("stalled for {} periods", self.stalled_periods),
                    );
                    return Some(self.fail(err).await);
                }
                Some(NextFrame::Stalled)
            }
            SourceState::Disconnected | SourceState::Ending => None,
        }
    }

    /// Connection lost or refused → Disconnected, one more failure on the count
    async fn fail(&mut self, err: Error) -> NextFrame {
        let handle = self.detach_worker();
        self.settle_stable_run();
        self.state = SourceState::Disconnected;
        self.record_failure(&err);
        join_worker(handle).await;
        NextFrame::Failed(err)
    }

    /// Ending → Disconnected. A short-lived run counts as a failed attempt.
    async fn end_of_stream(&mut self) -> NextFrame {
        info!(stream = self.config.index, "End of stream");
        self.state = SourceState::Ending;
        self.publish(|_| {});

        let handle = self.detach_worker();
        let stable = self.settle_stable_run();
        self.state = SourceState::Disconnected;
        if stable {
            let retry_at = Instant::now() + self.config.reconnect.backoff_base;
            self.publish(|h| {
                h.retry_at = Some(retry_at);
                h.last_error = None;
            });
        } else {
            let err = Error::connection(self.config.index, "stream ended before becoming stable");
            self.record_failure(&err);
        }
        join_worker(handle).await;
        NextFrame::Ended
    }

    fn record_failure(&mut self, err: &Error) {
        let policy = &self.config.reconnect;
        let failures = self.health.load().consecutive_failures + 1;
        let exhausted = policy.exhausted(failures);
        let retry_at = (!exhausted).then(|| Instant::now() + policy.backoff(failures));

        if exhausted {
            error!(
                stream = self.config.index,
                "{} (failure {}/{}, giving up)", err, failures, policy.max_attempts
            );
        } else {
            warn!(
                stream = self.config.index,
                "{} (failure {}/{}, retry in {:?})",
                err,
                failures,
                policy.max_attempts,
                policy.backoff(failures)
            );
        }

        let message = err.to_string();
        self.publish(|h| {
            h.consecutive_failures = failures;
            h.exhausted = exhausted;
            h.retry_at = retry_at;
            h.last_error = Some(message);
        });
    }

    /// Reset the failure count if the run just ended was long enough to be trusted
    fn settle_stable_run(&mut self) -> bool {
        let stable = self
            .streaming_since
            .take()
            .is_some_and(|since| since.elapsed() >= self.config.reconnect.stable_after);
        if stable {
            self.publish(|h| {
                h.consecutive_failures = 0;
                h.exhausted = false;
            });
        }
        stable
    }

    /// Signal the decode thread and drop our end of its channel
    fn detach_worker(&mut self) -> Option<thread::JoinHandle<()>> {
        self.worker.take().map(|worker| {
            worker.stop.store(true, Ordering::Release);
            drop(worker.events);
            worker.handle
        })
    }

    /// Task body: run commands and forward frames until shutdown
    pub async fn run(mut self, commands: Receiver<SourceCommand>, frames: Sender<Frame>) {
        loop {
            let command = if self.is_active() {
                tokio::select! {
                    biased;
                    cmd = commands.recv_async() => cmd.unwrap_or(SourceCommand::Shutdown),
                    next = self.next_frame() => match next {
                        NextFrame::Frame(frame) => {
                            if frames.send_async(frame).await.is_err() {
                                SourceCommand::Shutdown
                            } else {
                                continue;
                            }
                        }
                        _ => continue,
                    },
                }
            } else {
                commands.recv_async().await.unwrap_or(SourceCommand::Shutdown)
            };

            match command {
                SourceCommand::Start { operator } => {
                    if operator {
                        self.clear_failures();
                        self.set_hold(false);
                    }
                    let was_active = self.is_active();
                    match self.start() {
                        Err(e) => error!(stream = self.config.index, "Failed to start: {}", e),
                        Ok(()) if !was_active => {
                            metrics::counter!("argus_source_restarts", "stream" => self.config.index.to_string())
                                .increment(1);
                        }
                        Ok(()) => {}
                    }
                }
                SourceCommand::Stop { hold } => {
                    self.set_hold(hold);
                    self.stop().await;
                }
                SourceCommand::Shutdown => {
                    self.stop().await;
                    break;
                }
            }
        }
        debug!(stream = self.config.index, "Source task finished");
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Release);
        }
    }
}

async fn join_worker(handle: Option<thread::JoinHandle<()>>) {
    if let Some(handle) = handle {
        if let Ok(Err(_)) = tokio::task::spawn_blocking(move || handle.join()).await {
            error!("Decode thread panicked");
        }
    }
}

/// Decode thread: owns the decoder for one connection session
fn decode_loop(
    config: Arc<StreamConfig>,
    factory: Arc<dyn DecoderFactory>,
    tx: Sender<WorkerEvent>,
    stop: Arc<AtomicBool>,
) {
    let mut decoder = match factory.create(&config) {
        Ok(decoder) => decoder,
        Err(e) => {
            let _ = tx.send(WorkerEvent::ConnectFailed(e));
            return;
        }
    };

    if let Err(e) = decoder.connect() {
        decoder.release();
        let _ = tx.send(WorkerEvent::ConnectFailed(e));
        return;
    }
    let _ = tx.send(WorkerEvent::Connected);

    while !stop.load(Ordering::Acquire) {
        let event = match decoder.read_frame() {
            Ok(ReadOutcome::Frame(image)) => WorkerEvent::Image(image),
            Ok(ReadOutcome::Idle) => continue,
            Ok(ReadOutcome::EndOfStream) => {
                let _ = tx.send(WorkerEvent::EndOfStream);
                break;
            }
            Err(e @ Error::Connection { .. }) => {
                let _ = tx.send(WorkerEvent::Lost(e));
                break;
            }
            Err(e) => WorkerEvent::DecodeFailed(e),
        };

        if tx.send(event).is_err() {
            break;
        }
    }

    decoder.release();
}
