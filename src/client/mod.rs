//! Client connector: connect to the warm worker, spawning one on demand,
//! then stream a script's results.
//!
//! ```text
//! probe (500ms) ──ok──────────────────────────────► write request
//!      │ nobody listening                                 │
//!      ▼                                                  ▼
//! launch worker ──► poll connect every 25ms (3s) ──► Invocation::next()
//!      │ timeout                                     items / errors
//!      ▼                                             until <<END>>
//! terminate worker, ConnectError::Timeout
//! ```
//!
//! A failed invocation is never retried: the script may have side effects.

mod error;
pub mod launcher;

use std::io;
use std::path::Path;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::constants::{CONNECT_PROBE_TIMEOUT, CONNECT_RETRY_INTERVAL, DEFAULT_DEPTH, SPAWN_CONNECT_TIMEOUT};
use crate::socket::framing::{Frame, FrameError, FrameReader, FrameWriter};
use crate::socket::protocol::{Marker, Request};
use crate::socket::Endpoint;
pub use error::{ClientError, ConnectError};
pub use launcher::{LaunchTarget, ProcessLauncher, WorkerHandle, WorkerLauncher};

/// Tunables for connecting and invoking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Serialization depth sent with each request.
    pub depth: usize,
    /// Bound for the first connect attempt.
    pub probe_timeout: Duration,
    /// Bound for connecting after a worker was spawned.
    pub spawn_timeout: Duration,
    /// Delay between post-spawn connect attempts.
    pub retry_interval: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            depth: DEFAULT_DEPTH,
            probe_timeout: CONNECT_PROBE_TIMEOUT,
            spawn_timeout: SPAWN_CONNECT_TIMEOUT,
            retry_interval: CONNECT_RETRY_INTERVAL,
        }
    }
}

/// Connects to the worker for one endpoint, launching it when absent.
pub struct Connector {
    endpoint: Endpoint,
    options: ConnectOptions,
    launcher: Box<dyn WorkerLauncher>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("endpoint", &self.endpoint)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Connector {
    /// Connector with default options.
    pub fn new(endpoint: Endpoint, launcher: impl WorkerLauncher + 'static) -> Self {
        Self {
            endpoint,
            options: ConnectOptions::default(),
            launcher: Box::new(launcher),
        }
    }

    /// Replace the options.
    pub fn with_options(mut self, options: ConnectOptions) -> Self {
        self.options = options;
        self
    }

    /// Endpoint this connector targets.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Current options.
    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Connect to the worker, spawning it at most once if nobody answers
    /// the probe.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<UnixStream, ConnectError> {
        let path = self.endpoint.path();
        match probe(path, self.options.probe_timeout, self.options.retry_interval).await {
            Ok(stream) => {
                log::debug!("Connected to running worker on {}", self.endpoint);
                return Ok(stream);
            }
            Err(e) => {
                log::debug!("No worker answered on {} ({})", self.endpoint, e);
            }
        }

        let mut worker = self.launcher.launch(&self.endpoint)?;
        let waited = tokio::select! {
            () = cancel.cancelled() => return Err(ConnectError::Cancelled),
            waited = wait_for_listener(path, self.options.spawn_timeout, self.options.retry_interval) => waited,
        };

        match waited {
            Ok(stream) => {
                log::debug!("Connected to spawned worker {:?} on {}", worker.pid(), self.endpoint);
                Ok(stream)
            }
            Err(last_error) => {
                let worker_pid = worker.pid();
                log::warn!(
                    "Worker {:?} did not answer on {} within {:?}, terminating it",
                    worker_pid,
                    self.endpoint,
                    self.options.spawn_timeout
                );
                let endpoint = path.display().to_string();
                let timeout = self.options.spawn_timeout;
                // Termination waits out a grace period; keep it off the runtime.
                let terminated = tokio::task::spawn_blocking(move || worker.terminate())
                    .await
                    .unwrap_or_else(|e| Err(io::Error::other(e)));
                match terminated {
                    Ok(()) => Err(ConnectError::Timeout {
                        endpoint,
                        timeout,
                        worker_pid,
                        last_error: last_error.to_string(),
                    }),
                    Err(source) => Err(ConnectError::Kill {
                        endpoint,
                        timeout,
                        worker_pid,
                        source,
                    }),
                }
            }
        }
    }

    /// Run `script` on the worker and return its result stream.
    ///
    /// When `cancel` fires, `<<CANCEL>>` is sent once and reading goes on
    /// until the worker confirms.
    pub async fn invoke(&self, script: &str, cancel: CancellationToken) -> Result<Invocation, ClientError> {
        let stream = self.connect(&cancel).await?;
        let (read_half, write_half) = stream.into_split();
        let mut writer = FrameWriter::new(write_half);

        let request = Request::new(script, self.options.depth);
        log::debug!("Sending request ({} bytes, depth {})", script.len(), request.depth);
        writer.write_frame(&Frame::Data(request.encode())).await?;

        Ok(Invocation {
            reader: FrameReader::new(read_half),
            writer,
            cancel,
            cancel_sent: false,
            cancel_confirmed: false,
            finished: false,
        })
    }
}

/// One output of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// A rendered result item.
    Item(String),
    /// Inline diagnostic text (script error or server error).
    Error(String),
}

/// The result stream of one invocation.
///
/// Lazy and not restartable: each call to [`next`](Self::next) reads from
/// the channel.
#[derive(Debug)]
pub struct Invocation {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    cancel: CancellationToken,
    cancel_sent: bool,
    cancel_confirmed: bool,
    finished: bool,
}

enum Step {
    Cancel,
    Frame(Result<Frame, FrameError>),
}

impl Invocation {
    /// Next output, or `None` after the end marker of a completed run.
    ///
    /// A confirmed cancel ends the stream with
    /// [`ClientError::CancelledByUser`]; a channel that closes before the
    /// end marker ends it with [`ClientError::TruncatedResponse`].
    pub async fn next(&mut self) -> Option<Result<Output, ClientError>> {
        if self.finished {
            return None;
        }
        loop {
            let step = if self.cancel_sent {
                Step::Frame(self.reader.read_frame().await)
            } else {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => Step::Cancel,
                    frame = self.reader.read_frame() => Step::Frame(frame),
                }
            };

            match step {
                Step::Cancel => self.send_cancel().await,
                Step::Frame(Ok(Frame::Data(text))) => return Some(Ok(Output::Item(text))),
                Step::Frame(Ok(Frame::Error(text))) => return Some(Ok(Output::Error(text))),
                Step::Frame(Ok(Frame::Control(Marker::Cancelled))) => {
                    log::debug!("Worker confirmed cancel");
                    self.cancel_confirmed = true;
                }
                Step::Frame(Ok(Frame::Control(Marker::End))) => {
                    self.finished = true;
                    return self
                        .cancel_confirmed
                        .then_some(Err(ClientError::CancelledByUser));
                }
                Step::Frame(Ok(Frame::Control(Marker::Cancel))) => {
                    self.finished = true;
                    return Some(Err(ClientError::Protocol(
                        "worker sent a cancel request".into(),
                    )));
                }
                Step::Frame(Err(FrameError::EndOfChannel)) => {
                    self.finished = true;
                    return Some(Err(ClientError::TruncatedResponse));
                }
                Step::Frame(Err(e)) => {
                    self.finished = true;
                    return Some(Err(ClientError::Channel(e)));
                }
            }
        }
    }

    /// Whether `<<CANCEL>>` has been sent.
    pub fn cancel_sent(&self) -> bool {
        self.cancel_sent
    }

    /// The remaining outputs as a stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<Output, ClientError>> {
        stream::unfold(self, |mut invocation| async move {
            let next = invocation.next().await?;
            Some((next, invocation))
        })
    }

    async fn send_cancel(&mut self) {
        self.cancel_sent = true;
        log::debug!("Sending cancel request");
        // A worker that already finished may have closed the channel; the
        // read side reports how the response ended either way.
        if let Err(e) = self.writer.write_frame(&Frame::Control(Marker::Cancel)).await {
            log::debug!("Cancel request not delivered: {}", e);
        }
    }
}

/// Errors meaning "nobody is listening" rather than "listener is busy".
fn is_absent(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused | io::ErrorKind::AddrNotAvailable
    )
}

/// First connect attempt. Retries only while the listener is busy.
async fn probe(path: &Path, timeout: Duration, interval: Duration) -> io::Result<UnixStream> {
    let deadline = Instant::now() + timeout;
    loop {
        let attempt = tokio::time::timeout_at(deadline, UnixStream::connect(path)).await;
        match attempt {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) if is_absent(&e) => return Err(e),
            Ok(Err(e)) => {
                if Instant::now() + interval >= deadline {
                    return Err(e);
                }
                log::trace!("Listener busy ({}), retrying", e);
                tokio::time::sleep(interval).await;
            }
            Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "connect probe timed out")),
        }
    }
}

/// Poll `path` until a listener answers or `timeout` elapses. Returns the
/// last connect error on timeout.
async fn wait_for_listener(path: &Path, timeout: Duration, interval: Duration) -> io::Result<UnixStream> {
    let deadline = Instant::now() + timeout;
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if Instant::now() + interval >= deadline {
                    return Err(e);
                }
                log::trace!("Worker not ready ({}), retrying", e);
                tokio::time::sleep(interval).await;
            }
        }
    }
}
