//! Listener loop: accepts connections on an endpoint and dispatches each
//! one to its own handler task.
//!
//! ```text
//! Bound ──► Accepting ──(connect)──► dispatch ──► Accepting
//!               │   └──(accept error)──► rebind ──┘
//!               └──(shutdown)──► Stopped
//! ```
//!
//! One bound Unix socket serves many accepts, so the listener only
//! re-creates the socket when accept fails or its file has vanished from
//! disk. Handlers run detached from the loop; their results flow into a
//! `JoinSet` that doubles as the fault sink, so a failing or panicking
//! handler is logged and never takes the loop down.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use super::endpoint::{self, BoundEndpoint, Endpoint};
use super::handler::handle_connection;
use crate::constants::{ACCEPT_RETRY_DELAY, MAX_REBIND_ATTEMPTS, SHUTDOWN_DRAIN_TIMEOUT};
use crate::engine::ScriptEngine;
use crate::session::ExecutionSession;

/// Where the listener is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Socket bound, not yet accepting.
    Bound,
    /// Inside the accept loop.
    Accepting,
    /// Shut down; the socket has been released.
    Stopped,
}

/// Accept loop state for one endpoint.
///
/// Constructed once per worker process and owned by whoever drives
/// [`Listener::serve`].
#[derive(Debug)]
pub struct Listener {
    endpoint: Endpoint,
    bound: Option<BoundEndpoint>,
    state: ListenerState,
    retries: HashMap<io::ErrorKind, u32>,
    sessions: u64,
}

impl Listener {
    /// Bind the endpoint.
    ///
    /// Fails if another listener already owns it.
    pub fn bind(endpoint: Endpoint) -> Result<Self> {
        let bound = endpoint
            .bind()
            .with_context(|| format!("Failed to bind endpoint {endpoint}"))?;
        Ok(Self {
            endpoint,
            bound: Some(bound),
            state: ListenerState::Bound,
            retries: HashMap::new(),
            sessions: 0,
        })
    }

    /// Endpoint this listener serves.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Accept/bind failures seen so far, by error kind.
    pub fn retry_counts(&self) -> &HashMap<io::ErrorKind, u32> {
        &self.retries
    }

    /// Connections dispatched so far.
    pub fn sessions_started(&self) -> u64 {
        self.sessions
    }

    /// Accept and dispatch connections until `shutdown` fires.
    ///
    /// On shutdown the socket is released immediately. In-flight handlers
    /// see the same token (through their per-request child token) and get
    /// a bounded grace period to write their final frames; any still
    /// running after that are detached, not aborted.
    pub async fn serve<E: ScriptEngine>(
        &mut self,
        session: Arc<ExecutionSession<E>>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut handlers: JoinSet<Result<()>> = JoinSet::new();
        let mut failed_rebinds: u32 = 0;
        self.state = ListenerState::Accepting;
        log::info!("Accepting connections on {}", self.endpoint);

        loop {
            if self.bound.is_none() {
                if self.rebind() {
                    failed_rebinds = 0;
                } else {
                    failed_rebinds += 1;
                    if failed_rebinds >= MAX_REBIND_ATTEMPTS {
                        self.state = ListenerState::Stopped;
                        anyhow::bail!(
                            "Giving up on {} after {} failed rebinds",
                            self.endpoint,
                            failed_rebinds
                        );
                    }
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(ACCEPT_RETRY_DELAY) => continue,
                    }
                }
            }
            let Some(bound) = self.bound.as_ref() else {
                continue;
            };

            let accepted = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    report_handler(joined);
                    continue;
                }
                accepted = bound.accept() => accepted,
            };

            match accepted {
                Ok(stream) => {
                    // Make sure the endpoint stays connectable before this
                    // connection is handed off.
                    if !bound.is_present() {
                        log::warn!("Socket file for {} disappeared, rebinding", self.endpoint);
                        self.rebind();
                    }

                    match endpoint::is_same_user(&stream) {
                        Ok(true) => {}
                        Ok(false) => {
                            log::warn!("Dropping connection from a different user");
                            continue;
                        }
                        Err(e) => {
                            log::warn!("Dropping connection with unknown peer credentials: {e}");
                            continue;
                        }
                    }

                    self.sessions += 1;
                    let session_id = self.sessions;
                    log::debug!("[session-{}] Accepted", session_id);
                    handlers.spawn(handle_connection(
                        stream,
                        Arc::clone(&session),
                        shutdown.clone(),
                        session_id,
                    ));
                }
                Err(e) => {
                    let count = self.record_retry(e.kind());
                    log::warn!("Accept failed ({:?}, seen {} times): {}", e.kind(), count, e);
                    self.bound = None;
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    }
                }
            }
        }

        self.bound = None;
        self.state = ListenerState::Stopped;
        log::info!(
            "Listener stopped after {} sessions ({} still running)",
            self.sessions,
            handlers.len()
        );
        drain(&mut handlers, SHUTDOWN_DRAIN_TIMEOUT).await;
        Ok(())
    }

    /// Replace the bound socket. Returns whether a socket is bound afterwards.
    fn rebind(&mut self) -> bool {
        self.bound = None;
        match self.endpoint.bind() {
            Ok(bound) => {
                log::info!("Rebound {}", self.endpoint);
                self.bound = Some(bound);
                true
            }
            Err(e) => {
                let kind = e
                    .downcast_ref::<io::Error>()
                    .map_or(io::ErrorKind::Other, io::Error::kind);
                let count = self.record_retry(kind);
                log::warn!("Rebind of {} failed ({:?}, seen {} times): {:#}", self.endpoint, kind, count, e);
                false
            }
        }
    }

    fn record_retry(&mut self, kind: io::ErrorKind) -> u32 {
        let count = self.retries.entry(kind).or_insert(0);
        *count += 1;
        *count
    }
}

/// Fault sink for finished connection handlers.
fn report_handler(joined: Result<Result<()>, JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("Connection handler failed: {e:#}"),
        Err(e) if e.is_panic() => log::error!("Connection handler panicked: {e}"),
        Err(e) => log::debug!("Connection handler cancelled: {e}"),
    }
}

/// Give running handlers up to `grace` to finish, then detach the rest.
async fn drain(handlers: &mut JoinSet<Result<()>>, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    while !handlers.is_empty() {
        match tokio::time::timeout_at(deadline, handlers.join_next()).await {
            Ok(Some(joined)) => report_handler(joined),
            Ok(None) => break,
            Err(_) => {
                log::warn!("Detaching {} handlers still running at shutdown", handlers.len());
                handlers.detach_all();
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LuaEngine;
    use crate::socket::framing::{Frame, FrameReader, FrameWriter};
    use crate::socket::protocol::Marker;
    use tokio::net::UnixStream;

    fn session() -> Arc<ExecutionSession<LuaEngine>> {
        Arc::new(ExecutionSession::with_max_contexts(LuaEngine::new(), 2))
    }

    async fn roundtrip(path: &std::path::Path, script: &str) -> Vec<Frame> {
        let stream = UnixStream::connect(path).await.unwrap();
        let (r, w) = stream.into_split();
        let mut reader = FrameReader::new(r);
        let mut writer = FrameWriter::new(w);
        writer.write_frame(&Frame::Data(script.into())).await.unwrap();
        let mut frames = Vec::new();
        loop {
            let frame = reader.read_frame().await.unwrap();
            let done = frame == Frame::Control(Marker::End);
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }

    #[tokio::test]
    async fn test_serve_until_shutdown_releases_socket() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::at_path(dir.path().join("loop.sock"));
        let path = endpoint.path().to_path_buf();

        let mut listener = Listener::bind(endpoint).unwrap();
        assert_eq!(listener.state(), ListenerState::Bound);

        let shutdown = CancellationToken::new();
        let serve_shutdown = shutdown.clone();
        let task = tokio::spawn(async move {
            listener.serve(session(), serve_shutdown).await.unwrap();
            listener
        });

        let frames = roundtrip(&path, "return 1").await;
        assert_eq!(frames, vec![Frame::Data("1".into()), Frame::Control(Marker::End)]);
        let frames = roundtrip(&path, "return 2").await;
        assert_eq!(frames, vec![Frame::Data("2".into()), Frame::Control(Marker::End)]);

        shutdown.cancel();
        let listener = task.await.unwrap();
        assert_eq!(listener.state(), ListenerState::Stopped);
        assert_eq!(listener.sessions_started(), 2);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_missing_socket_file_is_rebound_on_accept() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::at_path(dir.path().join("gone.sock"));
        let path = endpoint.path().to_path_buf();
        let mut listener = Listener::bind(endpoint).unwrap();

        // Queue a connection, then delete the file before it is accepted.
        let early = UnixStream::connect(&path).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        let shutdown = CancellationToken::new();
        let serve_shutdown = shutdown.clone();
        let task = tokio::spawn(async move {
            listener.serve(session(), serve_shutdown).await.unwrap();
        });

        let mut rebound = false;
        for _ in 0..100 {
            if path.exists() {
                rebound = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(rebound, "socket was not re-created");

        let frames = roundtrip(&path, "return 'again'").await;
        assert_eq!(frames.last(), Some(&Frame::Control(Marker::End)));

        drop(early);
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_in_flight_handler_is_cancelled_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::at_path(dir.path().join("busy.sock"));
        let path = endpoint.path().to_path_buf();
        let mut listener = Listener::bind(endpoint).unwrap();

        let shutdown = CancellationToken::new();
        let serve_shutdown = shutdown.clone();
        let task = tokio::spawn(async move {
            listener.serve(session(), serve_shutdown).await.unwrap();
        });

        let stream = UnixStream::connect(&path).await.unwrap();
        let (r, w) = stream.into_split();
        let mut reader = FrameReader::new(r);
        let mut writer = FrameWriter::new(w);
        writer
            .write_frame(&Frame::Data("emit('up') while true do sleep(5) end".into()))
            .await
            .unwrap();
        assert_eq!(reader.read_frame().await.unwrap(), Frame::Data("\"up\"".into()));

        shutdown.cancel();
        assert_eq!(reader.read_frame().await.unwrap(), Frame::Control(Marker::Cancelled));
        assert_eq!(reader.read_frame().await.unwrap(), Frame::Control(Marker::End));
        task.await.unwrap();
    }

    #[test]
    fn test_retry_counts_by_kind() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();
        let dir = tempfile::tempdir().unwrap();
        let mut listener = Listener::bind(Endpoint::at_path(dir.path().join("r.sock"))).unwrap();

        assert_eq!(listener.record_retry(io::ErrorKind::ConnectionAborted), 1);
        assert_eq!(listener.record_retry(io::ErrorKind::ConnectionAborted), 2);
        assert_eq!(listener.record_retry(io::ErrorKind::Other), 1);
        assert_eq!(listener.retry_counts()[&io::ErrorKind::ConnectionAborted], 2);
    }
}
