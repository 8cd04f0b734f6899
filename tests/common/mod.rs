// Shared helpers for integration tests: an in-process worker bound to a
// socket in a temporary directory, and a raw protocol client.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use scriptserve::socket::{Frame, FrameReader, FrameWriter, Marker, Request};
use scriptserve::{Endpoint, ExecutionSession, Listener, LuaEngine};
use tempfile::TempDir;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A listener serving a Lua session inside the test process.
pub struct TestWorker {
    pub endpoint: Endpoint,
    pub shutdown: CancellationToken,
    task: JoinHandle<Listener>,
    _dir: TempDir,
}

impl TestWorker {
    /// Bind a fresh endpoint and start serving.
    pub fn start(max_contexts: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::at_path(dir.path().join("worker.sock"));
        let mut listener = Listener::bind(endpoint.clone()).unwrap();
        let shutdown = CancellationToken::new();
        let session = Arc::new(ExecutionSession::with_max_contexts(LuaEngine::new(), max_contexts));

        let serve_shutdown = shutdown.clone();
        let task = tokio::spawn(async move {
            listener.serve(session, serve_shutdown).await.unwrap();
            listener
        });

        Self {
            endpoint,
            shutdown,
            task,
            _dir: dir,
        }
    }

    pub fn path(&self) -> &Path {
        self.endpoint.path()
    }

    /// Shut the listener down and hand it back for inspection.
    pub async fn stop(self) -> Listener {
        self.shutdown.cancel();
        self.task.await.unwrap()
    }
}

/// One raw protocol connection.
pub struct RawClient {
    pub reader: FrameReader<OwnedReadHalf>,
    pub writer: FrameWriter<OwnedWriteHalf>,
}

impl RawClient {
    /// Connect and send a request.
    pub async fn request(path: &Path, script: &str, depth: usize) -> Self {
        let stream = UnixStream::connect(path).await.unwrap();
        let (r, w) = stream.into_split();
        let mut client = Self {
            reader: FrameReader::new(r),
            writer: FrameWriter::new(w),
        };
        client
            .writer
            .write_frame(&Frame::Data(Request::new(script, depth).encode()))
            .await
            .unwrap();
        client
    }

    pub async fn send_cancel(&mut self) {
        self.writer.write_frame(&Frame::Control(Marker::Cancel)).await.unwrap();
    }

    pub async fn next_frame(&mut self) -> Frame {
        tokio::time::timeout(Duration::from_secs(10), self.reader.read_frame())
            .await
            .expect("worker stalled")
            .unwrap()
    }

    /// Read frames up to and including `<<END>>`.
    pub async fn read_to_end(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            let frame = self.next_frame().await;
            let done = frame == Frame::Control(Marker::End);
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }
}

/// Data payloads in order.
pub fn items(frames: &[Frame]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::Data(text) => Some(text.clone()),
            _ => None,
        })
        .collect()
}

/// Path to the compiled binary.
pub fn binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_scriptserve"))
}
