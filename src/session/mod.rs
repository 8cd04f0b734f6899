//! Execution session: runs one script on a pooled context and streams its
//! result items to a sink as they are produced.
//!
//! ```text
//! run_and_stream ── acquire ──► ContextPool ──► PooledContext
//!        │                                          │ spawn_blocking
//!        │ ◄──────── mpsc (serde_json::Value) ───── run_streaming
//!        │
//!        ├─ render_item(depth) ──► ItemSink::item
//!        └─ cancel token fired ──► StopSignal::fire
//! ```
//!
//! The engine runs on a blocking thread so the async side stays free to
//! forward items and to watch the cancellation token at the same time.
//! The item channel is bounded, so a script emitting faster than the sink
//! accepts blocks instead of queueing without limit.

pub mod pool;
pub mod render;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants::{CONTEXTS_PER_CPU, ITEM_CHANNEL_CAPACITY};
use crate::engine::{EngineFault, ExecutionContext, ItemSender, RunOutcome, ScriptEngine, StopSignal};
use crate::socket::framing::FrameError;
use pool::ContextPool;
pub use render::render_item;

/// Destination for rendered result items and inline diagnostics.
#[async_trait]
pub trait ItemSink: Send {
    /// Deliver one rendered result item.
    async fn item(&mut self, text: String) -> Result<(), FrameError>;

    /// Deliver inline diagnostic text (a script-level error).
    async fn error(&mut self, text: String) -> Result<(), FrameError>;
}

/// How a streamed run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The script finished, possibly with an inline script error.
    Completed,
    /// The run was abandoned because the cancellation token fired.
    Cancelled,
}

/// A run that could not be carried out.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The engine could not provide a usable context.
    #[error("engine failure: {0}")]
    Engine(#[from] EngineFault),

    /// The execution task panicked or was aborted.
    #[error("execution task failed: {0}")]
    Panicked(String),

    /// The sink stopped accepting output.
    #[error("failed to deliver output: {0}")]
    Delivery(#[source] FrameError),
}

/// Runs scripts against a lazily created, bounded pool of contexts.
pub struct ExecutionSession<E: ScriptEngine> {
    engine: Arc<E>,
    pool: OnceLock<ContextPool<E::Context>>,
    max_contexts: usize,
    runs: AtomicU64,
}

impl<E: ScriptEngine> std::fmt::Debug for ExecutionSession<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionSession")
            .field("max_contexts", &self.max_contexts)
            .field("pool_created", &self.pool.get().is_some())
            .field("runs", &self.runs.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<E: ScriptEngine> ExecutionSession<E> {
    /// Session sized to two contexts per logical CPU.
    pub fn new(engine: E) -> Self {
        Self::with_max_contexts(engine, num_cpus::get() * CONTEXTS_PER_CPU)
    }

    /// Session with an explicit pool capacity.
    pub fn with_max_contexts(engine: E, max_contexts: usize) -> Self {
        Self {
            engine: Arc::new(engine),
            pool: OnceLock::new(),
            max_contexts: max_contexts.max(1),
            runs: AtomicU64::new(0),
        }
    }

    /// Configured pool capacity.
    pub fn max_contexts(&self) -> usize {
        self.max_contexts
    }

    /// Contexts created so far (0 until the first run).
    pub fn contexts_created(&self) -> usize {
        self.pool.get().map_or(0, ContextPool::created_count)
    }

    fn pool(&self) -> &ContextPool<E::Context> {
        self.pool.get_or_init(|| {
            log::info!("Creating execution context pool (capacity {})", self.max_contexts);
            ContextPool::new(self.max_contexts)
        })
    }

    /// Run `script` and stream each item, rendered at `depth`, into `sink`.
    ///
    /// Items reach the sink in production order. A script-level error is
    /// delivered through [`ItemSink::error`] after the items produced before
    /// it and the run still counts as [`StreamOutcome::Completed`]. When
    /// `cancel` fires the engine is asked to stop and the run reports
    /// [`StreamOutcome::Cancelled`]; if it fired before the run started,
    /// nothing runs at all.
    pub async fn run_and_stream(
        &self,
        script: &str,
        depth: usize,
        sink: &mut dyn ItemSink,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, SessionError> {
        if cancel.is_cancelled() {
            log::debug!("Cancelled before start, nothing run");
            return Ok(StreamOutcome::Cancelled);
        }

        let engine = Arc::clone(&self.engine);
        let mut pooled = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                log::debug!("Cancelled while waiting for a context");
                return Ok(StreamOutcome::Cancelled);
            }
            acquired = self.pool().acquire(|| engine.create_context()) => acquired?,
        };
        let run_id = self.runs.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("[run-{}] Starting ({} bytes, depth {})", run_id, script.len(), depth);

        let (tx, mut rx) = mpsc::channel(ITEM_CHANNEL_CAPACITY);
        let items = ItemSender::new(tx);
        let stop = StopSignal::new();
        let run_stop = stop.clone();
        let script = script.to_owned();
        let mut run = tokio::task::spawn_blocking(move || {
            let outcome = pooled.run_streaming(&script, &items, &run_stop);
            pooled.recycle();
            outcome
        });

        let mut stop_requested = false;
        let mut delivery_error: Option<FrameError> = None;
        let joined = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled(), if !stop_requested => {
                    log::debug!("[run-{}] Cancel requested, stopping engine", run_id);
                    stop_requested = true;
                    stop.fire();
                }
                Some(item) = rx.recv(), if delivery_error.is_none() => {
                    if let Err(e) = sink.item(render_item(&item, depth)).await {
                        // Nobody reads the channel from here on; closing it
                        // releases an engine blocked on a full buffer.
                        stop.fire();
                        rx.close();
                        delivery_error = Some(e);
                    }
                }
                joined = &mut run => break joined,
            }
        };

        let result = joined.map_err(|e| {
            log::error!("[run-{}] Execution task failed: {}", run_id, e);
            SessionError::Panicked(e.to_string())
        })?;
        if let Some(e) = delivery_error {
            log::debug!("[run-{}] Sink closed: {}", run_id, e);
            return Err(SessionError::Delivery(e));
        }

        // The engine is finished; whatever is still queued was produced
        // before it returned.
        while let Ok(item) = rx.try_recv() {
            sink.item(render_item(&item, depth))
                .await
                .map_err(SessionError::Delivery)?;
        }

        match result {
            Ok(RunOutcome::Completed) => {
                log::debug!("[run-{}] Completed", run_id);
                Ok(StreamOutcome::Completed)
            }
            Ok(RunOutcome::Stopped) => {
                log::debug!("[run-{}] Stopped", run_id);
                Ok(StreamOutcome::Cancelled)
            }
            Err(EngineFault::Script(message)) => {
                log::debug!("[run-{}] Script error: {}", run_id, message);
                sink.error(message).await.map_err(SessionError::Delivery)?;
                Ok(StreamOutcome::Completed)
            }
            Err(fault) => Err(SessionError::Engine(fault)),
        }
    }
}
