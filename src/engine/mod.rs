//! Execution-engine interface.
//!
//! The worker treats the script engine as an opaque capability: create
//! reusable contexts, then run one script at a time on a context while it
//! streams result items and watches a stop signal.
//!
//! Contexts run on blocking threads, so everything here is synchronous.
//! The [`session`](crate::session) layer bridges to async.
//!
//! # Implementations
//!
//! - [`lua::LuaEngine`] - Lua 5.4 states via `mlua` (the default engine)

pub mod lua;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::Sender;

pub use lua::LuaEngine;

/// How an engine run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The script ran to completion.
    Completed,
    /// The script was interrupted because its [`StopSignal`] fired.
    Stopped,
}

/// Engine-level failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineFault {
    /// The script itself failed (syntax error, runtime error, ...).
    #[error("{0}")]
    Script(String),

    /// The context could not be created or is unusable.
    #[error("execution context failure: {0}")]
    Context(String),
}

/// Cooperative stop request for one run.
///
/// Cloning shares the flag. Once fired it stays fired; every run gets a
/// fresh signal.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// A signal that has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to stop. Idempotent.
    pub fn fire(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_fired(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Channel on which a running script publishes result items, in order.
///
/// The channel is bounded: a script that outruns its reader blocks in
/// [`emit`](Self::emit) until the reader catches up.
#[derive(Debug, Clone)]
pub struct ItemSender(Sender<serde_json::Value>);

impl ItemSender {
    /// Wrap the sending half of an item channel.
    pub fn new(tx: Sender<serde_json::Value>) -> Self {
        Self(tx)
    }

    /// Publish one item, waiting for channel capacity.
    ///
    /// Returns `false` once nobody is listening anymore. Must be called from
    /// a blocking thread, never from inside the async runtime.
    pub fn emit(&self, item: serde_json::Value) -> bool {
        self.0.blocking_send(item).is_ok()
    }
}

/// A script engine able to create reusable execution contexts.
pub trait ScriptEngine: Send + Sync + 'static {
    /// Context type produced by this engine.
    type Context: ExecutionContext;

    /// Create a fresh context. Called lazily by the context pool.
    fn create_context(&self) -> Result<Self::Context, EngineFault>;
}

/// One reusable unit of interpreter state.
///
/// A context runs at most one script at a time; the pool guarantees
/// exclusive access for the whole run.
pub trait ExecutionContext: Send + 'static {
    /// Run `script`, publishing each result item on `items` as it is produced.
    ///
    /// Must check `stop` often enough to abandon long-running scripts, and
    /// report [`RunOutcome::Stopped`] rather than an error when it does.
    fn run_streaming(
        &mut self,
        script: &str,
        items: &ItemSender,
        stop: &StopSignal,
    ) -> Result<RunOutcome, EngineFault>;
}
