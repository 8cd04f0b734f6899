//! scriptserve - a warm script worker behind a local socket.
//!
//! Clients connect to a long-lived worker process (spawning it on first
//! use), send a script, and stream back its result items as they are
//! produced. Scripts can be cancelled in-band while they run.
//!
//! # Architecture
//!
//! - **Client** - connect-or-spawn, request, lazy result stream
//! - **Socket** - framed wire protocol, endpoint binding, listener loop,
//!   per-connection handler
//! - **Session** - runs scripts on a bounded pool of reusable contexts
//! - **Engine** - the script interpreter behind a small trait (Lua by default)
//!
//! # Modules
//!
//! - [`client`] - Connector and invocation stream
//! - [`config`] - Configuration loading
//! - [`engine`] - Execution-engine interface and the Lua engine
//! - [`session`] - Execution session and context pool
//! - [`socket`] - Wire protocol and worker-side IPC

pub mod client;
pub mod config;
pub mod constants;
pub mod engine;
pub mod session;
pub mod socket;

// Re-export commonly used types
pub use client::{ClientError, ConnectError, ConnectOptions, Connector, Invocation, Output};
pub use config::Config;
pub use engine::LuaEngine;
pub use session::ExecutionSession;
pub use socket::{Endpoint, Listener};
