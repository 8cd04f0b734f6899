//! Unix domain socket IPC between clients and the warm worker.
//!
//! # Architecture
//!
//! ```text
//! Worker Process                          Client Process (scriptserve invoke)
//! ┌──────────────────────┐               ┌──────────────────┐
//! │ Listener             │               │ Connector        │
//! │  BoundEndpoint       │◄─────────────►│  UnixStream      │
//! │  handle_connection   │  frames over  │  Invocation      │
//! │  per connection      │  Unix socket  │                  │
//! └──────────┬───────────┘               └──────────────────┘
//!            │ run_and_stream
//!            ▼
//!     ExecutionSession (context pool)
//! ```
//!
//! # Wire Protocol
//!
//! Length-prefixed frames: `[u32 LE length][u8 kind][payload]`
//!
//! See [`framing`] for frame kinds and codec, [`protocol`] for the request
//! and marker vocabulary.

pub mod endpoint;
pub mod framing;
pub mod handler;
pub mod protocol;
pub mod server;

pub use endpoint::Endpoint;
pub use framing::{Frame, FrameError, FrameReader, FrameWriter};
pub use protocol::{Marker, Request};
pub use server::{Listener, ListenerState};
