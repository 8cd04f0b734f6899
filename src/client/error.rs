//! Client-side error types.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::socket::framing::FrameError;

/// Failure to establish a channel to a worker.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// No listener became connectable after spawning a worker. The spawned
    /// process has been terminated.
    #[error(
        "no worker answered on {endpoint} within {timeout:?} after spawning pid {}: {last_error}",
        display_pid(*worker_pid)
    )]
    Timeout {
        /// Socket path that was tried.
        endpoint: String,
        /// The post-spawn connect bound.
        timeout: Duration,
        /// PID of the spawned worker, when known.
        worker_pid: Option<u32>,
        /// Last connect error observed.
        last_error: String,
    },

    /// The worker process could not be started.
    #[error("failed to spawn worker {program}: {source}")]
    Spawn {
        /// Program that was launched.
        program: String,
        /// Underlying spawn error.
        #[source]
        source: io::Error,
    },

    /// The worker did not come up in time and could not be terminated either.
    #[error(
        "worker pid {} did not answer on {endpoint} within {timeout:?} and could not be killed: {source}",
        display_pid(*worker_pid)
    )]
    Kill {
        /// Socket path that was tried.
        endpoint: String,
        /// The post-spawn connect bound.
        timeout: Duration,
        /// PID of the spawned worker, when known.
        worker_pid: Option<u32>,
        /// Underlying kill error.
        #[source]
        source: io::Error,
    },

    /// The caller cancelled while waiting for a worker.
    #[error("connect cancelled")]
    Cancelled,
}

fn display_pid(pid: Option<u32>) -> String {
    pid.map_or_else(|| "?".to_string(), |p| p.to_string())
}

/// Failure of one script invocation.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The channel could not be established.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// The channel failed mid-stream.
    #[error("channel failure: {0}")]
    Channel(#[from] FrameError),

    /// The channel ended before the end marker arrived.
    #[error("response truncated: channel closed before the end marker")]
    TruncatedResponse,

    /// The worker confirmed a cancel requested by the caller.
    #[error("cancelled by user")]
    CancelledByUser,

    /// The worker sent something the protocol does not allow.
    #[error("protocol violation: {0}")]
    Protocol(String),
}
