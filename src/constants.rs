//! Application-wide constants for scriptserve.
//!
//! This module centralizes timeouts, defaults and reserved wire text so the
//! client and the worker agree on them.
//!
//! # Categories
//!
//! - **Timeouts**: connect probing, post-spawn waiting, accept retry
//! - **Defaults**: serialization depth, product prefix
//! - **Engine**: cooperative cancellation granularity, item buffering

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// Bound for the first connect attempt, before any worker is spawned.
///
/// Only transient "listener busy" errors are retried inside this window; a
/// missing or refused socket means nobody is listening and ends the probe.
pub const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Bound for connecting after a worker has been spawned.
///
/// Covers process start plus Lua state setup. Shouldn't take more than a
/// few hundred milliseconds, 3 seconds leaves room for a loaded machine.
pub const SPAWN_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Delay between connect attempts while waiting for a spawned worker.
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Delay before re-arming accept after an accept error.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Consecutive failed rebinds after which the listener gives up.
pub const MAX_REBIND_ATTEMPTS: u32 = 50;

/// How long in-flight connections may keep running once shutdown starts.
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Grace period between SIGTERM and SIGKILL when tearing down a worker.
pub const WORKER_KILL_GRACE: Duration = Duration::from_millis(200);

// ============================================================================
// Defaults
// ============================================================================

/// Product prefix used for endpoint names, socket directories and env vars.
pub const PRODUCT_PREFIX: &str = "scriptserve";

/// Name of the worker binary looked up in the resolved executable directory.
pub const WORKER_BINARY: &str = "scriptserve";

/// Result serialization depth used when a request carries none.
pub const DEFAULT_DEPTH: usize = 5;

/// Contexts per logical CPU when no explicit pool size is configured.
pub const CONTEXTS_PER_CPU: usize = 2;

// ============================================================================
// Engine
// ============================================================================

/// Lua instructions executed between stop-signal checks.
pub const LUA_HOOK_INSTRUCTIONS: u32 = 1000;

/// Result items buffered between a running script and its connection.
///
/// A script that emits faster than the client reads blocks once this many
/// items are waiting.
pub const ITEM_CHANNEL_CAPACITY: usize = 64;

/// Slice used by the Lua `sleep` primitive between stop-signal checks.
pub const LUA_SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Returns the default endpoint name for the current user.
///
/// `scriptserve-<user>`, where the user comes from `$USER` and falls back
/// to the numeric uid.
pub fn default_pipe_name() -> String {
    let user = std::env::var("USER")
        .ok()
        .filter(|u| !u.is_empty())
        // SAFETY: getuid has no preconditions and cannot fail.
        .unwrap_or_else(|| unsafe { libc::getuid() }.to_string());
    format!("{PRODUCT_PREFIX}-{user}")
}
