//! Endpoint identity, socket binding and worker PID files.
//!
//! # File Layout
//!
//! ```text
//! /tmp/scriptserve-{uid}/
//!   {name}.sock        # Unix domain socket the worker listens on
//!   {name}.pid         # PID of the worker process
//!   {name}.log         # worker log when spawned by a client
//! ```
//!
//! Sockets live in `/tmp` because macOS limits Unix socket paths to 104 bytes.
//! The directory is private to the user (created under umask 077), the socket
//! is chmod 0600, and the listener additionally drops peers whose uid differs
//! from its own.

use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::net::{UnixListener, UnixStream};

use crate::constants::{default_pipe_name, PRODUCT_PREFIX};

/// sun_path is 104 bytes on macOS, 108 on Linux; use the conservative limit.
pub const MAX_SOCKET_PATH: usize = 104;

/// A named local endpoint: the identity shared by one client and one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    name: String,
    path: PathBuf,
}

impl Endpoint {
    /// Per-user socket directory, `/tmp/scriptserve-{uid}`.
    pub fn socket_dir() -> PathBuf {
        // SAFETY: getuid has no preconditions and cannot fail.
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/{PRODUCT_PREFIX}-{uid}"))
    }

    /// Endpoint for an explicit name.
    pub fn named(name: &str) -> Result<Self> {
        if name.is_empty() || name.contains('/') || name.contains('\0') {
            bail!("Invalid endpoint name {name:?}: must be non-empty and contain no '/'");
        }
        Ok(Self {
            name: name.to_string(),
            path: Self::socket_dir().join(format!("{name}.sock")),
        })
    }

    /// Endpoint named `scriptserve-<user>`.
    pub fn default_for_user() -> Result<Self> {
        Self::named(&default_pipe_name())
    }

    /// Endpoint at an explicit socket path. The name is the file stem.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map_or_else(|| PRODUCT_PREFIX.to_string(), |s| s.to_string_lossy().into_owned());
        Self { name, path }
    }

    /// Endpoint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID file next to the socket.
    pub fn pid_path(&self) -> PathBuf {
        self.path.with_extension("pid")
    }

    /// Log file next to the socket, used by spawned workers.
    pub fn log_path(&self) -> PathBuf {
        self.path.with_extension("log")
    }

    /// Create the socket directory if needed, private to the current user.
    pub fn ensure_dir(&self) -> Result<()> {
        let Some(dir) = self.path.parent() else {
            return Ok(());
        };
        if dir.as_os_str().is_empty() || dir.exists() {
            return Ok(());
        }
        // Set restrictive umask before creating the directory to avoid a
        // TOCTOU race between mkdir and chmod on shared /tmp.
        // SAFETY: umask only swaps the process file-mode mask.
        let old_umask = unsafe { libc::umask(0o077) };
        let result = fs::create_dir_all(dir);
        // SAFETY: restores the mask saved above.
        unsafe {
            libc::umask(old_umask);
        }
        result.with_context(|| format!("Failed to create socket directory: {}", dir.display()))
    }

    /// Bind a listener on this endpoint.
    ///
    /// Removes a stale socket file (nobody answers on it) first. Fails if a
    /// live listener already owns the endpoint, so at most one worker
    /// serves a given identity.
    pub fn bind(&self) -> Result<BoundEndpoint> {
        let path_len = self.path.as_os_str().len();
        if path_len >= MAX_SOCKET_PATH {
            bail!(
                "Socket path too long ({path_len} bytes, max {}): {}\n\
                 Consider a shorter endpoint name.",
                MAX_SOCKET_PATH - 1,
                self.path.display()
            );
        }

        self.ensure_dir()?;

        if fs::symlink_metadata(&self.path).is_ok() {
            match std::os::unix::net::UnixStream::connect(&self.path) {
                Ok(_) => bail!("A worker is already listening on {}", self.path.display()),
                Err(e) => {
                    log::debug!("Removing stale socket {} ({e})", self.path.display());
                    fs::remove_file(&self.path).with_context(|| {
                        format!("Failed to remove stale socket: {}", self.path.display())
                    })?;
                }
            }
        }

        let listener = std::os::unix::net::UnixListener::bind(&self.path)
            .with_context(|| format!("Failed to bind socket: {}", self.path.display()))?;

        // Owner-only access on top of the private directory.
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        let inode = fs::metadata(&self.path)?.ino();

        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;

        log::info!("Listening on {}", self.path.display());
        Ok(BoundEndpoint {
            listener,
            path: self.path.clone(),
            inode,
        })
    }

    /// Record the current process as this endpoint's worker.
    pub fn write_pid(&self) -> Result<()> {
        self.ensure_dir()?;
        let path = self.pid_path();
        let pid = std::process::id();
        fs::write(&path, pid.to_string())
            .with_context(|| format!("Failed to write PID file: {}", path.display()))?;
        log::info!("Wrote PID file: {} (pid={})", path.display(), pid);
        Ok(())
    }

    /// Read the recorded worker PID.
    ///
    /// Returns `None` if the file doesn't exist or can't be parsed.
    pub fn read_pid(&self) -> Option<u32> {
        let contents = fs::read_to_string(self.pid_path()).ok()?;
        contents.trim().parse().ok()
    }

    /// Remove the PID file if it still names the current process.
    pub fn remove_pid(&self) {
        if self.read_pid() == Some(std::process::id()) {
            let _ = fs::remove_file(self.pid_path());
        }
    }

    /// Recorded worker PID, if that process is alive.
    pub fn running_pid(&self) -> Option<u32> {
        self.read_pid().filter(|&pid| is_process_alive(pid))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.path.display())
    }
}

/// Check whether a process exists, via `kill(pid, 0)`.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Whether the connected peer runs as the same user as this process.
pub fn is_same_user(stream: &UnixStream) -> io::Result<bool> {
    let cred = stream.peer_cred()?;
    // SAFETY: getuid has no preconditions and cannot fail.
    Ok(cred.uid() == unsafe { libc::getuid() })
}

/// A bound listening socket.
///
/// Dropping it removes the socket file, unless the file has since been
/// replaced by another listener's.
#[derive(Debug)]
pub struct BoundEndpoint {
    listener: UnixListener,
    path: PathBuf,
    inode: u64,
}

impl BoundEndpoint {
    /// Wait for the next connection.
    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }

    /// Whether the socket file on disk is still ours.
    pub fn is_present(&self) -> bool {
        fs::metadata(&self.path).is_ok_and(|m| m.ino() == self.inode)
    }

    /// Socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BoundEndpoint {
    fn drop(&mut self) {
        if self.is_present() {
            let _ = fs::remove_file(&self.path);
            log::debug!("Released socket {}", self.path.display());
        }
    }
}
