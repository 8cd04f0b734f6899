//! Worker launch: where the worker binary lives and how it is started.
//!
//! The connector only spawns through the [`WorkerLauncher`] trait, so tests
//! (and embedders) can start workers in-process instead of as a child
//! process.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use super::error::ConnectError;
use crate::constants::{WORKER_BINARY, WORKER_KILL_GRACE};
use crate::socket::Endpoint;

/// Environment variable naming the directory that holds the worker binary.
pub const EXE_DIR_ENV: &str = "SCRIPTSERVE_EXE_DIR";

/// Environment variable telling a spawned worker where to log.
pub const LOG_FILE_ENV: &str = "SCRIPTSERVE_LOG_FILE";

/// Starts a worker bound to an endpoint.
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker that will listen on `endpoint`.
    ///
    /// Must return promptly; the connector polls the endpoint afterwards.
    fn launch(&self, endpoint: &Endpoint) -> Result<Box<dyn WorkerHandle>, ConnectError>;
}

/// A started worker, as seen by the connector that launched it.
///
/// Dropping the handle leaves the worker running.
pub trait WorkerHandle: Send + fmt::Debug {
    /// Process id, when the worker is a separate process.
    fn pid(&self) -> Option<u32>;

    /// Stop the worker and wait until it is gone.
    ///
    /// May block for a grace period; the connector calls it on a blocking
    /// thread.
    fn terminate(&mut self) -> io::Result<()>;
}

/// Program and arguments used to start a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTarget {
    /// Executable to run.
    pub program: PathBuf,
    /// Arguments placed before `serve --socket <path>`.
    pub prefix_args: Vec<OsString>,
    /// Working directory for the worker, if any.
    pub working_dir: Option<PathBuf>,
}

impl LaunchTarget {
    /// Resolve the worker binary location.
    ///
    /// Directory precedence: `exe_dir`, then `$SCRIPTSERVE_EXE_DIR`, then
    /// the directory of the running executable, then the current directory.
    pub fn resolve(exe_dir: Option<&Path>, working_dir: Option<&Path>) -> Self {
        Self::resolve_with(exe_dir, working_dir, |key| std::env::var_os(key))
    }

    /// [`resolve`](Self::resolve) with an explicit environment lookup.
    pub fn resolve_with<F>(exe_dir: Option<&Path>, working_dir: Option<&Path>, env: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let dir = exe_dir
            .map(Path::to_path_buf)
            .or_else(|| env(EXE_DIR_ENV).filter(|v| !v.is_empty()).map(PathBuf::from))
            .or_else(|| {
                std::env::current_exe()
                    .ok()
                    .and_then(|exe| exe.parent().map(Path::to_path_buf))
            })
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            program: dir.join(WORKER_BINARY),
            prefix_args: Vec::new(),
            working_dir: working_dir.map(Path::to_path_buf),
        }
    }

    /// Run an arbitrary program, with `prefix_args` before the worker arguments.
    pub fn command(program: impl Into<PathBuf>, prefix_args: &[&str]) -> Self {
        Self {
            program: program.into(),
            prefix_args: prefix_args.iter().map(OsString::from).collect(),
            working_dir: None,
        }
    }

    /// Set the worker's working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Launches workers as detached child processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    target: LaunchTarget,
}

impl ProcessLauncher {
    /// Launcher for a resolved target.
    pub fn new(target: LaunchTarget) -> Self {
        Self { target }
    }

    /// Target this launcher starts.
    pub fn target(&self) -> &LaunchTarget {
        &self.target
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, endpoint: &Endpoint) -> Result<Box<dyn WorkerHandle>, ConnectError> {
        let mut cmd = Command::new(&self.target.program);
        cmd.args(&self.target.prefix_args)
            .arg("serve")
            .arg("--socket")
            .arg(endpoint.path())
            .env(LOG_FILE_ENV, endpoint.log_path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // Own process group: a Ctrl-C aimed at the client must not
            // reach the worker.
            .process_group(0);
        if let Some(dir) = &self.target.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|source| ConnectError::Spawn {
            program: self.target.program.display().to_string(),
            source,
        })?;
        log::info!(
            "Spawned worker {} (pid {}) for {}",
            self.target.program.display(),
            child.id(),
            endpoint
        );
        Ok(Box::new(ProcessHandle { child }))
    }
}

/// Handle to a worker child process.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
}

impl WorkerHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    /// SIGTERM, a short grace period, then SIGKILL; always reaps.
    fn terminate(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }

        let pid = libc::pid_t::try_from(self.child.id())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: plain signal delivery to our own child.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }

        let deadline = Instant::now() + WORKER_KILL_GRACE;
        while Instant::now() < deadline {
            if self.child.try_wait()?.is_some() {
                log::debug!("Worker pid {} exited after SIGTERM", pid);
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        log::debug!("Force killing worker pid {} with SIGKILL", pid);
        match self.child.kill() {
            Ok(()) => {}
            // Exited between the last poll and the kill.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e),
        }
        self.child.wait()?;
        Ok(())
    }
}
