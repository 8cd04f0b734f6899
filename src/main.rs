//! scriptserve CLI - run scripts on a warm worker over a local socket.
//!
//! This is the main binary entry point. See the `scriptserve` library
//! for the core functionality.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mimalloc::MiMalloc;
use scriptserve::client::launcher::LOG_FILE_ENV;
use scriptserve::client::{LaunchTarget, ProcessLauncher};
use scriptserve::{ClientError, Config, ConnectError, Connector, Endpoint, ExecutionSession, Listener, LuaEngine, Output};
use tokio_util::sync::CancellationToken;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Conventional exit status for a run ended by SIGINT.
const EXIT_CANCELLED: u8 = 130;

// CLI
#[derive(Parser)]
#[command(name = "scriptserve")]
#[command(version)]
#[command(about = "Run scripts on a warm worker process over a local socket")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Which worker to talk to.
#[derive(Args, Debug, Clone)]
struct EndpointArgs {
    /// Endpoint name (default: scriptserve-<user>)
    #[arg(short = 'p', long = "pipe-name", conflicts_with = "socket")]
    pipe_name: Option<String>,
    /// Explicit socket path, overriding the name
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a worker in the foreground until signalled
    Serve {
        #[command(flatten)]
        endpoint: EndpointArgs,
        /// Execution-context pool size (default: two per CPU)
        #[arg(long)]
        max_contexts: Option<usize>,
    },
    /// Run a script on the worker, spawning it if needed
    Invoke {
        /// Script text, or `-` to read it from stdin
        script: String,
        #[command(flatten)]
        endpoint: EndpointArgs,
        /// Serialization depth for result items
        #[arg(short, long)]
        depth: Option<usize>,
        /// Log connection details to stderr
        #[arg(short, long)]
        verbose: bool,
        /// Directory holding the worker binary
        #[arg(long)]
        exe_dir: Option<PathBuf>,
        /// Working directory for a spawned worker
        #[arg(long)]
        working_directory: Option<PathBuf>,
    },
    /// Report whether a worker is listening
    Status {
        #[command(flatten)]
        endpoint: EndpointArgs,
    },
    /// Ask the recorded worker to shut down
    Stop {
        #[command(flatten)]
        endpoint: EndpointArgs,
    },
    /// Print the effective configuration
    Config,
}

fn resolve_endpoint(args: &EndpointArgs, config: &Config) -> Result<Endpoint> {
    if let Some(path) = &args.socket {
        return Ok(Endpoint::at_path(path));
    }
    match &args.pipe_name {
        Some(name) => Endpoint::named(name),
        None => config.endpoint(),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

/// Worker logging: the file named by `SCRIPTSERVE_LOG_FILE` (set by the
/// spawning client), otherwise stderr.
fn init_worker_logging() {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_millis();
    if let Some(path) = std::env::var_os(LOG_FILE_ENV) {
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {}: {}", PathBuf::from(path).display(), e),
        }
    }
    builder.init();
}

fn init_client_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .target(env_logger::Target::Stderr)
        .format_timestamp_millis()
        .init();
}

fn run_serve(endpoint: Endpoint, max_contexts: usize) -> Result<()> {
    endpoint.ensure_dir()?;
    init_worker_logging();
    log::info!("scriptserve worker v{} starting (pid {})", env!("CARGO_PKG_VERSION"), std::process::id());

    proctitle::set_title(format!("scriptserve worker {}", endpoint.name()));

    runtime()?.block_on(serve_endpoint(endpoint, max_contexts))
}

async fn serve_endpoint(endpoint: Endpoint, max_contexts: usize) -> Result<()> {
    let mut listener = Listener::bind(endpoint.clone())?;
    endpoint.write_pid()?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_termination(shutdown.clone()));

    let session = Arc::new(ExecutionSession::with_max_contexts(LuaEngine::new(), max_contexts));
    log::info!("Context pool capacity {}", session.max_contexts());
    let served = listener.serve(session, shutdown).await;

    endpoint.remove_pid();
    log::info!("Worker shut down after {} sessions", listener.sessions_started());
    served
}

/// Fire `shutdown` on SIGINT, SIGTERM or SIGHUP.
async fn wait_for_termination(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let kinds = [SignalKind::interrupt(), SignalKind::terminate(), SignalKind::hangup()];
    let mut streams = Vec::with_capacity(kinds.len());
    for kind in kinds {
        match signal(kind) {
            Ok(stream) => streams.push(stream),
            Err(e) => log::warn!("Cannot watch signal {:?}: {}", kind, e),
        }
    }
    if streams.is_empty() {
        return;
    }

    let waits = streams.iter_mut().map(|s| Box::pin(s.recv()));
    let _ = futures_util::future::select_all(waits).await;
    log::info!("Termination signal received, shutting down");
    shutdown.cancel();
}

fn read_script(script: String) -> Result<String> {
    if script != "-" {
        return Ok(script);
    }
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .context("Failed to read script from stdin")?;
    Ok(text)
}

fn run_invoke(connector: Connector, script: String) -> Result<ExitCode> {
    runtime()?.block_on(invoke_script(connector, script))
}

async fn invoke_script(connector: Connector, script: String) -> Result<ExitCode> {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            log::debug!("Interrupted, cancelling script");
            cancel.cancel();
            // A second Ctrl-C gives up on waiting for the worker.
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(i32::from(EXIT_CANCELLED));
            }
        }
    });

    let mut invocation = match connector.invoke(&script, cancel).await {
        Ok(invocation) => invocation,
        Err(ClientError::Connect(ConnectError::Cancelled)) => return Ok(ExitCode::from(EXIT_CANCELLED)),
        Err(e) => {
            eprintln!("Error: {e}");
            return Ok(ExitCode::FAILURE);
        }
    };

    let stdout = std::io::stdout();
    while let Some(next) = invocation.next().await {
        match next {
            Ok(Output::Item(text)) => {
                let mut out = stdout.lock();
                writeln!(out, "{text}")?;
                out.flush()?;
            }
            Ok(Output::Error(text)) => eprintln!("{text}"),
            Err(ClientError::CancelledByUser) => {
                eprintln!("Cancelled");
                return Ok(ExitCode::from(EXIT_CANCELLED));
            }
            Err(e) => {
                eprintln!("Error: {e}");
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_status(endpoint: &Endpoint) -> ExitCode {
    let listening = std::os::unix::net::UnixStream::connect(endpoint.path()).is_ok();
    let pid = endpoint.running_pid();
    match (listening, pid) {
        (true, Some(pid)) => println!("{}: running (pid {})", endpoint, pid),
        (true, None) => println!("{}: running (pid unknown)", endpoint),
        (false, Some(pid)) => println!("{}: not listening (pid {} alive)", endpoint, pid),
        (false, None) => println!("{}: not running", endpoint),
    }
    if listening {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn run_stop(endpoint: &Endpoint) -> Result<ExitCode> {
    let Some(pid) = endpoint.running_pid() else {
        println!("{}: not running", endpoint);
        return Ok(ExitCode::SUCCESS);
    };
    let raw = libc::pid_t::try_from(pid).context("PID out of range")?;
    // SAFETY: plain signal delivery to a recorded pid.
    if unsafe { libc::kill(raw, libc::SIGTERM) } != 0 {
        anyhow::bail!("Failed to signal pid {}: {}", pid, std::io::Error::last_os_error());
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        // The worker clears its pid file on the way out; an unreaped
        // process can outlive that.
        if !scriptserve::socket::endpoint::is_process_alive(pid) || endpoint.read_pid() != Some(pid) {
            println!("{}: stopped (pid {})", endpoint, pid);
            return Ok(ExitCode::SUCCESS);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    eprintln!("{}: pid {} still running after SIGTERM", endpoint, pid);
    Ok(ExitCode::FAILURE)
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Serve { endpoint, max_contexts } => {
            let endpoint = resolve_endpoint(&endpoint, &config)?;
            let max_contexts = max_contexts
                .filter(|&n| n > 0)
                .unwrap_or_else(|| config.effective_max_contexts());

            // Set up panic hook so worker panics land in the log file
            let default_hook = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |panic_info| {
                log::error!("PANIC: {}", panic_info);
                default_hook(panic_info);
            }));

            run_serve(endpoint, max_contexts)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Invoke {
            script,
            endpoint,
            depth,
            verbose,
            exe_dir,
            working_directory,
        } => {
            init_client_logging(verbose);
            let endpoint = resolve_endpoint(&endpoint, &config)?;
            let mut options = config.connect_options();
            if let Some(depth) = depth {
                options.depth = depth;
            }
            let target = LaunchTarget::resolve(
                exe_dir.as_deref().or(config.exe_dir.as_deref()),
                working_directory.as_deref().or(config.working_directory.as_deref()),
            );
            log::debug!("Worker binary: {}", target.program.display());
            let connector = Connector::new(endpoint, ProcessLauncher::new(target)).with_options(options);
            run_invoke(connector, read_script(script)?)
        }
        Commands::Status { endpoint } => Ok(run_status(&resolve_endpoint(&endpoint, &config)?)),
        Commands::Stop { endpoint } => run_stop(&resolve_endpoint(&endpoint, &config)?),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
