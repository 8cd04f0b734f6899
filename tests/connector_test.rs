// Connect-or-spawn behaviour of the client connector.
// Run with: cargo test --test connector_test

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use scriptserve::client::{LaunchTarget, ProcessLauncher, WorkerHandle, WorkerLauncher};
use scriptserve::socket::endpoint::is_process_alive;
use scriptserve::{
    ClientError, ConnectError, ConnectOptions, Connector, Endpoint, ExecutionSession, Listener, LuaEngine, Output,
};
use tokio_util::sync::CancellationToken;

/// Starts a listener task in this process, optionally after a delay.
#[derive(Debug, Clone, Default)]
struct InProcessLauncher {
    launches: Arc<AtomicUsize>,
    startup_delay: Duration,
    workers: Arc<std::sync::Mutex<Vec<CancellationToken>>>,
}

#[derive(Debug)]
struct InProcessHandle {
    shutdown: CancellationToken,
}

impl WorkerHandle for InProcessHandle {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.shutdown.cancel();
        Ok(())
    }
}

impl WorkerLauncher for InProcessLauncher {
    fn launch(&self, endpoint: &Endpoint) -> Result<Box<dyn WorkerHandle>, ConnectError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let shutdown = CancellationToken::new();
        self.workers.lock().unwrap().push(shutdown.clone());

        let endpoint = endpoint.clone();
        let delay = self.startup_delay;
        let token = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // A worker that loses a bind race exits, like the real one.
            let Ok(mut listener) = Listener::bind(endpoint) else {
                return;
            };
            let session = Arc::new(ExecutionSession::with_max_contexts(LuaEngine::new(), 2));
            let _ = listener.serve(session, token).await;
        });
        Ok(Box::new(InProcessHandle { shutdown }))
    }
}

impl InProcessLauncher {
    fn stop_all(&self) {
        for token in self.workers.lock().unwrap().iter() {
            token.cancel();
        }
    }
}

fn options() -> ConnectOptions {
    ConnectOptions {
        probe_timeout: Duration::from_millis(200),
        spawn_timeout: Duration::from_secs(3),
        ..ConnectOptions::default()
    }
}

async fn collect(connector: &Connector, script: &str) -> Vec<Result<Output, ClientError>> {
    let invocation = connector.invoke(script, CancellationToken::new()).await.unwrap();
    invocation.into_stream().collect().await
}

/// No listener: the connector spawns one worker and the request goes through.
#[tokio::test]
async fn test_spawns_worker_when_absent() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = InProcessLauncher {
        startup_delay: Duration::from_millis(100),
        ..InProcessLauncher::default()
    };
    let connector = Connector::new(Endpoint::at_path(dir.path().join("cold.sock")), launcher.clone())
        .with_options(options());

    let outputs = collect(&connector, "emit(1) emit('two')").await;
    let outputs: Vec<Output> = outputs.into_iter().map(Result::unwrap).collect();
    assert_eq!(outputs, vec![Output::Item("1".into()), Output::Item(r#""two""#.into())]);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);

    // Warm now: no second launch.
    let outputs = collect(&connector, "return 3").await;
    assert_eq!(outputs.len(), 1);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);

    launcher.stop_all();
}

/// Two cold clients at once both end up on a working listener.
#[tokio::test]
async fn test_concurrent_cold_start() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = Endpoint::at_path(dir.path().join("race.sock"));
    let launcher = InProcessLauncher {
        startup_delay: Duration::from_millis(50),
        ..InProcessLauncher::default()
    };
    let a = Connector::new(endpoint.clone(), launcher.clone()).with_options(options());
    let b = Connector::new(endpoint, launcher.clone()).with_options(options());

    let (out_a, out_b) = tokio::join!(collect(&a, "return 'a'"), collect(&b, "return 'b'"));
    assert_eq!(out_a.into_iter().map(Result::unwrap).collect::<Vec<_>>(), vec![Output::Item(r#""a""#.into())]);
    assert_eq!(out_b.into_iter().map(Result::unwrap).collect::<Vec<_>>(), vec![Output::Item(r#""b""#.into())]);

    let launches = launcher.launches.load(Ordering::SeqCst);
    assert!((1..=2).contains(&launches), "launches: {launches}");

    launcher.stop_all();
}

/// A worker that never listens is killed and reported as a timeout.
#[tokio::test]
async fn test_unresponsive_worker_is_terminated() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = ProcessLauncher::new(LaunchTarget::command("sh", &["-c", "exec sleep 30"]));
    let connector = Connector::new(Endpoint::at_path(dir.path().join("dead.sock")), launcher).with_options(
        ConnectOptions {
            probe_timeout: Duration::from_millis(100),
            spawn_timeout: Duration::from_millis(300),
            ..ConnectOptions::default()
        },
    );

    let err = connector.connect(&CancellationToken::new()).await.unwrap_err();
    let ConnectError::Timeout { worker_pid, .. } = err else {
        panic!("expected timeout, got {err:?}");
    };
    let pid = worker_pid.expect("child pid");
    assert!(!is_process_alive(pid), "worker {pid} still running");
}

/// Cancelling while waiting for a spawned worker gives up promptly.
#[tokio::test]
async fn test_cancel_during_spawn_wait() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = InProcessLauncher {
        startup_delay: Duration::from_secs(60),
        ..InProcessLauncher::default()
    };
    let connector = Connector::new(Endpoint::at_path(dir.path().join("slow.sock")), launcher.clone())
        .with_options(options());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let err = connector.invoke("return 1", cancel).await.unwrap_err();
    assert!(matches!(err, ClientError::Connect(ConnectError::Cancelled)), "got: {err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));

    launcher.stop_all();
}

/// Cancelling an invocation ends its stream with a confirmed cancel.
#[tokio::test]
async fn test_invocation_cancel_is_confirmed() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = InProcessLauncher::default();
    let connector = Connector::new(Endpoint::at_path(dir.path().join("cancel.sock")), launcher.clone())
        .with_options(options());

    let cancel = CancellationToken::new();
    let mut invocation = connector
        .invoke("local i = 0 while true do i = i + 1 emit(i) sleep(5) end", cancel.clone())
        .await
        .unwrap();

    assert!(matches!(invocation.next().await, Some(Ok(Output::Item(_)))));
    cancel.cancel();

    let mut last = None;
    while let Some(next) = invocation.next().await {
        last = Some(next);
    }
    assert!(matches!(last, Some(Err(ClientError::CancelledByUser))), "got: {last:?}");
    assert!(invocation.cancel_sent());

    launcher.stop_all();
}
