//! Single-node lifecycle scenarios: bootstrap, restart-reload,
//! bootstrap atomicity, the shutdown latch, and the control socket
//! surface.

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use support::*;
use syndic_daemon::{Daemon, DaemonError, Location, RunOptions};
use tempfile::TempDir;

fn daemon_options(state_dir: &std::path::Path, hooks: Arc<RecordingHooks>) -> RunOptions {
    RunOptions {
        state_dir: Some(state_dir.to_path_buf()),
        hooks: Some(hooks),
        ..RunOptions::default()
    }
}

/// Scenario: empty state dir, listen port, bootstrap through
/// `start_api`. The config lands on disk, the trust store holds
/// exactly the local node, and the hooks fire in bootstrap order
/// before the ready latch closes.
#[tokio::test]
async fn single_node_bootstrap() {
    let tmp = TempDir::new().expect("tempdir");
    let net = TestNet::new();
    let engine = TestEngine::new(Arc::clone(&net));
    let hooks = RecordingHooks::new();

    let daemon = Arc::new(Daemon::new("testproj", engine.clone()));
    let running = RunningDaemon::spawn(
        Arc::clone(&daemon),
        daemon_options(tmp.path(), hooks.clone()),
    )
    .await;

    let port = free_port();
    let address: syndic_common::AddrPort = format!("0.0.0.0:{port}").parse().expect("addr");
    daemon
        .start_api(
            true,
            Default::default(),
            Some(Location { name: "alpha".into(), address: address.clone() }),
            Vec::new(),
        )
        .await
        .expect("bootstrap");

    tokio::time::timeout(WAIT, daemon.ready())
        .await
        .expect("ready latch");

    // Persisted config.
    let config = std::fs::read_to_string(tmp.path().join("daemon.yaml")).expect("daemon.yaml");
    let persisted: Location = serde_yaml::from_str(&config).expect("parse daemon.yaml");
    assert_eq!(persisted.name, "alpha");
    assert_eq!(persisted.address, address);

    // Trust store: exactly the local node.
    let state = daemon.state().expect("state");
    let remotes = state.remotes();
    assert_eq!(remotes.len(), 1);
    assert_eq!(remotes.get("alpha").expect("alpha").address(), &address);

    // Hook order, with the engine's heartbeat tick filtered out.
    assert_eq!(
        hooks.lifecycle_events(),
        ["pre-bootstrap", "post-bootstrap", "on-start"]
    );
    assert!(hooks.events().contains(&"on-heartbeat".to_string()));

    assert_eq!(engine.bootstraps.load(Ordering::SeqCst), 1);
    assert_eq!(net.member_count(), 1);

    running.shut_down().await.expect("clean shutdown");
    assert_eq!(engine.stops.load(Ordering::SeqCst), 1);
}

/// Invariant: a state directory with a valid `daemon.yaml` and
/// database marker converges to Ready on restart without bootstrap or
/// join hooks; `on_start` fires exactly once.
#[tokio::test]
async fn restart_reloads_without_bootstrap_hooks() {
    let tmp = TempDir::new().expect("tempdir");
    let net = TestNet::new();

    // First life: bootstrap.
    {
        let engine = TestEngine::new(Arc::clone(&net));
        let hooks = RecordingHooks::new();
        let daemon = Arc::new(Daemon::new("testproj", engine));
        let running = RunningDaemon::spawn(
            Arc::clone(&daemon),
            daemon_options(tmp.path(), hooks),
        )
        .await;

        daemon
            .start_api(
                true,
                Default::default(),
                Some(Location {
                    name: "alpha".into(),
                    address: loopback(free_port()),
                }),
                Vec::new(),
            )
            .await
            .expect("bootstrap");
        running.shut_down().await.expect("clean shutdown");
    }

    // Second life: reload.
    let engine = TestEngine::new(Arc::clone(&net));
    let hooks = RecordingHooks::new();
    let daemon = Arc::new(Daemon::new("testproj", engine.clone()));
    let running = RunningDaemon::spawn(
        Arc::clone(&daemon),
        daemon_options(tmp.path(), hooks.clone()),
    )
    .await;

    tokio::time::timeout(WAIT, daemon.ready())
        .await
        .expect("ready after reload");

    assert_eq!(hooks.lifecycle_events(), ["on-start"]);
    assert_eq!(engine.reloads.load(Ordering::SeqCst), 1);
    assert_eq!(engine.bootstraps.load(Ordering::SeqCst), 0);
    assert_eq!(daemon.name(), "alpha");
    assert!(daemon.address().is_some());

    // The one successful configuration is final for this process.
    let err = daemon
        .start_api(true, Default::default(), None, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::AlreadyInitialized));

    running.shut_down().await.expect("clean shutdown");
}

/// Invariant: when bootstrap fails at the database, the trust store
/// holds no self-entry afterwards and the next process start comes up
/// unconfigured.
#[tokio::test]
async fn failed_bootstrap_leaves_no_self_entry() {
    let tmp = TempDir::new().expect("tempdir");
    let net = TestNet::new();

    {
        let engine = TestEngine::new(Arc::clone(&net));
        engine.fail_bootstrap.store(true, Ordering::SeqCst);
        let daemon = Arc::new(Daemon::new("testproj", engine));
        let running = RunningDaemon::spawn(
            Arc::clone(&daemon),
            daemon_options(tmp.path(), RecordingHooks::new()),
        )
        .await;

        let err = daemon
            .start_api(
                true,
                Default::default(),
                Some(Location {
                    name: "alpha".into(),
                    address: loopback(free_port()),
                }),
                Vec::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quorum could not be established"));

        assert!(!tmp.path().join("truststore").join("alpha.crt").exists());
        assert!(!tmp.path().join("truststore").join("alpha.yaml").exists());
        running.shut_down().await.expect("shutdown");
    }

    // Next process start: no database marker, so no reload; the store
    // stays empty.
    let engine = TestEngine::new(net);
    let daemon = Arc::new(Daemon::new("testproj", engine));
    let running = RunningDaemon::spawn(
        Arc::clone(&daemon),
        daemon_options(tmp.path(), RecordingHooks::new()),
    )
    .await;

    let state = daemon.state().expect("state");
    assert!(state.remotes().is_empty());
    assert!(!state.is_ready());

    running.shut_down().await.expect("shutdown");
}

/// Scenario: concurrent `stop` callers all observe the same result
/// and the engine's stop runs exactly once.
#[tokio::test]
async fn concurrent_stop_settles_once() {
    let tmp = TempDir::new().expect("tempdir");
    let net = TestNet::new();
    let engine = TestEngine::new(net);
    let daemon = Arc::new(Daemon::new("testproj", engine.clone()));
    let running = RunningDaemon::spawn(
        Arc::clone(&daemon),
        daemon_options(tmp.path(), RecordingHooks::new()),
    )
    .await;

    daemon
        .start_api(
            true,
            Default::default(),
            Some(Location { name: "alpha".into(), address: loopback(free_port()) }),
            Vec::new(),
        )
        .await
        .expect("bootstrap");
    tokio::time::timeout(WAIT, daemon.ready()).await.expect("ready");

    let (a, b) = tokio::join!(
        {
            let daemon = Arc::clone(&daemon);
            async move { daemon.stop().await }
        },
        {
            let daemon = Arc::clone(&daemon);
            async move { daemon.stop().await }
        },
    );

    assert!(a.is_ok());
    assert!(b.is_ok());
    assert_eq!(engine.stops.load(Ordering::SeqCst), 1);

    running.shut_down().await.expect("run returns");
    assert_eq!(engine.stops.load(Ordering::SeqCst), 1);
}

/// The control socket drives the whole lifecycle over plain HTTP:
/// bootstrap via `POST /1.0/control`, status and readiness, envelope
/// errors, raw percent-encoded paths, and graceful stop via
/// `DELETE /1.0/daemon`.
#[tokio::test]
async fn control_socket_surface() {
    let tmp = TempDir::new().expect("tempdir");
    let net = TestNet::new();
    let engine = TestEngine::new(net);
    let daemon = Arc::new(Daemon::new("testproj", engine));
    let running = RunningDaemon::spawn(
        Arc::clone(&daemon),
        daemon_options(tmp.path(), RecordingHooks::new()),
    )
    .await;
    let socket = running.control_socket();

    // Not ready before configuration.
    let (status, _) = unix_request(&socket, "GET", "/1.0/ready", None).await;
    assert_eq!(status, 503);

    // Root lists the API versions.
    let (status, body) = unix_request(&socket, "GET", "/", None).await;
    assert_eq!(status, 200);
    let envelope: serde_json::Value = serde_json::from_str(&body).expect("json");
    assert_eq!(envelope["type"], "sync");
    assert_eq!(envelope["metadata"], serde_json::json!(["/1.0"]));

    // Unknown paths return the JSON 404 envelope.
    let (status, body) = unix_request(&socket, "GET", "/nope", None).await;
    assert_eq!(status, 404);
    let envelope: serde_json::Value = serde_json::from_str(&body).expect("json");
    assert_eq!(envelope["type"], "error");
    assert_eq!(envelope["status"], 404);
    assert_eq!(envelope["error"], "Not Found");
    assert_eq!(envelope["metadata"], serde_json::Value::Null);

    // Bootstrap through the control API.
    let port = free_port();
    let control = format!(
        r#"{{"bootstrap": true, "name": "alpha", "address": "127.0.0.1:{port}"}}"#
    );
    let (status, _) = unix_request(&socket, "POST", "/1.0/control", Some(&control)).await;
    assert_eq!(status, 200);

    let (status, _) = unix_request(&socket, "GET", "/1.0/ready", None).await;
    assert_eq!(status, 200);

    let (status, body) = unix_request(&socket, "GET", "/1.0", None).await;
    assert_eq!(status, 200);
    let envelope: serde_json::Value = serde_json::from_str(&body).expect("json");
    assert_eq!(envelope["metadata"]["name"], "alpha");
    assert_eq!(envelope["metadata"]["ready"], true);

    // Percent-encoded path segments reach the handler verbatim and
    // are decoded exactly once: the (unknown) member name in the
    // error is "/slashed", not "%2Fslashed" and not "slashed".
    let (status, body) =
        unix_request(&socket, "DELETE", "/1.0/internal/cluster/%2Fslashed", None).await;
    assert_eq!(status, 500);
    assert!(body.contains("\\\"/slashed\\\"") || body.contains("\"/slashed\""), "body: {body}");
    assert!(!body.contains("%2F"));

    // Upgrade notifications need the version header.
    let (status, _) = unix_request(&socket, "PATCH", "/1.0/internal/database", None).await;
    assert_eq!(status, 400);

    // A second bootstrap attempt is rejected.
    let (status, body) = unix_request(&socket, "POST", "/1.0/control", Some(&control)).await;
    assert_eq!(status, 400);
    assert!(body.contains("already initialized"));

    // Graceful stop from within a request: the handler responds, then
    // run returns.
    let (status, _) = unix_request(&socket, "DELETE", "/1.0/daemon", None).await;
    assert_eq!(status, 200);
    running.join_run().await.expect("run returned cleanly");
}

/// Configuration errors surface before anything binds.
#[tokio::test]
async fn start_api_requires_configuration() {
    let tmp = TempDir::new().expect("tempdir");
    let daemon = Arc::new(Daemon::new("testproj", TestEngine::new(TestNet::new())));
    let running = RunningDaemon::spawn(
        Arc::clone(&daemon),
        daemon_options(tmp.path(), RecordingHooks::new()),
    )
    .await;

    // No persisted config and no new config: the network API cannot
    // start.
    let err = daemon
        .start_api(true, Default::default(), None, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::Unconfigured));

    running.shut_down().await.expect("shutdown");
}
