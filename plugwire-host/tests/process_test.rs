//! Host against real child processes built from shell scripts

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use plugwire_host::{
    launch, CallError, CancellationToken, Host, HostError, HostState, LaunchConfig, LaunchError,
    StderrSink,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

/// Answers every request with `{"sum":5}`, echoing its id.
const ECHO_SCRIPT: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([0-9a-f]*\)".*/\1/p')
  printf '{"id":"%s","data":{"sum":5}}\n' "$id"
done
"#;

/// Reads one request, complains on stderr and dies.
const CRASH_SCRIPT: &str = r#"#!/bin/sh
read -r line
echo "plugin giving up" >&2
exit 3
"#;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("timed out")
}

#[tokio::test]
async fn test_call_script_plugin() {
    let temp = TempDir::new().unwrap();
    let script = write_script(temp.path(), "echo.sh", ECHO_SCRIPT);

    let host = Host::new();
    let runner = host.clone();
    let run = tokio::spawn(async move {
        runner
            .run_plugin(script, LaunchConfig::new().stderr(StderrSink::Null), CancellationToken::new())
            .await
    });

    let resp: Value = within(host.call("add", &json!({ "a": 2, "b": 3 }), &CancellationToken::new()))
        .await
        .unwrap();
    assert_eq!(resp, json!({ "sum": 5 }));

    within(host.close()).await.unwrap();
    within(run).await.unwrap().unwrap();
    assert_eq!(host.state(), HostState::Closed);
}

#[tokio::test]
async fn test_child_exit_mid_call() {
    let temp = TempDir::new().unwrap();
    let script = write_script(temp.path(), "crash.sh", CRASH_SCRIPT);
    let (stderr_writer, mut stderr_reader) = tokio::io::duplex(1024);

    let host = Host::new();
    let runner = host.clone();
    let config = LaunchConfig::new().stderr(StderrSink::writer(stderr_writer));
    let run = tokio::spawn(async move {
        runner
            .run_plugin(script, config, CancellationToken::new())
            .await
    });

    let err = within(host.call::<_, Value>("add", &json!({ "a": 2, "b": 3 }), &CancellationToken::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Closed));
    assert!(err.is_closed());

    within(run).await.unwrap().unwrap();
    assert_eq!(host.state(), HostState::Terminated);

    match within(host.close()).await {
        Err(HostError::PluginExit(status)) => assert_eq!(status.code(), Some(3)),
        other => panic!("Expected PluginExit, got {:?}", other),
    }

    // The sink is shut down once the child's stderr ends.
    let mut stderr = String::new();
    within(stderr_reader.read_to_string(&mut stderr)).await.unwrap();
    assert_eq!(stderr, "plugin giving up\n");
}

#[tokio::test]
async fn test_run_plugin_rejects_invalid_reference() {
    let temp = TempDir::new().unwrap();
    let missing = temp.path().join("no-such-plugin");

    let host = Host::new();
    let result = host
        .run_plugin(&missing, LaunchConfig::default(), CancellationToken::new())
        .await;
    match result {
        Err(HostError::Launch(LaunchError::InvalidReference(path))) => assert_eq!(path, missing),
        other => panic!("Expected InvalidReference, got {:?}", other),
    }
    assert_eq!(host.state(), HostState::Unstarted);
}

#[tokio::test]
async fn test_shutdown_token_stops_reader() {
    let temp = TempDir::new().unwrap();
    let script = write_script(temp.path(), "echo.sh", ECHO_SCRIPT);
    let shutdown = CancellationToken::new();

    let host = Host::new();
    let runner = host.clone();
    let token = shutdown.clone();
    let run = tokio::spawn(async move {
        runner
            .run_plugin(script, LaunchConfig::new().stderr(StderrSink::Null), token)
            .await
    });

    let _: Value = within(host.call("add", &json!({}), &CancellationToken::new()))
        .await
        .unwrap();

    shutdown.cancel();
    within(run).await.unwrap().unwrap();
    assert_eq!(host.state(), HostState::Terminated);

    // Closing stdin still lets the script exit cleanly.
    within(host.close()).await.unwrap();
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_start_after_close_reaps_child() {
    let temp = TempDir::new().unwrap();
    let script = write_script(temp.path(), "echo.sh", ECHO_SCRIPT);

    let host = Host::new();
    host.close().await.unwrap();

    let process = launch(&script, LaunchConfig::new().stderr(StderrSink::Null)).unwrap();
    let pid = process.pid().unwrap();
    assert!(Path::new(&format!("/proc/{}", pid)).exists());

    let result = within(host.start(process, CancellationToken::new())).await;
    assert!(matches!(result, Err(HostError::Closed)), "got {:?}", result);

    // Killed and waited, so not even a zombie entry remains.
    assert!(!Path::new(&format!("/proc/{}", pid)).exists());
    assert_eq!(host.state(), HostState::Closed);
}
