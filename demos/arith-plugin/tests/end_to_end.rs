//! Drives the `arith-plugin` binary through a real host

use std::time::Duration;

use plugwire_host::{
    CallError, CancellationToken, Host, HostError, HostState, LaunchConfig, StderrSink,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

const PLUGIN: &str = env!("CARGO_BIN_EXE_arith-plugin");

#[derive(Debug, Serialize)]
struct AddRequest {
    a: i64,
    b: i64,
}

#[derive(Debug, Deserialize, PartialEq)]
struct AddResponse {
    sum: i64,
}

#[derive(Debug, Serialize)]
struct MalformedRequest {
    a: String,
    b: i64,
}

fn launch(config: LaunchConfig) -> (Host, JoinHandle<Result<(), HostError>>) {
    let host = Host::new();
    let runner = host.clone();
    let run = tokio::spawn(async move {
        runner
            .run_plugin(PLUGIN, config, CancellationToken::new())
            .await
    });
    (host, run)
}

fn quiet() -> LaunchConfig {
    LaunchConfig::new().stderr(StderrSink::Null)
}

async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(30), future)
        .await
        .expect("timed out")
}

/// Read stderr lines until one contains `needle`, returning all lines seen
async fn read_until(lines: &mut tokio::io::Lines<BufReader<DuplexStream>>, needle: &str) -> Vec<String> {
    let mut seen = Vec::new();
    while let Some(line) = lines.next_line().await.unwrap() {
        let done = line.contains(needle);
        seen.push(line);
        if done {
            return seen;
        }
    }
    panic!("stderr ended before {:?}; saw {:?}", needle, seen);
}

#[tokio::test]
async fn test_add() {
    let (host, run) = launch(quiet());

    let resp: AddResponse = within(host.call("add", &AddRequest { a: 2, b: 3 }, &CancellationToken::new()))
        .await
        .unwrap();
    assert_eq!(resp, AddResponse { sum: 5 });

    within(host.close()).await.unwrap();
    within(run).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_error_paths() {
    let (host, _run) = launch(quiet());
    let cancel = CancellationToken::new();

    let err = within(host.call::<_, Value>("simulated_error", &json!(null), &cancel))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "simulated error");

    let err = within(host.call::<_, AddResponse>("does_not_exist", &AddRequest { a: 1, b: 1 }, &cancel))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "unknown method: does_not_exist");

    let malformed = MalformedRequest {
        a: "2".to_string(),
        b: 3,
    };
    let err = within(host.call::<_, AddResponse>("add", &malformed, &cancel))
        .await
        .unwrap_err();
    assert!(err.is_remote());

    let err = within(host.call::<_, AddResponse>("malformed_response", &AddRequest { a: 1, b: 1 }, &cancel))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::MalformedResponse(_)));
    assert!(
        err.to_string().starts_with("malformed response: invalid type: string"),
        "got {}",
        err
    );
    assert_eq!(host.outstanding(), 0);

    within(host.close()).await.unwrap();
}

#[tokio::test]
async fn test_cancel_is_logged_by_plugin() {
    let (stderr_writer, stderr_reader) = tokio::io::duplex(64 * 1024);
    let config = LaunchConfig::new()
        .env("RUST_LOG", "info")
        .stderr(StderrSink::writer(stderr_writer));
    let (host, _run) = launch(config);
    let mut lines = BufReader::new(stderr_reader).lines();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = within(host.call::<_, AddResponse>("slow_add", &AddRequest { a: 1, b: 1 }, &cancel))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Cancelled));

    let seen = within(read_until(&mut lines, "request canceled")).await;
    assert!(
        seen.iter().any(|line| line.contains("request received")),
        "saw {:?}",
        seen
    );

    within(host.close()).await.unwrap();

    // The sink reaches EOF once the plugin has exited.
    while within(lines.next_line()).await.unwrap().is_some() {}
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (host, run) = launch(quiet());

    let _: AddResponse = within(host.call("add", &AddRequest { a: 0, b: 0 }, &CancellationToken::new()))
        .await
        .unwrap();

    within(host.close()).await.unwrap();
    within(host.close()).await.unwrap();
    assert_eq!(host.state(), HostState::Closed);
    within(run).await.unwrap().unwrap();

    let err = host
        .call::<_, AddResponse>("add", &AddRequest { a: 1, b: 1 }, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Closed));
}

#[tokio::test]
async fn test_plugin_crash_closes_outstanding_calls() {
    let (host, run) = launch(quiet());

    let mut calls = Vec::new();
    for i in 0..3 {
        let host = host.clone();
        calls.push(tokio::spawn(async move {
            host.call::<_, AddResponse>("slow_add", &AddRequest { a: i, b: i }, &CancellationToken::new())
                .await
        }));
    }
    while host.outstanding() < 3 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let err = within(host.call::<_, Value>("crash", &3, &CancellationToken::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Closed));

    for call in calls {
        let result = within(call).await.unwrap();
        assert!(matches!(result, Err(CallError::Closed)), "got {:?}", result);
    }
    within(run).await.unwrap().unwrap();
    assert_eq!(host.outstanding(), 0);

    match within(host.close()).await {
        Err(HostError::PluginExit(status)) => assert_eq!(status.code(), Some(3)),
        other => panic!("Expected PluginExit, got {:?}", other),
    }
}
