//! Arithmetic demo plugin.
//!
//! Besides `add` it exposes methods that misbehave on purpose, so hosts can
//! exercise their error paths against a real child process.

use std::time::Duration;

use plugwire_sdk::prelude::*;
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Deserialize)]
struct AddRequest {
    a: i64,
    b: i64,
}

#[derive(Debug, Serialize)]
struct AddResponse {
    sum: i64,
}

/// How long `slow_add` works before answering
const SLOW_ADD_DELAY: Duration = Duration::from_secs(30);

fn build_plugin() -> Plugin {
    let mut plugin = Plugin::new();
    plugin
        .handle("add", |_ctx, req: AddRequest| async move {
            Ok::<_, String>(AddResponse { sum: req.a + req.b })
        })
        .handle("slow_add", |ctx: RequestContext, req: AddRequest| async move {
            info!(id = ctx.id(), "request received");
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!(id = ctx.id(), "request canceled");
                    Err("request canceled".to_string())
                }
                _ = tokio::time::sleep(SLOW_ADD_DELAY) => Ok(AddResponse { sum: req.a + req.b }),
            }
        })
        .handle("simulated_error", |_ctx, _req: Value| async move {
            Err::<Value, _>("simulated error")
        })
        .handle("malformed_response", |_ctx, _req: Value| async move {
            Ok::<_, String>(json!({ "sum": "not a number" }))
        })
        .handle("crash", |_ctx, code: i32| async move {
            if code >= 0 {
                std::process::exit(code);
            }
            Err::<Value, _>(format!("invalid exit code {}", code))
        });
    plugin
}

plugin_main!(build_plugin());
