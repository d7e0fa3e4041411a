//! Plugin-side dispatch engine
//!
//! One task reads request and cancel envelopes from the input stream. Each
//! request is dispatched on its own task with a child [`CancellationToken`];
//! replies from all tasks share a single [`EnvelopeSink`].

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use plugwire_api::{
    CodecError, Envelope, EnvelopeKind, EnvelopeReader, EnvelopeSink, DUPLICATE_ID_PREFIX,
    UNKNOWN_METHOD_PREFIX,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::RequestContext;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send + 'static>>;

/// Type-erased handler: raw payload in, raw result or error message out
type Endpoint = Arc<dyn Fn(RequestContext, Value) -> HandlerFuture + Send + Sync>;

/// A set of named handlers and the loop that serves them.
///
/// ```rust,ignore
/// let mut plugin = Plugin::new();
/// plugin.handle("add", |_ctx, req: AddRequest| async move {
///     Ok::<_, String>(AddResponse { sum: req.a + req.b })
/// });
/// let code = plugin.run(CancellationToken::new()).await;
/// std::process::exit(code);
/// ```
#[derive(Default)]
pub struct Plugin {
    endpoints: HashMap<String, Endpoint>,
}

impl Plugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method`, replacing any earlier registration.
    ///
    /// The request payload is decoded into `Req` before the handler runs; a
    /// decode failure is returned to the host as the response error. `Ok`
    /// values are encoded as the response `data`, `Err` values become the
    /// response `err` through their `Display`.
    pub fn handle<Req, Resp, E, F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + 'static,
        E: Display + 'static,
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, E>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let endpoint: Endpoint = Arc::new(move |ctx: RequestContext, raw: Value| -> HandlerFuture {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let request: Req = serde_json::from_value(raw).map_err(|e| e.to_string())?;
                let response = handler(ctx, request).await.map_err(|e| e.to_string())?;
                serde_json::to_value(response).map_err(|e| format!("marshaling response: {}", e))
            })
        });

        self.endpoints.insert(method.into(), endpoint);
        self
    }

    /// Registered method names, sorted
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.endpoints.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Serve requests on this process's stdin/stdout.
    ///
    /// The return value is meant for [`std::process::exit`].
    pub async fn run(self, shutdown: CancellationToken) -> i32 {
        self.run_with_io(tokio::io::stdin(), tokio::io::stdout(), shutdown)
            .await
    }

    /// Serve requests from `reader`, writing replies to `writer`.
    ///
    /// Returns `0` when the input ends, when a line cannot be parsed, or when
    /// `shutdown` fires, and `1` when reading the input fails. Outstanding
    /// dispatches are cancelled and awaited before returning.
    ///
    /// # Panics
    ///
    /// On an envelope carrying neither `id` nor `cancel`, and when a reply
    /// cannot be written. Both leave the stream unusable.
    pub async fn run_with_io<R, W>(self, reader: R, writer: W, shutdown: CancellationToken) -> i32
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let root = shutdown.child_token();
        let dispatcher = Arc::new(Dispatcher {
            endpoints: self.endpoints,
            sink: EnvelopeSink::new(writer),
            inflight: Mutex::new(HashMap::new()),
            next_slot: AtomicU64::new(0),
        });
        let mut reader = EnvelopeReader::new(reader);
        let mut tasks = JoinSet::new();

        info!(methods = dispatcher.endpoints.len(), "Plugin serving");

        let code = loop {
            tokio::select! {
                _ = root.cancelled() => {
                    debug!("Shutdown requested");
                    break 0;
                }
                Some(joined) = tasks.join_next() => reraise(joined),
                next = reader.read_envelope() => match next {
                    Ok(Some(envelope)) => dispatcher.accept(envelope, &root, &mut tasks),
                    Ok(None) => {
                        debug!("Input closed");
                        break 0;
                    }
                    Err(CodecError::Io(e)) => {
                        warn!(error = %e, "Reading input failed");
                        break 1;
                    }
                    Err(e) => {
                        warn!(error = %e, "Malformed input");
                        break 0;
                    }
                },
            }
        };

        root.cancel();
        while let Some(joined) = tasks.join_next().await {
            reraise(joined);
        }
        info!(code, "Plugin stopped");
        code
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("methods", &self.methods())
            .finish()
    }
}

/// Cancellation control for one live request
struct Inflight {
    slot: u64,
    token: CancellationToken,
}

struct Dispatcher {
    endpoints: HashMap<String, Endpoint>,
    sink: EnvelopeSink,
    inflight: Mutex<HashMap<String, Inflight>>,
    next_slot: AtomicU64,
}

impl Dispatcher {
    fn inflight(&self) -> MutexGuard<'_, HashMap<String, Inflight>> {
        // The table holds plain tokens; a poisoned lock leaves it consistent.
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn accept(
        self: &Arc<Self>,
        envelope: Envelope,
        root: &CancellationToken,
        tasks: &mut JoinSet<()>,
    ) {
        let id = match (envelope.kind(), envelope.id.clone()) {
            (EnvelopeKind::Cancel, _) => {
                if let Some(target) = envelope.cancel.as_deref() {
                    self.cancel(target);
                }
                return;
            }
            (EnvelopeKind::Invalid, _) | (_, None) => {
                panic!("protocol violation: envelope has neither \"id\" nor \"cancel\"")
            }
            (_, Some(id)) => id,
        };

        let token = root.child_token();
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        let duplicate = {
            let mut inflight = self.inflight();
            if inflight.contains_key(&id) {
                true
            } else {
                inflight.insert(
                    id.clone(),
                    Inflight {
                        slot,
                        token: token.clone(),
                    },
                );
                false
            }
        };

        let dispatcher = Arc::clone(self);
        if duplicate {
            warn!(%id, "Duplicate request id");
            tasks.spawn(async move {
                let reply = Envelope::response_err(&id, format!("{}{}", DUPLICATE_ID_PREFIX, id));
                dispatcher.reply(&id, reply).await;
            });
            return;
        }

        let method = envelope.method.unwrap_or_default();
        tasks.spawn(dispatcher.dispatch(id, slot, method, envelope.data, token));
    }

    fn cancel(&self, id: &str) {
        match self.inflight().remove(id) {
            Some(entry) => {
                debug!(%id, "Request cancelled by host");
                entry.token.cancel();
            }
            None => debug!(%id, "Cancel for unknown id"),
        }
    }

    async fn dispatch(
        self: Arc<Self>,
        id: String,
        slot: u64,
        method: String,
        data: Option<Value>,
        token: CancellationToken,
    ) {
        let reply = match self.endpoints.get(&method) {
            None => {
                debug!(%id, %method, "Unknown method");
                Envelope::response_err(&id, format!("{}{}", UNKNOWN_METHOD_PREFIX, method))
            }
            Some(endpoint) => {
                debug!(%id, %method, "Dispatching");
                let ctx = RequestContext::new(id.clone(), method, token.clone());
                match endpoint(ctx, data.unwrap_or(Value::Null)).await {
                    Ok(value) => Envelope::response_ok(&id, value),
                    Err(message) if message.is_empty() => {
                        Envelope::response_err(&id, "handler failed without a message")
                    }
                    Err(message) => Envelope::response_err(&id, message),
                }
            }
        };

        {
            let mut inflight = self.inflight();
            // A cancel may have removed our entry already; never drop a newer one.
            if inflight.get(&id).is_some_and(|entry| entry.slot == slot) {
                inflight.remove(&id);
            }
        }
        token.cancel();

        self.reply(&id, reply).await;
    }

    async fn reply(&self, id: &str, reply: Envelope) {
        if let Err(e) = self.sink.send(&reply).await {
            panic!("writing response for request {}: {}", id, e);
        }
    }
}

fn reraise(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            std::panic::resume_unwind(e.into_panic());
        }
    }
}
