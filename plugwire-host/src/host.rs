//! Host engine: correlates calls with responses over one pipe pair.
//!
//! A single background reader (the future returned by [`Host::start`])
//! owns the plugin's stdout and routes every response to the oneshot slot
//! registered by the matching [`Host::call`]. Calls write their requests
//! through a shared [`EnvelopeSink`], so any number of them may be in flight.
//!
//! ```text
//!  Host::call ──┐                       ┌──────────────┐
//!  Host::call ──┼── EnvelopeSink ─stdin─▶│              │
//!  Host::call ──┘                       │    plugin    │
//!     ▲  ▲  ▲                           │              │
//!     └──┴──┴── pending[id] ◀─ reader ◀─stdout─────────┘
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use plugwire_api::{Envelope, EnvelopeKind, EnvelopeReader, EnvelopeSink};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStderr};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{LaunchConfig, StderrSink};
use crate::error::{CallError, HostError};
use crate::launcher::{self, PluginProcess};

/// Lifecycle of a [`Host`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// Created, waiting for [`Host::start`]
    Unstarted,
    /// Reader loop running; calls are accepted
    Running,
    /// The inbound stream ended; calls fail with [`CallError::Closed`]
    Terminated,
    /// [`Host::close`] was called
    Closed,
}

/// Outstanding calls, keyed by request id.
///
/// `open` is cleared when the reader loop exits; no slot can be registered
/// afterwards, so no caller can wait on a stream that is already gone.
struct PendingCalls {
    open: bool,
    calls: HashMap<String, oneshot::Sender<Envelope>>,
}

struct HostInner {
    next_id: AtomicU64,
    state: watch::Sender<HostState>,
    pending: Mutex<PendingCalls>,
    sink: OnceLock<EnvelopeSink>,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl HostInner {
    fn pending(&self) -> MutexGuard<'_, PendingCalls> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> String {
        format!("{:x}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Refuse new calls and wake every waiting caller with `Closed`.
    fn close_pending(&self) {
        let dropped = {
            let mut pending = self.pending();
            pending.open = false;
            std::mem::take(&mut pending.calls)
        };
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "Releasing outstanding calls");
        }
    }
}

/// Handle to a plugin connection.
///
/// Cloning is cheap; all clones share the same connection.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    /// Create an unstarted host
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HostInner {
                next_id: AtomicU64::new(0),
                state: watch::Sender::new(HostState::Unstarted),
                pending: Mutex::new(PendingCalls {
                    open: true,
                    calls: HashMap::new(),
                }),
                sink: OnceLock::new(),
                child: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> HostState {
        *self.inner.state.borrow()
    }

    /// Number of calls currently waiting for a response
    pub fn outstanding(&self) -> usize {
        self.inner.pending().calls.len()
    }

    /// Launch the plugin at `reference` and run the connection.
    ///
    /// Resolves once the plugin's output ends or `shutdown` is cancelled; run
    /// it on its own task and use [`call`](Self::call) from others.
    pub async fn run_plugin(
        &self,
        reference: impl AsRef<Path>,
        config: LaunchConfig,
        shutdown: CancellationToken,
    ) -> Result<(), HostError> {
        if self.state() != HostState::Unstarted {
            return Err(HostError::AlreadyStarted);
        }
        let process = launcher::launch(reference, config)?;
        self.start(process, shutdown).await
    }

    /// Run the connection over a launched plugin process.
    ///
    /// The process is kept so [`close`](Self::close) can wait for its exit.
    /// On a host that is already closed the process is killed and
    /// [`HostError::Closed`] is returned.
    pub async fn start(
        &self,
        process: PluginProcess,
        shutdown: CancellationToken,
    ) -> Result<(), HostError> {
        let parts = process.into_parts();

        if let (Some(stderr), StderrSink::Writer(sink)) = (parts.stderr, parts.stderr_sink) {
            tokio::spawn(forward_stderr(stderr, sink));
        }

        self.run(parts.stdout, parts.stdin, Some(parts.child), shutdown)
            .await
    }

    /// Run the connection over an arbitrary stream pair.
    ///
    /// `reader` carries responses from the plugin, `writer` carries requests
    /// to it. Returns `Ok(())` when the reader reaches end of stream or
    /// `shutdown` is cancelled, and the decode error when a line cannot be
    /// parsed. Either way every outstanding call fails with
    /// [`CallError::Closed`].
    pub async fn start_with_io<R, W>(
        &self,
        reader: R,
        writer: W,
        shutdown: CancellationToken,
    ) -> Result<(), HostError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.run(reader, writer, None, shutdown).await
    }

    async fn run<R, W>(
        &self,
        reader: R,
        writer: W,
        child: Option<Child>,
        shutdown: CancellationToken,
    ) -> Result<(), HostError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        if self.inner.sink.set(EnvelopeSink::new(writer)).is_err() {
            return Err(HostError::AlreadyStarted);
        }

        // Held across the transition so `close` sees either no child or ours.
        let mut child_slot = self.inner.child.lock().await;
        let started = self.inner.state.send_if_modified(|state| {
            if *state == HostState::Unstarted {
                *state = HostState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            drop(child_slot);
            // Closed before it ever ran; nobody else will reap this child.
            if let Some(sink) = self.inner.sink.get() {
                let _ = sink.close().await;
            }
            if let Some(mut child) = child {
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "Killing unused plugin process failed");
                }
            }
            return Err(HostError::Closed);
        }
        *child_slot = child;
        drop(child_slot);
        info!("Plugin connection running");

        let result = self.demux(EnvelopeReader::new(reader), &shutdown).await;

        self.inner.state.send_if_modified(|state| {
            if *state == HostState::Running {
                *state = HostState::Terminated;
                true
            } else {
                false
            }
        });
        self.inner.close_pending();
        result
    }

    async fn demux<R>(
        &self,
        mut reader: EnvelopeReader<R>,
        shutdown: &CancellationToken,
    ) -> Result<(), HostError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Reader loop cancelled");
                    return Ok(());
                }
                next = reader.read_envelope() => next,
            };

            match next {
                Ok(Some(envelope)) => self.deliver(envelope),
                Ok(None) => {
                    debug!("Plugin closed its output");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "Failed to decode envelope from plugin");
                    return Err(HostError::Transport(e));
                }
            }
        }
    }

    fn deliver(&self, envelope: Envelope) {
        let kind = envelope.kind();
        if kind != EnvelopeKind::Response {
            debug!(?kind, "Ignoring non-response envelope");
            return;
        }
        let Some(id) = envelope.id.clone() else {
            return;
        };

        let slot = self.inner.pending().calls.remove(&id);
        match slot {
            Some(tx) => {
                if tx.send(envelope).is_err() {
                    debug!(%id, "Caller stopped waiting before the response arrived");
                }
            }
            None => debug!(%id, "Dropping response for unknown id"),
        }
    }

    /// Call `method` on the plugin and wait for its typed result.
    ///
    /// Waits for [`start`](Self::start) if the host has not started yet.
    /// When `cancel` fires first, the call is forgotten, a cancellation is
    /// sent to the plugin, and [`CallError::Cancelled`] is returned. Dropping
    /// the returned future behaves the same way.
    pub async fn call<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        cancel: &CancellationToken,
    ) -> Result<Resp, CallError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.wait_started().await;
        if self.state() != HostState::Running {
            return Err(CallError::Closed);
        }
        let sink = self.inner.sink.get().cloned().ok_or(CallError::Closed)?;
        let data = serde_json::to_value(request).map_err(CallError::Marshal)?;

        let id = self.inner.next_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending();
            if !pending.open {
                return Err(CallError::Closed);
            }
            pending.calls.insert(id.clone(), tx);
        }
        let mut outstanding = OutstandingCall {
            inner: &self.inner,
            id,
            sink,
            armed: true,
        };

        debug!(id = %outstanding.id, method, "Sending request");
        let request = Envelope::request(outstanding.id.as_str(), method, data);
        if let Err(e) = outstanding.sink.send(&request).await {
            outstanding.armed = false;
            return Err(CallError::Transport(e));
        }

        let reply = tokio::select! {
            biased;
            reply = rx => reply,
            _ = cancel.cancelled() => {
                outstanding.cancel().await;
                return Err(CallError::Cancelled);
            }
        };
        outstanding.armed = false;

        match reply {
            Ok(envelope) => decode_reply(envelope),
            Err(_) => Err(CallError::Closed),
        }
    }

    /// Close the connection and wait for the plugin to exit.
    ///
    /// Only the first call does anything; later and concurrent calls return
    /// `Ok(())` immediately. Closing the plugin's stdin is its signal to
    /// shut down.
    pub async fn close(&self) -> Result<(), HostError> {
        let mut previous = HostState::Closed;
        let closed = self.inner.state.send_if_modified(|state| {
            previous = *state;
            if *state == HostState::Closed {
                false
            } else {
                *state = HostState::Closed;
                true
            }
        });
        if !closed {
            return Ok(());
        }
        info!(?previous, "Closing plugin connection");

        self.inner.close_pending();
        if let Some(sink) = self.inner.sink.get() {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "Closing plugin stdin failed");
            }
        }

        let child = self.inner.child.lock().await.take();
        if let Some(mut child) = child {
            let status = child.wait().await?;
            if !status.success() {
                return Err(HostError::PluginExit(status));
            }
        }
        Ok(())
    }

    async fn wait_started(&self) {
        let mut state = self.inner.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = state.wait_for(|s| *s != HostState::Unstarted).await;
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("state", &self.state())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Registration of one in-flight call.
///
/// Dropping it removes the slot. While `armed`, dropping also tells the plugin
/// to cancel the request, which covers callers that abandon the call future.
struct OutstandingCall<'a> {
    inner: &'a HostInner,
    id: String,
    sink: EnvelopeSink,
    armed: bool,
}

impl OutstandingCall<'_> {
    fn forget(&self) {
        self.inner.pending().calls.remove(&self.id);
    }

    async fn cancel(mut self) {
        self.armed = false;
        self.forget();
        debug!(id = %self.id, "Call cancelled, notifying plugin");
        if let Err(e) = self.sink.send(&Envelope::cancel(self.id.as_str())).await {
            debug!(id = %self.id, error = %e, "Failed to send cancellation");
        }
    }
}

impl Drop for OutstandingCall<'_> {
    fn drop(&mut self) {
        self.forget();
        if !self.armed {
            return;
        }
        debug!(id = %self.id, "Call abandoned, notifying plugin");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let sink = self.sink.clone();
            let cancel = Envelope::cancel(self.id.as_str());
            handle.spawn(async move {
                let _ = sink.send(&cancel).await;
            });
        }
    }
}

fn decode_reply<Resp: DeserializeOwned>(envelope: Envelope) -> Result<Resp, CallError> {
    if let Some(error) = envelope.error {
        return Err(CallError::Remote(error));
    }
    serde_json::from_value(envelope.data.unwrap_or(Value::Null)).map_err(CallError::MalformedResponse)
}

async fn forward_stderr(mut stderr: ChildStderr, mut sink: plugwire_api::BoxedWrite) {
    if let Err(e) = tokio::io::copy(&mut stderr, &mut sink).await {
        debug!(error = %e, "Forwarding plugin stderr stopped");
    }
    let _ = sink.shutdown().await;
}
