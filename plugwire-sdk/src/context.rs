//! Per-request execution context handed to handlers

use tokio_util::sync::CancellationToken;

/// What a handler knows about the request it is serving.
///
/// The token is a child of the plugin's root token. It fires when the host
/// sends a cancel envelope for this id, when the plugin shuts down, or once
/// the handler has returned. Handlers observe it cooperatively; nothing is
/// aborted on their behalf.
#[derive(Debug, Clone)]
pub struct RequestContext {
    id: String,
    method: String,
    token: CancellationToken,
}

impl RequestContext {
    pub(crate) fn new(id: String, method: String, token: CancellationToken) -> Self {
        Self { id, method, token }
    }

    /// Correlation id assigned by the host
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the request is cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// The underlying token, for passing into other cancellable APIs
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
