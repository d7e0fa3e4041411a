//! Host-side error types
//!
//! [`CallError`] is returned per call and never affects other in-flight calls.
//! [`HostError`] describes the engine lifecycle: starting, the terminal state
//! of the inbound stream, and the plugin's exit. [`LaunchError`] covers
//! resolving and spawning the plugin process.

use std::path::PathBuf;
use std::process::ExitStatus;

use plugwire_api::CodecError;
use thiserror::Error;

/// Errors returned by [`Host::call`](crate::Host::call)
#[derive(Debug, Error)]
pub enum CallError {
    /// The engine is not running: not started yet, closed, or the stream ended
    #[error("closed")]
    Closed,

    /// The plugin reported an error for this call (handler failure or
    /// unknown method). Displays exactly the plugin's message.
    #[error("{0}")]
    Remote(String),

    /// The response payload does not match the expected result type
    #[error("malformed response: {0}")]
    MalformedResponse(#[source] serde_json::Error),

    /// The caller's cancellation token fired before a response arrived
    #[error("call cancelled")]
    Cancelled,

    /// The request value could not be encoded as JSON
    #[error("marshaling request: {0}")]
    Marshal(#[source] serde_json::Error),

    /// Writing the request envelope failed
    #[error("sending request: {0}")]
    Transport(#[source] CodecError),
}

impl CallError {
    /// Whether the plugin itself reported this error
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Whether this error means the engine is no longer usable
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed | Self::Transport(_))
    }

    /// Whether the plugin is misbehaving (as opposed to reporting an error)
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedResponse(_))
    }
}

/// Errors returned by the host lifecycle operations
#[derive(Debug, Error)]
pub enum HostError {
    #[error("plugin already running")]
    AlreadyStarted,

    #[error("host closed")]
    Closed,

    #[error("inbound stream failed: {0}")]
    Transport(#[source] CodecError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("plugin exited with {0}")]
    PluginExit(ExitStatus),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while resolving or spawning a plugin
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("invalid plugin path: {0}")]
    InvalidReference(PathBuf),

    #[error("{tool} toolchain not in PATH")]
    ToolchainMissing { tool: String },

    #[error("failed to spawn plugin {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin {0} was not configured with a piped handle")]
    MissingPipe(&'static str),
}
