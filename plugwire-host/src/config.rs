//! Launch configuration for plugin processes

use std::path::PathBuf;

use plugwire_api::BoxedWrite;
use tokio::io::AsyncWrite;

/// Default cargo executable used for package references
pub const DEFAULT_CARGO_COMMAND: &str = "cargo";

/// Where the plugin's stderr goes.
///
/// Stderr is the plugin's only diagnostic channel; stdout carries the protocol.
#[derive(Default)]
pub enum StderrSink {
    /// Share the host's stderr (default)
    #[default]
    Inherit,

    /// Discard everything
    Null,

    /// Copy into the writer, which is shut down once the plugin closes its
    /// stderr. The shutdown tells anything tailing the writer that no more
    /// diagnostic output will follow.
    Writer(BoxedWrite),
}

impl StderrSink {
    /// Forward stderr into an async writer
    pub fn writer<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::Writer(Box::new(writer))
    }
}

impl std::fmt::Debug for StderrSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inherit => f.write_str("Inherit"),
            Self::Null => f.write_str("Null"),
            Self::Writer(_) => f.write_str("Writer(..)"),
        }
    }
}

/// How to start a plugin process
#[derive(Debug)]
pub struct LaunchConfig {
    /// Cargo executable used to run package references
    pub cargo_command: String,

    /// Extra arguments for `cargo run` (e.g. `--release`)
    pub cargo_args: Vec<String>,

    /// Arguments passed to the plugin itself
    pub args: Vec<String>,

    /// Extra environment variables for the plugin
    pub env: Vec<(String, String)>,

    /// Working directory of the plugin process
    pub working_dir: Option<PathBuf>,

    /// Destination of the plugin's stderr
    pub stderr: StderrSink,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            cargo_command: DEFAULT_CARGO_COMMAND.to_string(),
            cargo_args: Vec::new(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            stderr: StderrSink::Inherit,
        }
    }
}

impl LaunchConfig {
    /// Create a config with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different cargo executable
    pub fn cargo_command(mut self, command: impl Into<String>) -> Self {
        self.cargo_command = command.into();
        self
    }

    /// Add an argument for `cargo run`
    pub fn cargo_arg(mut self, arg: impl Into<String>) -> Self {
        self.cargo_args.push(arg.into());
        self
    }

    /// Add an argument for the plugin
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for the plugin
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the stderr destination
    pub fn stderr(mut self, sink: StderrSink) -> Self {
        self.stderr = sink;
        self
    }
}
