//! plugwire-host: Host runtime for plugwire plugins
//!
//! This crate launches a plugin process and multiplexes typed calls to it over
//! the plugin's stdin/stdout.
//!
//! ```rust,ignore
//! use plugwire_host::{Host, LaunchConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let host = Host::new();
//! let runner = host.clone();
//! tokio::spawn(async move {
//!     runner
//!         .run_plugin("./target/debug/arith-plugin", LaunchConfig::default(), CancellationToken::new())
//!         .await
//! });
//!
//! let sum: AddResponse = host.call("add", &AddRequest { a: 2, b: 3 }, &CancellationToken::new()).await?;
//! host.close().await?;
//! ```

pub mod config;
pub mod error;
pub mod host;
pub mod launcher;

pub use config::{LaunchConfig, StderrSink};
pub use error::{CallError, HostError, LaunchError};
pub use host::{Host, HostState};
pub use launcher::{launch, PluginProcess, PluginReference};
pub use plugwire_api::{Envelope, EnvelopeKind};
pub use tokio_util::sync::CancellationToken;
