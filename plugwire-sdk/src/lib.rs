//! plugwire-sdk: SDK for writing plugwire plugins
//!
//! A plugin is an ordinary executable that answers requests on stdin and
//! replies on stdout. This SDK runs the dispatch loop; the plugin author only
//! registers typed async handlers.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use plugwire_sdk::prelude::*;
//!
//! #[derive(Deserialize)]
//! struct AddRequest { a: i64, b: i64 }
//!
//! #[derive(Serialize)]
//! struct AddResponse { sum: i64 }
//!
//! fn build() -> Plugin {
//!     let mut plugin = Plugin::new();
//!     plugin.handle("add", |_ctx: RequestContext, req: AddRequest| async move {
//!         Ok::<_, String>(AddResponse { sum: req.a + req.b })
//!     });
//!     plugin
//! }
//!
//! // Generates `fn main`: stderr logging, then serve until stdin closes
//! plugin_main!(build());
//! ```
//!
//! Anything a plugin prints to stdout corrupts the protocol stream. Use
//! [`logging::init_subscriber`] to send `tracing` output to stderr instead.

pub mod context;
pub mod logging;
pub mod plugin;

pub use context::RequestContext;
pub use plugin::Plugin;
pub use plugwire_api::{Envelope, EnvelopeKind};
pub use tokio_util::sync::CancellationToken;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{plugin_main, CancellationToken, Plugin, RequestContext};
    pub use serde::{Deserialize, Serialize};
}

/// Run `plugin` on this process's stdin/stdout and exit with its return code.
///
/// Builds a multi-threaded tokio runtime, so plugin binaries do not need
/// their own `#[tokio::main]`.
pub fn serve(plugin: Plugin) -> ! {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("plugwire: failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(plugin.run(CancellationToken::new()));
    std::process::exit(code)
}

/// Generate a `main` function that installs the default stderr subscriber
/// and serves the given plugin.
///
/// The argument is any expression evaluating to a [`Plugin`].
///
/// ```rust,ignore
/// plugin_main!(build_plugin());
/// ```
#[macro_export]
macro_rules! plugin_main {
    ($plugin:expr) => {
        fn main() {
            $crate::logging::init_subscriber();
            $crate::serve($plugin)
        }
    };
}
