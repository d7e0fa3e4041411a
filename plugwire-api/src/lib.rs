//! plugwire-api: Shared types for the plugwire protocol
//!
//! This crate defines the protocol between host and plugin process.
//! Communication uses newline-delimited JSON over the plugin's stdin/stdout,
//! one [`Envelope`] per line.

pub mod codec;
pub mod envelope;

pub use codec::{
    BoxedWrite, CodecError, EnvelopeReader, EnvelopeSink, EnvelopeWriter, MAX_LINE_LENGTH,
};
pub use envelope::{Envelope, EnvelopeKind};

/// Prefix of the error message sent for requests naming an unregistered method
pub const UNKNOWN_METHOD_PREFIX: &str = "unknown method: ";

/// Prefix of the error message sent for requests reusing a live identifier
pub const DUPLICATE_ID_PREFIX: &str = "duplicate request id: ";
