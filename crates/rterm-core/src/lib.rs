//! rterm-core: Shared protocol library for the remote terminal.
//!
//! Provides the marker-delimited response framing, the streaming response
//! decoder, reserved command tokens, and the error type shared by server
//! and client.

pub mod codec;
pub mod command;
pub mod error;

// Re-export commonly used items at crate root.
pub use codec::{
    frame_response, timestamp_prefix, Marker, ResponseDecoder, END_OF_RESPONSE_MARKER,
    LEGACY_END_MARKER,
};
pub use command::{is_exit, strip_line_ending, CommandLine};
pub use error::{RtermError, RtermResult};

/// Default TCP port of the remote terminal server.
pub const DEFAULT_PORT: u16 = 27015;

/// Default per-read buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
