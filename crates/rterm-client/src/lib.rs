//! rterm-client: Rust client library for the remote terminal protocol.
//!
//! Connects to an `rterm-server` over TCP, sends one command per line and
//! splits the server's byte stream back into framed responses and
//! streamed shell output.
//!
//! # Quick Start
//!
//! ```no_run
//! use rterm_client::{ConnectConfig, RtermClient, ServerEvent};
//!
//! # async fn example() -> rterm_core::RtermResult<()> {
//! let mut client = RtermClient::connect("127.0.0.1:27015", ConnectConfig::default()).await?;
//!
//! let welcome = client.next_response().await?;
//! println!("{welcome}");
//!
//! client.send_command("echo hello").await?;
//! println!("{}", client.next_response().await?);
//!
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod client;

// Re-export primary public types.
pub use client::{ConnectConfig, RtermClient, ServerEvent};

// Re-export rterm-core error types for convenience.
pub use rterm_core::{RtermError, RtermResult};
