//! Shell sessions: child process channel, interpreter profiles, directory
//! tracking and the request/response and streaming delivery handles.

pub mod channel;
pub mod directory;
pub mod interpreter;
pub mod shell;

pub use channel::{ChannelFactory, OutputStream, PipeChannelFactory, ShellChannel};
pub use interpreter::Interpreter;
pub use shell::{
    Delivery, DeliveryMode, OutputTap, SessionOptions, ShellSession, StreamingSession,
    SyncSession, NO_OUTPUT_MESSAGE,
};
