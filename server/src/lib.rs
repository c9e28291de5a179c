//! Connection-and-session server for a TCP command-line messenger.
//!
//! Clients register and log in against a persisted credential table, then
//! negotiate chats with `/newChat`, `/accept` and `/decline`. All commands
//! run on a single processor task fed by one bounded channel.

pub mod chat;
pub mod chats;
pub mod commands;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod ledger;
pub mod messages;
pub mod processor;
pub mod session;
pub mod shutdown;
pub mod state;

pub use chat::{ChatServer, ServerError};
pub use commands::{Command, CommandError, CommandKind};
pub use config::ServerConfig;
pub use messages::{FrameError, MessageType, Packet, read_packet, write_packet};
pub use session::ConnectionId;
pub use shutdown::shutdown_signal;
