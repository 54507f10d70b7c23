//! Peer-to-peer gossip: wire message types and the TCP node.

pub mod message;
pub mod server;

pub use message::{InvKind, Message};
pub use server::{send_tx, Server};
