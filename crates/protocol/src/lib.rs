//! agentbridge protocol
//!
//! Shared types for communication between the bridge server and its clients.
//! Every frame on the WebSocket is an [`Envelope`] serialized as JSON.

use uuid::Uuid;

pub mod agent;
pub mod client;
pub mod envelope;
pub mod server;
pub mod types;

pub use client::ClientControl;
pub use envelope::{Channel, Envelope, EnvelopeError, Payload};
pub use server::ServerControl;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
