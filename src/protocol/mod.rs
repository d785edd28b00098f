//! MySQL wire protocol: envelope framing, typed messages, and the response
//! decoder.
//!
//! The rest of the crate only ever sees typed [`client::ClientMessage`] and
//! [`server::ServerMessage`] values; byte-level concerns stay in here.

pub mod client;
pub mod codec;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use server::{Conversation, Decoder, ServerMessage};
