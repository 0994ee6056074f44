// Colloquy Library
// Realtime WebSocket gateway for multi-user assistant chat

pub mod chat;
pub mod config;
pub mod error;

pub use error::{GatewayError, GatewayResult};
