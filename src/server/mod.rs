//! WebSocket server module
//!
//! Handles WebSocket connections from browser clients and routes requests
//! into the session manager.

mod protocol;
mod websocket;

pub use protocol::*;
pub use websocket::*;
