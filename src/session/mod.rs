//! Session management module
//!
//! Maps (working directory, session file) keys to supervised agent
//! processes, fans agent events out to attached clients, and reclaims idle
//! sessions on a delay.

mod key;
mod managed;
mod manager;
mod state;

pub use key::*;
pub use managed::*;
pub use manager::*;
pub use state::*;
