//! Configuration module
//!
//! Handles loading bridge settings from disk.

mod settings;

pub use settings::*;
