//! Agent process transport module
//!
//! Owns the external agent process for a session and frames its line-delimited
//! JSON streams in both directions.

mod process;

pub use process::*;
