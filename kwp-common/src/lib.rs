//! # KWP Common Library
//!
//! Shared code for the keywording pipeline crates:
//! - Error type and result alias
//! - TOML configuration loading, resolution and write-back
//! - Progress event types and the broadcast event bus

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
