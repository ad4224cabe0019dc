//! Shared configuration, error, and type definitions used across the
//! passt-rs workspace (`passt-net`, `passt-tap`, `passt-daemon`).

pub mod config;
pub mod error;
pub mod types;

pub use error::{Error, Result};
