//! # Metronome Core
//!
//! Shared foundation for the Metronome scheduling system: the unified
//! error type and the TOML configuration layer. Everything else lives in
//! `metronome-scheduler`.

pub mod config;
pub mod error;

pub use config::MetronomeConfig;
pub use error::{MetronomeError, Result};
