//! Configuration management module
//!
//! Provides TOML-based configuration for the daemon.

mod config;

pub use config::*;
