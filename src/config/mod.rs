//! Configuration management module
//!
//! TOML-based configuration, one `Deserialize`-derived struct per section.

mod config;

pub use config::*;
