//! Configuration module for quic-dispatcher
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use quic_dispatcher::config::{load_config, DispatcherConfig};
//!
//! let config: DispatcherConfig = load_config("/etc/quic-dispatcher/config.json").unwrap();
//! println!("Listening on {}", config.listen.address);
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{
    BufferConfig, DispatchConfig, DispatcherConfig, ListenConfig, LogConfig, TimeWaitSettings,
    ValidatorConfig,
};
