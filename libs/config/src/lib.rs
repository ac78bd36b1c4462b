//! # Responder Configuration
//!
//! Layered configuration for the RPC responder service.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rpc_config::ResponderConfig;
//! use std::path::Path;
//!
//! let config = ResponderConfig::load(Some(Path::new("config/responder.toml")))?;
//! let processor = config.processor_config();
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod responder_config;

// Re-export commonly used types
pub use responder_config::{
    BrokerSettings, ConfigLoader, LogFormat, LoggingSettings, ResolverKind, ResolverSettings,
    ResponderConfig, ResponderSettings, ENV_PREFIX, ENV_SEPARATOR,
};
