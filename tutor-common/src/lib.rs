//! Tutor Common - Shared configuration, errors, and logging for the tutor services.
//!
//! This crate provides:
//! - Configuration types, file loading, and environment overrides
//! - The unified error type and HTTP status mapping
//! - Logging setup with noise filtering

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    AuthConfig, Config, FrontendConfig, LlmConfig, ObservabilityConfig, PromptConfig,
    ServerConfig, SessionConfig, StoreConfig,
};
pub use error::{Error, Result, ResultExt};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result, ResultExt};
    pub use crate::logging::init_logging;
}
