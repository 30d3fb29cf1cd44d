//! # Core Logic - Shared Utilities for Chain Services
//!
//! This crate provides the chain-agnostic layer used by every chain crate:
//! typed errors, configuration structures, logging, retry policies and
//! metrics.
//!
//! ## Modules
//!
//! - [`config`] - Network and monitor settings
//! - [`error`] - Typed error handling with thiserror
//! - [`metrics`] - Service metrics collection
//! - [`utils`] - Logger setup and retry policies

pub mod config;
pub mod error;
pub mod metrics;
pub(crate) mod utils;

pub use config::{MonitorSettings, NetworkConfig};
pub use error::{ConfigError, CoreError, PersistenceError, ProviderError, SubscriptionPayloadError};
pub use metrics::{MetricsCollector, MetricsSnapshot};

pub use utils::setup_logger;

pub use utils::retry::{
    is_transient_error, transient_kind, with_retry, with_shrinking_window, RetryConfig,
    ShrinkingWindow, TransientKind,
};
