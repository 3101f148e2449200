//! # hyperk Common
//!
//! Shared utilities for the hyperk components.
//!
//! ## Logging
//!
//! ```rust
//! use hyperk_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(vm = "test-vm", "Provisioning started");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json};
