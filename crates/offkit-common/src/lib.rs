//! # OffKit Common
//!
//! Common utilities shared by the OffKit offline-caching crates.
//!
//! ## Features
//!
//! - Logging configuration and setup
//! - The [`Throttle`] primitive that rate-gates update polling

pub mod logging;
pub mod throttle;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use throttle::Throttle;
