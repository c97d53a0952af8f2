//! # CareWatch Core
//!
//! Configuration and error types shared by the scheduler crate and the
//! `carewatch` operator binary.

pub mod config;
pub mod error;

pub use config::{CareConfig, SchedulerConfig, StorageConfig};
pub use error::{CareError, Result};
