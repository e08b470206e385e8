//! Sigmux common services
//!
//! Error taxonomy, logging setup and configuration shared by every crate of
//! the signal multiplexer workspace.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{DispatchConfig, SigmuxConfig};
pub use error::{Result, SigmuxError};
