//! nex-core: Shared library for the nex host agent
//!
//! This crate provides:
//! - Signed login/session tokens
//! - Protocol types for WebSocket communication
//! - The host telemetry snapshot model
//! - Configuration loading

pub mod auth;
pub mod config;
pub mod protocol;
pub mod stats;

pub use auth::{AuthError, Claims, JwtAuth, TokenPurpose, TokenValidator};
pub use config::Config;
pub use protocol::{ClientCommand, Event, MediaCommand};
pub use stats::SystemStats;

/// Default HTTP/WebSocket port for nex-server
pub const DEFAULT_PORT: u16 = 9384;
