//! Core utilities shared by every kiln crate.
//!
//! This crate provides:
//! - Error types and result aliases
//! - Logging initialization
//! - Engine configuration loaded from TOML
//! - The fatal-abort path used for unrecoverable device errors
//! - Generational arenas used for render-side handles
//! - Frame timing

pub mod arena;
mod config;
mod error;
mod fatal;
mod logging;
mod timer;

pub use arena::{Arena, Handle};
pub use config::{
    DebugConfig, EngineConfig, FrameConfig, LoaderConfig, ShaderConfig, WindowConfig,
};
pub use error::{Error, Result};
pub use fatal::{Disposition, fatal};
pub use logging::{DEFAULT_LOG_FILTER, init_logging, init_logging_with};
pub use timer::FrameClock;
