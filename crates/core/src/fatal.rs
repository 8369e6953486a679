//! Terminal handling for unrecoverable device conditions.

use std::fmt::Display;

/// How the engine reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Device lost, allocation failure, object creation failure. The process aborts.
    Fatal,
    /// Surface changed underneath the swapchain. Rebuild and skip the frame.
    Recoverable,
}

/// Log a final error line and abort the process.
///
/// Destructors do not run.
pub fn fatal(context: &str, err: impl Display) -> ! {
    tracing::error!("fatal: {context}: {err}");
    std::process::abort()
}
