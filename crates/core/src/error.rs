//! Error types shared across the engine.

use thiserror::Error;

use crate::fatal::Disposition;

/// Main error type for engine-level operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Graphics device errors surfaced above the RHI layer
    #[error("Device error: {0}")]
    Device(String),

    /// The presentation surface went stale; rebuilding it recovers
    #[error("Surface error: {0}")]
    Surface(String),

    /// Window creation or management errors
    #[error("Window error: {0}")]
    Window(String),

    /// Asset decode or upload errors
    #[error("Asset error: {0}")]
    Asset(String),

    /// Shader translation errors
    #[error("Shader error: {0}")]
    Shader(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration values are invalid
    #[error("Config error: {0}")]
    Config(String),

    /// A loader task was abandoned before it produced a value
    #[error("Task cancelled")]
    Cancelled,

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the engine can carry on after this error.
    ///
    /// Device and internal errors are fatal. A stale surface, a bad asset,
    /// a shader that fails to translate or a cancelled task only cost the
    /// caller the work they were doing.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Device(_) | Self::Window(_) | Self::Internal(_) => Disposition::Fatal,
            Self::Surface(_)
            | Self::Asset(_)
            | Self::Shader(_)
            | Self::Io(_)
            | Self::ConfigParse(_)
            | Self::Config(_)
            | Self::Cancelled => Disposition::Recoverable,
        }
    }

    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.disposition() == Disposition::Fatal
    }
}

/// Result type alias using the engine's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts() {
        fn open() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "missing"))?;
            Ok(())
        }
        let err = open().unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_display_prefixes() {
        assert_eq!(
            Error::Asset("bad png".into()).to_string(),
            "Asset error: bad png"
        );
        assert_eq!(Error::Cancelled.to_string(), "Task cancelled");
    }

    #[test]
    fn test_disposition() {
        assert!(Error::Device("lost".into()).is_fatal());
        assert!(Error::Internal("pool".into()).is_fatal());
        assert!(!Error::Asset("bad png".into()).is_fatal());
        assert!(!Error::Surface("out of date".into()).is_fatal());
        assert_eq!(Error::Cancelled.disposition(), Disposition::Recoverable);
    }
}
