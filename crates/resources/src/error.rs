//! Error types for CPU-side asset data.

use std::path::PathBuf;
use thiserror::Error;

/// Error type for mesh and image data.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// A mesh has no vertices or no indices.
    #[error("Mesh '{0}' is empty")]
    EmptyMesh(String),

    /// An index points past the end of the vertex list.
    #[error("Index {index} out of range for {vertex_count} vertices")]
    IndexOutOfRange {
        /// Offending index value.
        index: u32,
        /// Number of vertices in the mesh.
        vertex_count: usize,
    },

    /// Pixel buffer does not match the declared dimensions.
    #[error("Image {width}x{height} needs {expected} bytes, got {actual}")]
    PixelSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    /// File not found.
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decode error.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Result type alias for resource operations.
pub type ResourceResult<T> = Result<T, ResourceError>;

impl From<ResourceError> for kiln_core::Error {
    fn from(err: ResourceError) -> Self {
        match err {
            ResourceError::Io(io) => kiln_core::Error::Io(io),
            other => kiln_core::Error::Asset(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converts_to_asset_error() {
        let err: kiln_core::Error = ResourceError::EmptyMesh("cube".into()).into();
        assert!(matches!(err, kiln_core::Error::Asset(_)));
        assert_eq!(err.to_string(), "Asset error: Mesh 'cube' is empty");
    }

    #[test]
    fn test_io_stays_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err: kiln_core::Error = ResourceError::Io(io).into();
        assert!(matches!(err, kiln_core::Error::Io(_)));
    }
}
