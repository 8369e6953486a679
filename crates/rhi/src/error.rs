//! RHI-specific error types.

use ash::vk;
use kiln_core::Disposition;
use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] vk::Result),

    /// Failed to load Vulkan
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// Shader translation or module error
    #[error("Shader error: {0}")]
    ShaderError(String),

    /// Surface creation error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// The surface no longer matches the swapchain; rebuild it.
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// A handle that this backend never created, or already destroyed
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Pipeline creation error
    #[error("Pipeline error: {0}")]
    PipelineError(String),

    /// Render pass or framebuffer creation error
    #[error("Render pass error: {0}")]
    RenderPassError(String),

    /// Shader cache IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RhiError {
    /// Classify the error for the frame loop.
    ///
    /// Only a stale swapchain is recoverable. Everything else signals a device
    /// or resource state the engine cannot continue from.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::SwapchainOutOfDate => Disposition::Recoverable,
            Self::VulkanError(result) => match *result {
                vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR => {
                    Disposition::Recoverable
                }
                _ => Disposition::Fatal,
            },
            _ => Disposition::Fatal,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.disposition() == Disposition::Recoverable
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

/// Keeps the error's class: a stale swapchain stays recoverable, shader
/// and IO failures keep their kinds, and every other failure is a fatal
/// device error.
impl From<RhiError> for kiln_core::Error {
    fn from(err: RhiError) -> Self {
        if err.is_recoverable() {
            return Self::Surface(err.to_string());
        }
        match err {
            RhiError::Io(e) => Self::Io(e),
            RhiError::ShaderError(msg) => Self::Shader(msg),
            other => Self::Device(other.to_string()),
        }
    }
}
