// Error types for the RHI
//
// Every failure maps onto one of four categories. Only transient frame
// errors are recovered (by recreating the swapchain); everything else is
// fatal to the renderer.

use ash::vk;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RhiError>;

/// Coarse classification used by callers to decide between recovery and exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad environment at startup: no device, missing layers, unusable surface
    Configuration,
    /// A Vulkan object could not be created
    ResourceCreation,
    /// Swapchain out of date; recovered by recreation
    TransientFrame,
    /// A code defect (bad layout transition, impossible memory request)
    Programming,
}

#[derive(Debug, Error)]
pub enum RhiError {
    #[error("failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no suitable GPU found ({0} candidates enumerated)")]
    NoSuitableDevice(usize),

    #[error("validation layer {0} requested but not available")]
    MissingValidationLayer(String),

    #[error("failed to create {what}: {result}")]
    ResourceCreation { what: &'static str, result: vk::Result },

    #[error("Vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("swapchain is out of date")]
    SwapchainOutOfDate,

    #[error("unsupported image layout transition {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("no memory type matches bits {type_bits:#b} with {properties:?}")]
    NoCompatibleMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },

    #[error("write of {requested} bytes at offset {offset} overflows buffer of {capacity} bytes")]
    BufferOverflow {
        offset: vk::DeviceSize,
        requested: vk::DeviceSize,
        capacity: vk::DeviceSize,
    },

    #[error("buffer is not host-mapped")]
    NotMapped,

    #[error("frame slot {slot} fence did not signal within {waited:?}")]
    FenceTimeout { slot: usize, waited: Duration },
}

impl RhiError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RhiError::Loading(_)
            | RhiError::Configuration(_)
            | RhiError::NoSuitableDevice(_)
            | RhiError::MissingValidationLayer(_) => ErrorCategory::Configuration,
            RhiError::ResourceCreation { .. } | RhiError::Vulkan(_) | RhiError::FenceTimeout { .. } => {
                ErrorCategory::ResourceCreation
            }
            RhiError::SwapchainOutOfDate => ErrorCategory::TransientFrame,
            RhiError::UnsupportedLayoutTransition { .. }
            | RhiError::NoCompatibleMemoryType { .. }
            | RhiError::BufferOverflow { .. }
            | RhiError::NotMapped => ErrorCategory::Programming,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::TransientFrame
    }
}

/// Attach the object name to a failed creation call
pub(crate) trait CreationContext<T> {
    fn creating(self, what: &'static str) -> Result<T>;
}

impl<T> CreationContext<T> for std::result::Result<T, vk::Result> {
    fn creating(self, what: &'static str) -> Result<T> {
        self.map_err(|result| RhiError::ResourceCreation { what, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_recovery_policy() {
        assert!(RhiError::SwapchainOutOfDate.is_transient());
        assert_eq!(
            RhiError::NoSuitableDevice(2).category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            RhiError::UnsupportedLayoutTransition {
                old: vk::ImageLayout::GENERAL,
                new: vk::ImageLayout::PRESENT_SRC_KHR,
            }
            .category(),
            ErrorCategory::Programming
        );
        assert_eq!(
            RhiError::NoCompatibleMemoryType {
                type_bits: 0,
                properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            }
            .category(),
            ErrorCategory::Programming
        );
    }

    #[test]
    fn creation_context_names_the_object() {
        let failed: std::result::Result<(), vk::Result> =
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let err = failed.creating("render pass").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::ResourceCreation);
        assert!(err.to_string().contains("render pass"));
    }
}
