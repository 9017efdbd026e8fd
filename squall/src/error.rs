// Squall error codes
//
// Austin Shafer - 2024
#![allow(non_camel_case_types)]

use crate::queues::QueueRole;
use ash::vk;

use thiserror::Error;

/// Errors returned by squall
///
/// Anything coming out of `VK_CALL_FAILED` is an unexpected result from the
/// driver. We never retry those, callers are expected to treat them as
/// unrecoverable and tear the process down.
#[derive(Error, Debug)]
pub enum SquallError {
    #[error("Vulkan call {0} failed: {1}")]
    VK_CALL_FAILED(&'static str, vk::Result),
    #[error("Could not load the Vulkan library: {0}")]
    VK_LOADING_FAILED(String),
    #[error("No queue family available for the {0:?} role")]
    NO_QUEUE_FAMILY(QueueRole),
    #[error("Required device extension {0} is not available")]
    MISSING_EXTENSION(&'static str),
    #[error("No suitable physical device found")]
    NO_SUITABLE_DEVICE,
    #[error("The presentation chain is out of date")]
    OUT_OF_DATE,
    #[error("This surface cannot be presented by this device")]
    SURFACE_NOT_SUPPORTED,
    #[error("No Vulkan display matches this connector")]
    DISPLAY_NOT_FOUND,
    #[error("Device still has {0} render targets attached")]
    DEVICE_BUSY(usize),
    #[error("Invalid device id")]
    INVALID_DEVICE,
    #[error("Invalid render target id")]
    INVALID_TARGET,
    #[error("No memory type satisfies the allocation")]
    NO_MEMORY_TYPE,
}

pub type Result<T> = std::result::Result<T, SquallError>;

/// Shorthand for mapping a raw `vk::Result` error to `VK_CALL_FAILED`
///
/// ```ignore
/// unsafe { dev.create_fence(&info, None) }.map_err(vk_err("vkCreateFence"))?;
/// ```
pub(crate) fn vk_err(call: &'static str) -> impl Fn(vk::Result) -> SquallError {
    move |res| SquallError::VK_CALL_FAILED(call, res)
}
