//! # Squall
//!
//! Squall is the GPU half of Cyclone. It finds the Vulkan devices in the
//! system, decides which one should drive what, and keeps the resources
//! used for presenting alive exactly as long as the GPU needs them.
//!
//! The general flow is:
//! * Create an `Instance`
//! * Probe the physical devices (`enumerate_physical_devices`)
//! * Register them in a `GpuFleet`
//! * `attach` a `SurfaceSource` to a device, getting a render target
//! * Call `render_all` once per loop iteration
//!
//! Objects that the GPU may still be reading are never dropped inline.
//! They are handed to the `GpuResourceReclaimer` along with the fence of
//! the last submission that used them.
//!
//! ## Requirements
//!
//! Squall requires Vulkan 1.3 and the following extensions:
//! * VK_KHR_push_descriptor
//! * VK_KHR_swapchain (when presenting)
//! * VK_EXT_acquire_drm_display and VK_KHR_display for DRM outputs
//! * VK_KHR_wayland_surface for running nested

// Austin Shafer - 2024

mod allocator;
mod caps;
mod device;
mod error;
mod fence;
mod fleet;
mod gate;
mod instance;
mod queues;
mod reclaimer;
mod selector;
mod target;

pub use allocator::{find_memory_type_index, GpuBuffer, MemAllocator};
pub use caps::{enumerate_physical_devices, PciLocation, PhysicalDevice};
pub use device::{DeviceRegistration, LogicalDevice};
pub use error::{Result, SquallError};
pub use fence::{Fence, GpuFence, HostFence};
pub use fleet::{DeviceId, GpuFleet, TargetId};
pub use gate::{DeviceGate, GateState};
pub use instance::{Instance, InstanceInfo};
pub use queues::{QueueAssignment, QueueInfo, QueueRole};
pub use reclaimer::{GpuResourceReclaimer, RECLAIM_BACKOFF};
pub use selector::{pick_best, score, PresentationQuery, Requirements};
pub use target::{
    CommandRecorder, DisplayMode, FrameRing, FrameStatus, RenderTarget, Renderable, Surface,
    SurfaceSource, TargetInfo, TargetOptions,
};

pub use ash;

/// Anything that can be handed to the reclaimer
///
/// This is just a way to erase the type of garbage, everything drops.
pub trait Droppable {}
impl<T> Droppable for T {}
