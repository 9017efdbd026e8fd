// Vulkan logical device
//
// This stores per-GPU state, such as the Vulkan Device object, the
// queues we submit to and the pools we record command buffers from.
//
// Austin Shafer - 2024
use ash::extensions::khr;
use ash::vk;

use crate::allocator::MemAllocator;
use crate::caps::PhysicalDevice;
use crate::error::{vk_err, Result, SquallError};
use crate::fence::GpuFence;
use crate::instance::Instance;
use crate::queues::{QueueAssignment, QueueRole};
use crate::selector::Requirements;
use utils::log;

use std::os::raw::c_char;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Keeps a device open
///
/// Render targets hold one of these for as long as they are bound to a
/// device. `LogicalDevice::close` refuses to run while any are alive.
pub struct DeviceRegistration {
    dr_count: Arc<AtomicUsize>,
}

impl Drop for DeviceRegistration {
    fn drop(&mut self) {
        self.dr_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An open GPU
///
/// Owns the vkDevice, one queue per role that has a family, and a
/// command pool per role. Closing is explicit, see `close`.
pub struct LogicalDevice {
    pub(crate) d_physical: PhysicalDevice,
    pub(crate) dev: ash::Device,
    d_queues: QueueAssignment,
    /// queue handle per role that has a family
    d_queue_handles: Vec<(QueueRole, vk::Queue)>,
    /// command pool per role
    d_pools: Vec<(QueueRole, vk::CommandPool)>,
    /// Held for vkQueueSubmit and vkQueuePresentKHR, targets on this
    /// device render from their own threads
    d_queue_lock: Mutex<()>,
    d_allocator: MemAllocator,
    /// VK_KHR_swapchain entry points, if presentation is possible
    pub(crate) d_swapchain_loader: Option<khr::Swapchain>,
    d_push_descriptor: khr::PushDescriptor,
    d_registrations: Arc<AtomicUsize>,
    d_closed: bool,
}

impl LogicalDevice {
    /// Create a vkDevice from a probed physical device
    ///
    /// `present_support[i]` says if queue family `i` can present to the
    /// surface this device is being opened for. It may be empty if there
    /// is no surface yet, in which case the Present role stays unassigned
    /// and targets fall back to a presentable family later on.
    pub fn open(
        inst: &Instance,
        physical: &PhysicalDevice,
        reqs: Requirements,
        present_support: &[bool],
    ) -> Result<Self> {
        let queues = QueueAssignment::resolve(&physical.pd_queue_families, present_support, reqs)?;

        if !physical.supports_push_descriptors() {
            return Err(SquallError::MISSING_EXTENSION("VK_KHR_push_descriptor"));
        }
        if !physical.supports_dynamic_rendering() {
            return Err(SquallError::MISSING_EXTENSION("VK_KHR_dynamic_rendering"));
        }

        let mut extension_names: Vec<*const c_char> = vec![khr::PushDescriptor::name().as_ptr()];
        let has_swapchain = physical.has_extension(khr::Swapchain::name());
        if has_swapchain {
            extension_names.push(khr::Swapchain::name().as_ptr());
        } else if !present_support.is_empty() {
            return Err(SquallError::MISSING_EXTENSION("VK_KHR_swapchain"));
        }

        // for now we only have one queue per family, so one priority
        let priorities = [1.0];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = queues
            .unique_families()
            .iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(*family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let mut vulkan13_features = vk::PhysicalDeviceVulkan13Features::builder()
            .dynamic_rendering(true)
            .build();

        let dev_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut vulkan13_features);

        let dev = unsafe {
            inst.inst
                .create_device(physical.pd_handle, &dev_create_info, None)
                .map_err(vk_err("vkCreateDevice"))?
        };

        let mut queue_handles = Vec::new();
        for role in QueueRole::ALL.iter() {
            if let Some(family) = queues.family(*role) {
                let queue = unsafe { dev.get_device_queue(family, 0) };
                queue_handles.push((*role, queue));
            }
        }

        let mut pools = Vec::new();
        for (role, _) in queue_handles.iter() {
            let family = match queues.family(*role) {
                Some(f) => f,
                None => continue,
            };
            let pool_create_info = vk::CommandPoolCreateInfo::builder()
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .queue_family_index(family);

            match unsafe { dev.create_command_pool(&pool_create_info, None) } {
                Ok(pool) => pools.push((*role, pool)),
                Err(e) => {
                    unsafe {
                        for (_, pool) in pools.iter() {
                            dev.destroy_command_pool(*pool, None);
                        }
                        dev.destroy_device(None);
                    }
                    return Err(SquallError::VK_CALL_FAILED("vkCreateCommandPool", e));
                }
            }
        }

        let mem_props = unsafe {
            inst.inst
                .get_physical_device_memory_properties(physical.pd_handle)
        };

        log::info!(
            "Opened logical device on {} with queue families {:?}",
            physical.pd_name,
            queues.unique_families()
        );

        Ok(Self {
            d_physical: physical.clone(),
            d_queues: queues,
            d_queue_handles: queue_handles,
            d_pools: pools,
            d_queue_lock: Mutex::new(()),
            d_allocator: MemAllocator::new(&dev, mem_props),
            d_swapchain_loader: match has_swapchain {
                true => Some(khr::Swapchain::new(&inst.inst, &dev)),
                false => None,
            },
            d_push_descriptor: khr::PushDescriptor::new(&inst.inst, &dev),
            d_registrations: Arc::new(AtomicUsize::new(0)),
            d_closed: false,
            dev: dev,
        })
    }

    /// The raw vkDevice, for recording commands
    pub fn raw(&self) -> &ash::Device {
        &self.dev
    }

    pub fn physical(&self) -> &PhysicalDevice {
        &self.d_physical
    }

    pub fn queue_assignment(&self) -> &QueueAssignment {
        &self.d_queues
    }

    pub fn allocator(&self) -> &MemAllocator {
        &self.d_allocator
    }

    pub fn push_descriptor(&self) -> &khr::PushDescriptor {
        &self.d_push_descriptor
    }

    pub fn queue(&self, role: QueueRole) -> Option<vk::Queue> {
        self.d_queue_handles
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, q)| *q)
    }

    pub(crate) fn command_pool(&self, role: QueueRole) -> Option<vk::CommandPool> {
        self.d_pools
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, p)| *p)
    }

    /// Find a queue that can present
    ///
    /// `can_present` is asked about family indices. The Present role is
    /// used if it was assigned, then the graphics family, then any other
    /// family we created a queue for.
    pub(crate) fn present_queue<F>(&self, can_present: F) -> Result<(u32, vk::Queue)>
    where
        F: Fn(u32) -> Result<bool>,
    {
        for role in [QueueRole::Present, QueueRole::Graphics].iter() {
            if let (Some(family), Some(queue)) = (self.d_queues.family(*role), self.queue(*role)) {
                if can_present(family)? {
                    return Ok((family, queue));
                }
            }
        }
        for family in self.d_queues.unique_families() {
            if can_present(family)? {
                if let Some(role) = QueueRole::ALL
                    .iter()
                    .find(|r| self.d_queues.family(**r) == Some(family))
                {
                    if let Some(queue) = self.queue(*role) {
                        return Ok((family, queue));
                    }
                }
            }
        }
        Err(SquallError::SURFACE_NOT_SUPPORTED)
    }

    /// Run `f` with exclusive access to this device's queues
    pub(crate) fn with_queues<T, F: FnOnce() -> T>(&self, f: F) -> T {
        let _guard = self.d_queue_lock.lock().unwrap_or_else(|e| e.into_inner());
        f()
    }

    /// Allocate primary command buffers from the pool of `role`
    pub(crate) fn allocate_command_buffers(
        &self,
        role: QueueRole,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let pool = self
            .command_pool(role)
            .ok_or(SquallError::NO_QUEUE_FAMILY(role))?;
        let cbuf_allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(count)
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY);

        unsafe {
            self.dev
                .allocate_command_buffers(&cbuf_allocate_info)
                .map_err(vk_err("vkAllocateCommandBuffers"))
        }
    }

    pub(crate) fn free_command_buffers(&self, role: QueueRole, cbufs: &[vk::CommandBuffer]) {
        if let Some(pool) = self.command_pool(role) {
            unsafe { self.dev.free_command_buffers(pool, cbufs) };
        }
    }

    pub(crate) fn create_semaphore(&self) -> Result<vk::Semaphore> {
        unsafe {
            self.dev
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                .map_err(vk_err("vkCreateSemaphore"))
        }
    }

    pub fn create_fence(&self, signaled: bool) -> Result<GpuFence> {
        GpuFence::new(&self.dev, signaled)
    }

    /// Mark a render target as bound to this device
    pub fn register(&self) -> DeviceRegistration {
        self.d_registrations.fetch_add(1, Ordering::SeqCst);
        DeviceRegistration {
            dr_count: self.d_registrations.clone(),
        }
    }

    /// Number of render targets bound to this device
    pub fn registrations(&self) -> usize {
        self.d_registrations.load(Ordering::SeqCst)
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.dev
                .device_wait_idle()
                .map_err(vk_err("vkDeviceWaitIdle"))
        }
    }

    /// Close the device
    ///
    /// Waits for the device to go idle and destroys everything. Fails with
    /// DEVICE_BUSY while render targets are still registered.
    pub fn close(&mut self) -> Result<()> {
        if self.d_closed {
            return Ok(());
        }
        let count = self.registrations();
        if count > 0 {
            return Err(SquallError::DEVICE_BUSY(count));
        }

        self.wait_idle()?;
        let live = self.d_allocator.live_allocations();
        if live > 0 {
            log::error!(
                "Closing {} with {} allocations ({} bytes) still live",
                self.d_physical.pd_name,
                live,
                self.d_allocator.allocated_bytes()
            );
        }
        unsafe {
            for (_, pool) in self.d_pools.drain(..) {
                self.dev.destroy_command_pool(pool, None);
            }
            self.dev.destroy_device(None);
        }
        self.d_closed = true;
        log::info!("Closed logical device on {}", self.d_physical.pd_name);

        Ok(())
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            // Leak it rather than pull the device out from under someone
            log::error!(
                "Could not close device {} on drop: {}",
                self.d_physical.pd_name,
                e
            );
        }
    }
}
