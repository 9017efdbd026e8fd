/// Render targets
///
/// A render target is one presentable surface bound to one logical
/// device. It owns the presentation chain and a ring of frame slots, and
/// drives acquire/record/submit/present for every frame.
///
/// Austin Shafer - 2024
mod surface;
mod swapchain;

pub use surface::{DisplayMode, Surface, SurfaceSource};

use ash::vk;

use crate::device::{DeviceRegistration, LogicalDevice};
use crate::error::{vk_err, Result, SquallError};
use crate::fence::{Fence, GpuFence};
use crate::gate::DeviceGate;
use crate::queues::QueueRole;
use crate::reclaimer::GpuResourceReclaimer;
use crate::Droppable;
use swapchain::Swapchain;
use utils::log;

use std::sync::Arc;

/// What renderables get to know about the frame being recorded
#[derive(Debug, Clone, Copy)]
pub struct TargetInfo {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    /// The swapchain image being rendered to
    pub image: vk::Image,
    pub image_view: vk::ImageView,
    /// Index of the frame slot in use
    pub frame_index: usize,
}

/// Command recording context handed to renderables
///
/// Anything a renderable stops using while recording should be handed to
/// `retire` instead of dropped. It is destroyed after this frame's
/// fence signals.
pub struct CommandRecorder<'a> {
    cr_dev: &'a LogicalDevice,
    cr_cbuf: vk::CommandBuffer,
    cr_retired: Vec<Box<dyn Droppable + Send>>,
}

impl<'a> CommandRecorder<'a> {
    pub fn device(&self) -> &LogicalDevice {
        self.cr_dev
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.cr_cbuf
    }

    pub fn retire(&mut self, item: Box<dyn Droppable + Send>) {
        self.cr_retired.push(item);
    }
}

/// Something that draws into a render target
///
/// Called once per frame in registration order, inside the frame's
/// rendering pass.
pub trait Renderable: Send {
    fn render(&mut self, info: &TargetInfo, rec: &mut CommandRecorder) -> Result<()>;
}

/// What happened during a `render` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    /// The chain was out of date and was rebuilt, nothing was shown
    Recreated,
    /// The device gate is closed
    Paused,
}

/// Options for a new render target
#[derive(Debug, Clone, Copy)]
pub struct TargetOptions {
    /// Used when the surface doesn't dictate its own size
    pub extent: vk::Extent2D,
    /// Prefer a wide color surface format
    pub wide_color: bool,
    pub clear_color: [f32; 4],
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            wide_color: false,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Round robin over a fixed set of frame slots
///
/// A slot is only handed out again after its fence was waited on, so a
/// slot is never reused while the GPU may still be using it.
pub struct FrameRing<T> {
    fr_slots: Vec<T>,
    fr_current: usize,
}

impl<T> FrameRing<T> {
    pub fn new(slots: Vec<T>) -> Self {
        Self {
            fr_slots: slots,
            fr_current: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.fr_slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fr_slots.is_empty()
    }

    /// Take the next slot, waiting for it to be free first
    ///
    /// `wait` is called on the slot before it is returned. The ring
    /// advances even if the wait fails.
    pub fn next_slot<W>(&mut self, wait: W) -> Result<(usize, &mut T)>
    where
        W: Fn(&T) -> Result<()>,
    {
        let index = self.fr_current;
        self.fr_current = (self.fr_current + 1) % self.fr_slots.len().max(1);

        let slot = &mut self.fr_slots[index];
        wait(slot)?;
        Ok((index, slot))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.fr_slots.iter()
    }
}

/// Per-frame synchronization and recording state
struct FrameSlot {
    fs_dev: ash::Device,
    fs_pool: vk::CommandPool,
    fs_cbuf: vk::CommandBuffer,
    /// Signaled by acquire, waited on by the submission
    fs_image_available: vk::Semaphore,
    /// Signaled by the submission, waited on by present
    fs_render_finished: vk::Semaphore,
    fs_fence: Arc<GpuFence>,
}

impl FrameSlot {
    fn new(dev: &LogicalDevice) -> Result<Self> {
        let pool = dev
            .command_pool(QueueRole::Graphics)
            .ok_or(SquallError::NO_QUEUE_FAMILY(QueueRole::Graphics))?;
        let fence = Arc::new(dev.create_fence(true)?);
        let cbuf = dev.allocate_command_buffers(QueueRole::Graphics, 1)?[0];

        // Build this early so partial failures still clean up
        let mut ret = Self {
            fs_dev: dev.dev.clone(),
            fs_pool: pool,
            fs_cbuf: cbuf,
            fs_image_available: vk::Semaphore::null(),
            fs_render_finished: vk::Semaphore::null(),
            fs_fence: fence,
        };
        ret.fs_image_available = dev.create_semaphore()?;
        ret.fs_render_finished = dev.create_semaphore()?;

        Ok(ret)
    }

    fn fence(&self) -> Arc<dyn Fence> {
        self.fs_fence.clone()
    }
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        unsafe {
            self.fs_dev.destroy_semaphore(self.fs_image_available, None);
            self.fs_dev.destroy_semaphore(self.fs_render_finished, None);
            self.fs_dev.free_command_buffers(self.fs_pool, &[self.fs_cbuf]);
        }
    }
}

fn color_subresource() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Record a layout transition for a swapchain image
unsafe fn transition_image_layout(
    dev: &ash::Device,
    cbuf: vk::CommandBuffer,
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) {
    let (src_access, dst_access, src_stage, dst_stage) = match new {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        _ => (
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
    };

    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_subresource())
        .build();

    dev.cmd_pipeline_barrier(
        cbuf,
        src_stage,
        dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[barrier],
    );
}

/// One presentable output
pub struct RenderTarget {
    // Field order matters here, slots have to go before the swapchain and
    // the swapchain before the surface.
    t_frames: FrameRing<FrameSlot>,
    t_swapchain: Option<Swapchain>,
    t_surface: Surface,
    t_renderables: Vec<Box<dyn Renderable>>,
    t_gate: DeviceGate,
    t_graphics_queue: vk::Queue,
    t_present_queue: vk::Queue,
    t_options: TargetOptions,
    _t_registration: DeviceRegistration,
}

impl RenderTarget {
    /// Bind a surface to `dev`
    ///
    /// Fails with SURFACE_NOT_SUPPORTED if no queue on the device can
    /// present to the surface.
    pub fn new(
        dev: &LogicalDevice,
        surface: Surface,
        renderables: Vec<Box<dyn Renderable>>,
        gate: DeviceGate,
        options: TargetOptions,
    ) -> Result<Self> {
        let pdev = dev.d_physical.pd_handle;
        let (_, present_queue) = dev.present_queue(|family| surface.family_supports(pdev, family))?;
        let graphics_queue = dev
            .queue(QueueRole::Graphics)
            .ok_or(SquallError::NO_QUEUE_FAMILY(QueueRole::Graphics))?;

        let mut ret = Self {
            t_frames: FrameRing::new(Vec::new()),
            t_swapchain: None,
            t_surface: surface,
            t_renderables: renderables,
            t_gate: gate,
            t_graphics_queue: graphics_queue,
            t_present_queue: present_queue,
            t_options: options,
            _t_registration: dev.register(),
        };
        ret.recreate(dev)?;

        Ok(ret)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.t_swapchain
            .as_ref()
            .map(|sc| sc.sc_extent)
            .unwrap_or(self.t_options.extent)
    }

    pub fn format(&self) -> Option<vk::SurfaceFormatKHR> {
        self.t_swapchain.as_ref().map(|sc| sc.sc_format)
    }

    /// Number of frame slots, equal to the number of chain images
    pub fn frame_count(&self) -> usize {
        self.t_frames.len()
    }

    pub fn gate(&self) -> &DeviceGate {
        &self.t_gate
    }

    pub fn add_renderable(&mut self, renderable: Box<dyn Renderable>) {
        self.t_renderables.push(renderable);
    }

    /// Wait for every frame slot's outstanding work
    fn drain_frames(&self) -> Result<()> {
        for slot in self.t_frames.iter() {
            slot.fs_fence.wait()?;
        }
        Ok(())
    }

    /// Rebuild the chain and all frame slots
    fn recreate(&mut self, dev: &LogicalDevice) -> Result<()> {
        self.drain_frames()?;
        self.t_frames = FrameRing::new(Vec::new());

        let loader = dev
            .d_swapchain_loader
            .as_ref()
            .ok_or(SquallError::MISSING_EXTENSION("VK_KHR_swapchain"))?;
        let swapchain = Swapchain::new(
            &dev.dev,
            loader,
            dev.d_physical.pd_handle,
            &self.t_surface,
            self.t_options.extent,
            self.t_options.wide_color,
            self.t_swapchain.take(),
        )?;

        let slots = (0..swapchain.sc_images.len())
            .map(|_| FrameSlot::new(dev))
            .collect::<Result<Vec<_>>>()?;
        self.t_frames = FrameRing::new(slots);
        self.t_options.extent = swapchain.sc_extent;
        self.t_swapchain = Some(swapchain);

        Ok(())
    }

    /// Change the size of this target
    ///
    /// Waits on every in-flight frame, then rebuilds the chain and frame
    /// slots. Surfaces with a fixed size (display planes) keep it.
    pub fn resize(&mut self, dev: &LogicalDevice, extent: vk::Extent2D) -> Result<()> {
        self.t_options.extent = extent;
        self.recreate(dev)
    }

    /// Record the frame into the slot's command buffer
    fn record(
        renderables: &mut [Box<dyn Renderable>],
        dev: &LogicalDevice,
        slot: &FrameSlot,
        info: &TargetInfo,
        clear_color: [f32; 4],
        retired: &mut Vec<Box<dyn Droppable + Send>>,
    ) -> Result<()> {
        let raw = &dev.dev;
        let cbuf = slot.fs_cbuf;

        unsafe {
            raw.reset_command_buffer(cbuf, vk::CommandBufferResetFlags::RELEASE_RESOURCES)
                .map_err(vk_err("vkResetCommandBuffer"))?;
            let record_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            raw.begin_command_buffer(cbuf, &record_info)
                .map_err(vk_err("vkBeginCommandBuffer"))?;

            transition_image_layout(
                raw,
                cbuf,
                info.image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            );

            let attachments = [vk::RenderingAttachmentInfo::builder()
                .image_view(info.image_view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: clear_color,
                    },
                })
                .build()];
            let rendering_info = vk::RenderingInfo::builder()
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: info.extent,
                })
                .layer_count(1)
                .color_attachments(&attachments);
            raw.cmd_begin_rendering(cbuf, &rendering_info);
        }

        let mut rec = CommandRecorder {
            cr_dev: dev,
            cr_cbuf: cbuf,
            cr_retired: Vec::new(),
        };
        let mut ret = Ok(());
        for r in renderables.iter_mut() {
            if let Err(e) = r.render(info, &mut rec) {
                ret = Err(e);
                break;
            }
        }
        retired.append(&mut rec.cr_retired);

        unsafe {
            raw.cmd_end_rendering(cbuf);
            transition_image_layout(
                raw,
                cbuf,
                info.image,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            );
            raw.end_command_buffer(cbuf)
                .map_err(vk_err("vkEndCommandBuffer"))?;
        }

        ret
    }

    /// Render and present one frame
    ///
    /// An out of date chain is rebuilt and reported as `Recreated`, every
    /// other failure is returned. Objects retired by renderables are
    /// recycled under this frame's fence.
    pub fn render(
        &mut self,
        dev: &LogicalDevice,
        reclaimer: &GpuResourceReclaimer,
    ) -> Result<FrameStatus> {
        if !self.t_gate.is_active() {
            return Ok(FrameStatus::Paused);
        }
        if self.t_frames.is_empty() || self.t_swapchain.is_none() {
            self.recreate(dev)?;
            return Ok(FrameStatus::Recreated);
        }

        let (frame_index, slot) = self.t_frames.next_slot(|slot| slot.fs_fence.wait())?;
        let swapchain = match self.t_swapchain.as_ref() {
            Some(sc) => sc,
            None => return Err(SquallError::OUT_OF_DATE),
        };

        let image_index = match swapchain.acquire(slot.fs_image_available) {
            Ok(index) => index,
            Err(SquallError::OUT_OF_DATE) => {
                log::debug!("Acquire reported an out of date swapchain, recreating");
                self.recreate(dev)?;
                return Ok(FrameStatus::Recreated);
            }
            Err(e) => return Err(e),
        };

        // Only reset after a successful acquire. The fence is signaled
        // again by the submission below.
        slot.fs_fence.reset()?;

        let info = TargetInfo {
            extent: swapchain.sc_extent,
            format: swapchain.sc_format.format,
            image: swapchain.sc_images[image_index as usize],
            image_view: swapchain.sc_views[image_index as usize],
            frame_index: frame_index,
        };

        let graphics_queue = self.t_graphics_queue;
        let mut retired = Vec::new();
        let recorded = Self::record(
            &mut self.t_renderables,
            dev,
            slot,
            &info,
            self.t_options.clear_color,
            &mut retired,
        );

        let submitted = recorded.and_then(|_| {
            let wait_semas = [slot.fs_image_available];
            let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
            let signal_semas = [slot.fs_render_finished];
            let cbufs = [slot.fs_cbuf];
            let submit_info = vk::SubmitInfo::builder()
                .wait_semaphores(&wait_semas)
                .wait_dst_stage_mask(&wait_stages)
                .command_buffers(&cbufs)
                .signal_semaphores(&signal_semas)
                .build();

            slot.fs_fence.with_handle(|fence| unsafe {
                dev_submit(dev, graphics_queue, &[submit_info], fence)
            })
        });

        let fence = slot.fence();
        if let Err(e) = submitted {
            // The image_available semaphore is still pending, so this
            // swapchain can't be used again safely.
            unstrand_fence(dev, slot, graphics_queue)?;
            reclaimer.recycle_all(&fence, retired);
            return Err(e);
        }
        reclaimer.recycle_all(&fence, retired);

        let present_queue = self.t_present_queue;
        let presented = dev.with_queues(|| {
            swapchain.present(present_queue, slot.fs_render_finished, image_index)
        });
        match presented {
            Ok(()) => Ok(FrameStatus::Presented),
            Err(SquallError::OUT_OF_DATE) => {
                log::debug!("Present reported an out of date swapchain, recreating");
                self.recreate(dev)?;
                Ok(FrameStatus::Recreated)
            }
            Err(e) => Err(e),
        }
    }
}

/// vkQueueSubmit, the caller must hold the fence's host lock
unsafe fn dev_submit(
    dev: &LogicalDevice,
    queue: vk::Queue,
    submits: &[vk::SubmitInfo],
    fence: vk::Fence,
) -> Result<()> {
    dev.with_queues(|| {
        dev.dev
            .queue_submit(queue, submits, fence)
            .map_err(vk_err("vkQueueSubmit"))
    })
}

/// Signal a slot fence that was reset but never submitted
///
/// Without this the next wait on the slot would never return.
fn unstrand_fence(dev: &LogicalDevice, slot: &FrameSlot, queue: vk::Queue) -> Result<()> {
    slot.fs_fence
        .with_handle(|fence| unsafe { dev_submit(dev, queue, &[], fence) })
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        if let Err(e) = self.drain_frames() {
            log::error!("Could not wait for frames while destroying target: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::HostFence;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn ring_advances_modulo_len() {
        let mut ring = FrameRing::new(vec![10, 11, 12]);
        let seen: Vec<usize> = (0..7)
            .map(|_| ring.next_slot(|_| Ok(())).unwrap().0)
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn slot_not_reused_before_fence_signals() {
        let fences: Vec<Arc<HostFence>> = (0..2).map(|_| Arc::new(HostFence::new(true))).collect();
        let mut ring = FrameRing::new(fences.clone());

        // Frames 0 and 1 are submitted and still in flight
        for _ in 0..2 {
            let (_, slot) = ring.next_slot(|f| f.wait()).unwrap();
            slot.reset().unwrap();
        }

        // The "GPU" finishes frame 0 a bit later
        let released = Arc::new(AtomicBool::new(false));
        let gpu_fence = fences[0].clone();
        let gpu_released = released.clone();
        let gpu = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            gpu_released.store(true, Ordering::SeqCst);
            gpu_fence.signal();
        });

        // Frame 2 wants slot 0 again and has to wait for it
        let (index, slot) = ring.next_slot(|f| f.wait()).unwrap();
        assert_eq!(index, 0);
        assert!(released.load(Ordering::SeqCst));
        assert!(slot.is_signaled().unwrap());
        gpu.join().unwrap();

        // Slot 1 was never signaled
        assert!(!fences[1].is_signaled().unwrap());
    }

    #[test]
    fn failed_wait_still_advances() {
        let mut ring = FrameRing::new(vec![0, 1]);
        assert!(ring
            .next_slot(|_| Err(SquallError::OUT_OF_DATE))
            .is_err());
        assert_eq!(ring.next_slot(|_| Ok(())).unwrap().0, 1);
    }
}
