/// VkSwapchainKHR management
///
/// The per-frame images of a render target are owned by the Vulkan
/// driver through the swapchain. This handles creating it, recreating it
/// when the surface changes, and acquiring/presenting images.
///
/// Austin Shafer - 2024
use ash::extensions::khr;
use ash::vk;

use super::surface::Surface;
use crate::error::{vk_err, Result, SquallError};
use crate::selector::{is_wide_color, SUPPORTED_FORMATS};
use utils::log;

/// Choose a surface format
///
/// Wide color formats win if they were asked for, otherwise the first
/// reported format on our allow list. A lone UNDEFINED entry means the
/// surface doesn't care and we pick our own.
pub(crate) fn select_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    wide_color: bool,
) -> Option<vk::SurfaceFormatKHR> {
    if formats.len() == 1 && formats[0].format == vk::Format::UNDEFINED {
        return Some(vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: formats[0].color_space,
        });
    }

    if wide_color {
        if let Some(fmt) = formats.iter().find(|f| is_wide_color(f)) {
            return Some(*fmt);
        }
    }

    formats
        .iter()
        .find(|f| SUPPORTED_FORMATS.contains(&f.format))
        .copied()
}

/// Pick the swapchain extent
///
/// A current extent of u32::MAX means the surface size is decided by
/// the swapchain, in which case the requested size is clamped to the
/// allowed range.
pub(crate) fn select_extent(
    caps: &vk::SurfaceCapabilitiesKHR,
    requested: vk::Extent2D,
) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    vk::Extent2D {
        width: requested
            .width
            .min(caps.max_image_extent.width)
            .max(caps.min_image_extent.width),
        height: requested
            .height
            .min(caps.max_image_extent.height)
            .max(caps.min_image_extent.height),
    }
}

/// How many images to ask for
///
/// Default to double buffering for minimal input lag. A max of zero
/// means there is no limit.
pub(crate) fn select_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = caps.min_image_count.max(2);
    match caps.max_image_count {
        0 => desired,
        max => desired.min(max),
    }
}

/// The presentation chain of one render target
pub(crate) struct Swapchain {
    sc_dev: ash::Device,
    sc_loader: khr::Swapchain,
    pub(crate) sc_swapchain: vk::SwapchainKHR,
    pub(crate) sc_images: Vec<vk::Image>,
    pub(crate) sc_views: Vec<vk::ImageView>,
    pub(crate) sc_format: vk::SurfaceFormatKHR,
    pub(crate) sc_extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain for `surface`
    ///
    /// If `old` is passed it is handed to the driver so it can recycle
    /// resources, and destroyed once the new chain exists.
    pub(crate) fn new(
        dev: &ash::Device,
        loader: &khr::Swapchain,
        pdev: vk::PhysicalDevice,
        surface: &Surface,
        requested: vk::Extent2D,
        wide_color: bool,
        old: Option<Swapchain>,
    ) -> Result<Self> {
        let caps = surface.capabilities(pdev)?;
        let format = select_surface_format(&surface.formats(pdev)?, wide_color)
            .ok_or(SquallError::SURFACE_NOT_SUPPORTED)?;
        let extent = select_extent(&caps, surface.fixed_extent().unwrap_or(requested));

        // the best mode for presentation is FIFO (with triple buffering)
        // as this is recommended by the samsung developer page, which
        // I am *assuming* is a good reference for low power apps
        let mode = surface
            .present_modes(pdev)?
            .iter()
            .cloned()
            .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
            // fallback to FIFO if the mailbox mode is not available
            .unwrap_or(vk::PresentModeKHR::FIFO);

        let transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let old_handle = old
            .as_ref()
            .map(|o| o.sc_swapchain)
            .unwrap_or(vk::SwapchainKHR::null());

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.s_surface)
            .min_image_count(select_image_count(&caps))
            .image_color_space(format.color_space)
            .image_format(format.format)
            .image_extent(extent)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(mode)
            .clipped(true)
            .image_array_layers(1)
            .old_swapchain(old_handle);

        let swapchain = unsafe {
            loader
                .create_swapchain(&create_info, None)
                .map_err(vk_err("vkCreateSwapchainKHR"))?
        };
        // Now that we recreated the swapchain destroy the old one
        drop(old);

        let mut ret = Self {
            sc_dev: dev.clone(),
            sc_loader: loader.clone(),
            sc_swapchain: swapchain,
            sc_images: Vec::new(),
            sc_views: Vec::new(),
            sc_format: format,
            sc_extent: extent,
        };
        ret.create_views()?;

        log::debug!(
            "Created swapchain {:?} with {} images, format {:?}, mode {:?}",
            extent,
            ret.sc_images.len(),
            format,
            mode
        );
        Ok(ret)
    }

    /// Get the swapchain images and create views for them
    fn create_views(&mut self) -> Result<()> {
        self.sc_images = unsafe {
            self.sc_loader
                .get_swapchain_images(self.sc_swapchain)
                .map_err(vk_err("vkGetSwapchainImagesKHR"))?
        };

        for image in self.sc_images.iter() {
            let create_info = vk::ImageViewCreateInfo::builder()
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.sc_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::R,
                    g: vk::ComponentSwizzle::G,
                    b: vk::ComponentSwizzle::B,
                    a: vk::ComponentSwizzle::A,
                })
                // this view pertains to the entire image
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image(*image);

            let view = unsafe {
                self.sc_dev
                    .create_image_view(&create_info, None)
                    .map_err(vk_err("vkCreateImageView"))?
            };
            self.sc_views.push(view);
        }

        Ok(())
    }

    /// Acquire the next image, signaling `sema` when it is ready
    ///
    /// NOT_READY and TIMEOUT are retried, some drivers hand those back
    /// even with an infinite timeout. An out of date chain is reported as
    /// OUT_OF_DATE, a suboptimal one is caught at present time.
    pub(crate) fn acquire(&self, sema: vk::Semaphore) -> Result<u32> {
        loop {
            match unsafe {
                self.sc_loader.acquire_next_image(
                    self.sc_swapchain,
                    u64::MAX,
                    sema,
                    vk::Fence::null(),
                )
            } {
                Ok((index, false)) => return Ok(index),
                // The semaphore will still be signaled, so we can't just drop
                // this image on the floor. Render it and recreate on present.
                Ok((index, true)) => return Ok(index),
                Err(vk::Result::NOT_READY) | Err(vk::Result::TIMEOUT) => {
                    log::debug!("vkAcquireNextImageKHR: image not ready, retrying");
                    continue;
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::SUBOPTIMAL_KHR) => {
                    return Err(SquallError::OUT_OF_DATE)
                }
                Err(e) => return Err(SquallError::VK_CALL_FAILED("vkAcquireNextImageKHR", e)),
            }
        }
    }

    /// Present image `index` once `wait` signals
    pub(crate) fn present(&self, queue: vk::Queue, wait: vk::Semaphore, index: u32) -> Result<()> {
        let wait_semas = [wait];
        let swapchains = [self.sc_swapchain];
        let indices = [index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semas)
            .swapchains(&swapchains)
            .image_indices(&indices);

        match unsafe { self.sc_loader.queue_present(queue, &info) } {
            Ok(false) => Ok(()),
            Ok(true) => Err(SquallError::OUT_OF_DATE),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::SUBOPTIMAL_KHR) => {
                Err(SquallError::OUT_OF_DATE)
            }
            Err(e) => Err(SquallError::VK_CALL_FAILED("vkQueuePresentKHR", e)),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for view in self.sc_views.drain(..) {
                self.sc_dev.destroy_image_view(view, None);
            }
            self.sc_loader.destroy_swapchain(self.sc_swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(format: vk::Format, cs: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format: format,
            color_space: cs,
        }
    }

    #[test]
    fn format_selection() {
        let srgb = vk::ColorSpaceKHR::SRGB_NONLINEAR;
        let formats = [
            fmt(vk::Format::R5G6B5_UNORM_PACK16, srgb),
            fmt(vk::Format::R8G8B8A8_SRGB, srgb),
            fmt(
                vk::Format::A2B10G10R10_UNORM_PACK32,
                vk::ColorSpaceKHR::HDR10_ST2084_EXT,
            ),
        ];

        assert_eq!(
            select_surface_format(&formats, false).unwrap().format,
            vk::Format::R8G8B8A8_SRGB
        );
        assert_eq!(
            select_surface_format(&formats, true).unwrap().color_space,
            vk::ColorSpaceKHR::HDR10_ST2084_EXT
        );

        let undefined = [fmt(vk::Format::UNDEFINED, srgb)];
        assert_eq!(
            select_surface_format(&undefined, false).unwrap().format,
            vk::Format::B8G8R8A8_UNORM
        );

        assert!(select_surface_format(&formats[..1], true).is_none());
    }

    #[test]
    fn extent_and_image_count() {
        let mut caps = vk::SurfaceCapabilitiesKHR::default();
        caps.current_extent = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        caps.min_image_count = 3;
        caps.max_image_count = 0;

        let req = vk::Extent2D {
            width: 640,
            height: 480,
        };
        assert_eq!(select_extent(&caps, req).width, 1920);
        assert_eq!(select_image_count(&caps), 3);

        caps.current_extent = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        caps.min_image_extent = vk::Extent2D {
            width: 1,
            height: 1,
        };
        caps.max_image_extent = vk::Extent2D {
            width: 600,
            height: 4096,
        };
        caps.min_image_count = 1;
        caps.max_image_count = 2;
        let e = select_extent(&caps, req);
        assert_eq!((e.width, e.height), (600, 480));
        assert_eq!(select_image_count(&caps), 2);
    }
}
