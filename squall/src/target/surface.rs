// Presentation surfaces
//
// Austin Shafer - 2024
use ash::extensions::khr;
use ash::vk;

use crate::caps::PhysicalDevice;
use crate::error::{vk_err, Result, SquallError};
use crate::instance::Instance;
use crate::selector::PresentationQuery;
use utils::log;

use std::os::raw::c_void;
use std::os::unix::io::RawFd;

/// A requested display mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    /// Refresh rate in millihertz, zero matches anything
    pub refresh_mhz: u32,
}

/// Where a render target presents to
pub enum SurfaceSource {
    /// A DRM connector, driven through VK_EXT_acquire_drm_display
    Drm {
        drm_fd: RawFd,
        connector_id: u32,
        /// None picks the first mode the driver reports
        mode: Option<DisplayMode>,
    },
    /// A wl_surface owned by the embedder, for running nested
    Wayland {
        display: *mut c_void,
        surface: *mut c_void,
    },
}

impl std::fmt::Debug for SurfaceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SurfaceSource::Drm {
                drm_fd,
                connector_id,
                mode,
            } => write!(
                f,
                "Drm(fd {}, connector {}, mode {:?})",
                drm_fd, connector_id, mode
            ),
            SurfaceSource::Wayland { .. } => write!(f, "Wayland"),
        }
    }
}

/// Pick the display mode to use out of what the driver reports
fn choose_mode(
    modes: &[vk::DisplayModePropertiesKHR],
    want: Option<DisplayMode>,
) -> Option<vk::DisplayModePropertiesKHR> {
    let want = match want {
        Some(w) => w,
        None => return modes.first().copied(),
    };

    modes
        .iter()
        .find(|m| {
            let p = &m.parameters;
            p.visible_region.width == want.width
                && p.visible_region.height == want.height
                && (want.refresh_mhz == 0 || p.refresh_rate == want.refresh_mhz)
        })
        .copied()
}

/// A VkSurfaceKHR
///
/// DRM surfaces are tied to the physical device that acquired the
/// display, nested surfaces can be presented by any device that supports
/// them.
pub struct Surface {
    s_loader: khr::Surface,
    pub(crate) s_surface: vk::SurfaceKHR,
    /// The fixed size of a display plane surface
    s_extent: Option<vk::Extent2D>,
}

impl Surface {
    pub fn new(inst: &Instance, physical: &PhysicalDevice, source: &SurfaceSource) -> Result<Self> {
        let loader = khr::Surface::new(&inst.loader, &inst.inst);
        let (surface, extent) = match source {
            SurfaceSource::Drm {
                drm_fd,
                connector_id,
                mode,
            } => Self::create_drm_surface(inst, physical, *drm_fd, *connector_id, *mode)?,
            SurfaceSource::Wayland { display, surface } => {
                (Self::create_wayland_surface(inst, *display, *surface)?, None)
            }
        };

        log::debug!("Created surface for {:?} on {}", source, physical.pd_name);
        Ok(Self {
            s_loader: loader,
            s_surface: surface,
            s_extent: extent,
        })
    }

    fn create_wayland_surface(
        inst: &Instance,
        display: *mut c_void,
        surface: *mut c_void,
    ) -> Result<vk::SurfaceKHR> {
        if !inst.i_has_wayland {
            return Err(SquallError::MISSING_EXTENSION("VK_KHR_wayland_surface"));
        }
        let loader = khr::WaylandSurface::new(&inst.loader, &inst.inst);
        let info = vk::WaylandSurfaceCreateInfoKHR::builder()
            .display(display as *mut vk::wl_display)
            .surface(surface as *mut vk::wl_surface);

        unsafe {
            loader
                .create_wayland_surface(&info, None)
                .map_err(vk_err("vkCreateWaylandSurfaceKHR"))
        }
    }

    /// Take over a DRM connector and build a display plane surface on it
    fn create_drm_surface(
        inst: &Instance,
        physical: &PhysicalDevice,
        drm_fd: RawFd,
        connector_id: u32,
        want: Option<DisplayMode>,
    ) -> Result<(vk::SurfaceKHR, Option<vk::Extent2D>)> {
        if !inst.i_has_drm_display {
            return Err(SquallError::MISSING_EXTENSION("VK_EXT_acquire_drm_display"));
        }
        let pdev = physical.pd_handle;
        let acquire_fn = vk::ExtAcquireDrmDisplayFn::load(|name| unsafe {
            std::mem::transmute(
                inst.loader
                    .get_instance_proc_addr(inst.inst.handle(), name.as_ptr()),
            )
        });
        let d_loader = khr::Display::new(&inst.loader, &inst.inst);

        unsafe {
            let mut display = vk::DisplayKHR::null();
            (acquire_fn.get_drm_display_ext)(pdev, drm_fd, connector_id, &mut display)
                .result()
                .map_err(vk_err("vkGetDrmDisplayEXT"))?;
            if display == vk::DisplayKHR::null() {
                return Err(SquallError::DISPLAY_NOT_FOUND);
            }
            (acquire_fn.acquire_drm_display_ext)(pdev, drm_fd, display)
                .result()
                .map_err(vk_err("vkAcquireDrmDisplayEXT"))?;

            // The available modes for the display. This holds
            // the resolution.
            let mode_props = d_loader
                .get_display_mode_properties(pdev, display)
                .map_err(vk_err("vkGetDisplayModePropertiesKHR"))?;
            let mode_props = choose_mode(&mode_props, want).ok_or(SquallError::DISPLAY_NOT_FOUND)?;

            // Find a plane that can scan out this display and isn't
            // already in use by another one
            let plane_props = d_loader
                .get_physical_device_display_plane_properties(pdev)
                .map_err(vk_err("vkGetPhysicalDeviceDisplayPlanePropertiesKHR"))?;
            let mut plane_index = None;
            for (i, p) in plane_props.iter().enumerate() {
                if p.current_display != vk::DisplayKHR::null() && p.current_display != display {
                    continue;
                }
                let supported = d_loader
                    .get_display_plane_supported_displays(pdev, i as u32)
                    .map_err(vk_err("vkGetDisplayPlaneSupportedDisplaysKHR"))?;
                if supported.contains(&display) {
                    plane_index = Some(i as u32);
                    break;
                }
            }
            let plane_index = plane_index.ok_or(SquallError::DISPLAY_NOT_FOUND)?;

            let surf_info = vk::DisplaySurfaceCreateInfoKHR::builder()
                .display_mode(mode_props.display_mode)
                .plane_index(plane_index)
                .transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
                .alpha_mode(vk::DisplayPlaneAlphaFlagsKHR::OPAQUE)
                .image_extent(mode_props.parameters.visible_region);

            let surface = d_loader
                .create_display_plane_surface(&surf_info, None)
                .map_err(vk_err("vkCreateDisplayPlaneSurfaceKHR"))?;

            log::info!(
                "Acquired connector {} with mode {:?} on plane {}",
                connector_id,
                mode_props.parameters,
                plane_index
            );

            Ok((surface, Some(mode_props.parameters.visible_region)))
        }
    }

    /// Which queue families of `physical` can present to this surface
    pub fn present_support(&self, physical: &PhysicalDevice) -> Result<Vec<bool>> {
        (0..physical.pd_queue_families.len() as u32)
            .map(|i| self.family_supports(physical.pd_handle, i))
            .collect()
    }

    pub(crate) fn family_supports(&self, pdev: vk::PhysicalDevice, family: u32) -> Result<bool> {
        unsafe {
            self.s_loader
                .get_physical_device_surface_support(pdev, family, self.s_surface)
                .map_err(vk_err("vkGetPhysicalDeviceSurfaceSupportKHR"))
        }
    }

    pub(crate) fn capabilities(
        &self,
        pdev: vk::PhysicalDevice,
    ) -> Result<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.s_loader
                .get_physical_device_surface_capabilities(pdev, self.s_surface)
                .map_err(vk_err("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))
        }
    }

    pub(crate) fn formats(&self, pdev: vk::PhysicalDevice) -> Result<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.s_loader
                .get_physical_device_surface_formats(pdev, self.s_surface)
                .map_err(vk_err("vkGetPhysicalDeviceSurfaceFormatsKHR"))
        }
    }

    pub(crate) fn present_modes(
        &self,
        pdev: vk::PhysicalDevice,
    ) -> Result<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.s_loader
                .get_physical_device_surface_present_modes(pdev, self.s_surface)
                .map_err(vk_err("vkGetPhysicalDeviceSurfacePresentModesKHR"))
        }
    }

    /// The fixed extent of this surface, if it has one
    pub fn fixed_extent(&self) -> Option<vk::Extent2D> {
        self.s_extent
    }
}

impl PresentationQuery for Surface {
    fn can_present(&self, dev: &PhysicalDevice) -> bool {
        match self.present_support(dev) {
            Ok(support) => support.iter().any(|s| *s),
            Err(e) => {
                log::debug!("Surface support query failed on {}: {}", dev.pd_name, e);
                false
            }
        }
    }

    fn surface_formats(&self, dev: &PhysicalDevice) -> Vec<vk::SurfaceFormatKHR> {
        self.formats(dev.pd_handle).unwrap_or_default()
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.s_loader.destroy_surface(self.s_surface, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(w: u32, h: u32, refresh: u32) -> vk::DisplayModePropertiesKHR {
        vk::DisplayModePropertiesKHR {
            display_mode: vk::DisplayModeKHR::null(),
            parameters: vk::DisplayModeParametersKHR {
                visible_region: vk::Extent2D {
                    width: w,
                    height: h,
                },
                refresh_rate: refresh,
            },
        }
    }

    #[test]
    fn mode_selection() {
        let modes = [
            mode(3840, 2160, 60000),
            mode(1920, 1080, 144000),
            mode(1920, 1080, 60000),
        ];

        let first = choose_mode(&modes, None).unwrap();
        assert_eq!(first.parameters.visible_region.width, 3840);

        let want = DisplayMode {
            width: 1920,
            height: 1080,
            refresh_mhz: 60000,
        };
        let m = choose_mode(&modes, Some(want)).unwrap();
        assert_eq!(m.parameters.refresh_rate, 60000);

        let any_rate = DisplayMode {
            refresh_mhz: 0,
            ..want
        };
        let m = choose_mode(&modes, Some(any_rate)).unwrap();
        assert_eq!(m.parameters.refresh_rate, 144000);

        let missing = DisplayMode {
            width: 1280,
            height: 720,
            refresh_mhz: 0,
        };
        assert!(choose_mode(&modes, Some(missing)).is_none());
        assert!(choose_mode(&[], None).is_none());
    }
}
