// Vulkan rendering instance
//
// This holds all of the common instance code for the Vulkan context

use ash::extensions::{ext, khr};
use ash::{vk, Entry};

use crate::error::{vk_err, Result, SquallError};
use crate::selector::Requirements;
use utils::log;

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};

// this happy little debug callback is from the ash examples
// all it does is print any errors/warnings thrown.
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let message = match p_callback_data.as_ref() {
        Some(data) if !data.p_message.is_null() => {
            CStr::from_ptr(data.p_message).to_string_lossy().into_owned()
        }
        _ => String::from("<no message>"),
    };

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[VK][{:?}] {}", message_types, message);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[VK][{:?}] {}", message_types, message);
    } else {
        log::debug!("[VK][{:?}] {}", message_types, message);
    }
    vk::FALSE
}

/// Instance creation parameters
#[derive(Debug, Clone, Default)]
pub struct InstanceInfo {
    /// Enable VK_LAYER_KHRONOS_validation and the debug messenger
    pub enable_validation: bool,
}

/// A Vulkan Instance
///
/// This holds our basic vulkan session data. We use this to create
/// any devices and such which squall will use internally to render.
/// It also records which of the optional presentation extensions
/// could actually be enabled, so surface creation can fail cleanly
/// instead of calling into a missing entry point.
pub struct Instance {
    /// debug callback sugar mentioned earlier
    debug: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    /// the entry just loads function pointers from the dynamic library
    /// I am calling it a loader, because that's what it does
    pub(crate) loader: Entry,
    /// the big vulkan instance.
    pub(crate) inst: ash::Instance,

    /// VK_EXT_acquire_drm_display is enabled
    pub(crate) i_has_drm_display: bool,
    /// VK_KHR_wayland_surface is enabled
    pub(crate) i_has_wayland: bool,
    /// VK_EXT_swapchain_colorspace is enabled, needed for HDR formats
    pub(crate) i_has_colorspace: bool,
}

/// Helper for matching a C extension name against what the loader reports
fn has_extension(available: &[vk::ExtensionProperties], name: &CStr) -> bool {
    available
        .iter()
        .any(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) } == name)
}

impl Instance {
    /// Creates a new debug reporter and registers our function
    /// for debug callbacks so we get nice error messages
    fn setup_debug(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let dr_loader = ext::DebugUtils::new(entry, instance);
        let callback = unsafe {
            dr_loader
                .create_debug_utils_messenger(&debug_info, None)
                .map_err(vk_err("vkCreateDebugUtilsMessengerEXT"))?
        };
        Ok((dr_loader, callback))
    }

    /// Create a vkInstance
    ///
    /// Every presentation extension we know about is enabled if the loader
    /// has it. A machine without VK_KHR_wayland_surface can still drive
    /// DRM outputs and vice versa.
    pub fn new(info: &InstanceInfo) -> Result<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| SquallError::VK_LOADING_FAILED(e.to_string()))?;
        let app_name = CString::new("Cyclone").unwrap_or_default();

        let available = entry
            .enumerate_instance_extension_properties(None)
            .map_err(vk_err("vkEnumerateInstanceExtensionProperties"))?;

        let mut extension_names: Vec<*const c_char> = vec![khr::Surface::name().as_ptr()];
        let mut enable = |name: &'static CStr| -> bool {
            match has_extension(&available, name) {
                true => {
                    extension_names.push(name.as_ptr());
                    true
                }
                false => {
                    log::info!("Instance extension {:?} is not available", name);
                    false
                }
            }
        };

        let has_display = enable(khr::Display::name());
        let has_drm_display = has_display
            && enable(vk::ExtDirectModeDisplayFn::name())
            && enable(vk::ExtAcquireDrmDisplayFn::name());
        let has_wayland = enable(khr::WaylandSurface::name());
        let has_colorspace = enable(vk::ExtSwapchainColorspaceFn::name());
        let has_debug = info.enable_validation && enable(ext::DebugUtils::name());

        let validation = CString::new("VK_LAYER_KHRONOS_validation").unwrap_or_default();
        let layer_names_raw: Vec<*const c_char> = match info.enable_validation {
            true => vec![validation.as_ptr()],
            false => Vec::new(),
        };

        let appinfo = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(&app_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_3);

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_layer_names(&layer_names_raw)
            .enabled_extension_names(&extension_names);

        let instance: ash::Instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .map_err(vk_err("vkCreateInstance"))?
        };

        let debug = match has_debug {
            true => Some(Self::setup_debug(&entry, &instance)?),
            false => None,
        };

        Ok(Self {
            loader: entry,
            inst: instance,
            debug: debug,
            i_has_drm_display: has_drm_display,
            i_has_wayland: has_wayland,
            i_has_colorspace: has_colorspace,
        })
    }

    /// Does this instance allow presenting to DRM connectors
    pub fn supports_drm_display(&self) -> bool {
        self.i_has_drm_display
    }

    /// Does this instance allow nested presentation to a Wayland surface
    pub fn supports_wayland(&self) -> bool {
        self.i_has_wayland
    }

    /// Can swapchains on this instance use HDR color spaces
    pub fn supports_wide_color(&self) -> bool {
        self.i_has_colorspace
    }

    /// Drop the requirements this instance can never satisfy
    pub fn usable_requirements(&self, reqs: Requirements) -> Requirements {
        usable_requirements(reqs, self.i_has_colorspace)
    }
}

/// Wide color formats other than sRGB need VK_EXT_swapchain_colorspace
fn usable_requirements(mut reqs: Requirements, has_colorspace: bool) -> Requirements {
    if reqs.contains(Requirements::WIDE_COLOR) && !has_colorspace {
        log::info!("VK_EXT_swapchain_colorspace is missing, not asking for wide color");
        reqs.remove(Requirements::WIDE_COLOR);
    }
    reqs
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, callback)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(callback, None);
            }
            self.inst.destroy_instance(None);
        }
    }
}
