// Physical device capabilities
//
// This module probes the available behaviors supported by each
// physical device once, so that selection and device creation can
// work off of plain data instead of re-querying the driver.
//
// Austin Shafer - 2021
use ash::extensions::khr;
use ash::vk;

use crate::error::{vk_err, Result};
use crate::instance::Instance;
use utils::log;

use std::ffi::CStr;
use std::fmt;

/// A PCI bus address
///
/// This is the key used to correlate a DRM device node with the
/// Vulkan physical device that drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciLocation {
    pub domain: u32,
    pub bus: u32,
    pub device: u32,
    pub function: u32,
}

impl PciLocation {
    pub fn new(domain: u32, bus: u32, device: u32, function: u32) -> Self {
        Self {
            domain: domain,
            bus: bus,
            device: device,
            function: function,
        }
    }

    /// Parse a sysfs PCI slot name, such as `0000:01:00.0`
    pub fn parse(slot: &str) -> Option<Self> {
        let mut parts = slot.trim().split(':');
        let domain = u32::from_str_radix(parts.next()?, 16).ok()?;
        let bus = u32::from_str_radix(parts.next()?, 16).ok()?;
        let mut devfn = parts.next()?.split('.');
        let device = u32::from_str_radix(devfn.next()?, 16).ok()?;
        let function = u32::from_str_radix(devfn.next()?, 16).ok()?;

        if parts.next().is_some() || devfn.next().is_some() {
            return None;
        }

        Some(Self::new(domain, bus, device, function))
    }
}

impl fmt::Display for PciLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

/// The cached capability set of one physical device
///
/// Immutable once probed. Everything selection and queue assignment
/// need is copied in here so they can be tested without a GPU.
#[derive(Debug, Clone)]
pub struct PhysicalDevice {
    /// The driver handle. Null for devices built by hand in tests.
    pub(crate) pd_handle: vk::PhysicalDevice,
    pub pd_name: String,
    pub pd_type: vk::PhysicalDeviceType,
    pub pd_api_version: u32,
    pub pd_max_image_dimension_2d: u32,
    /// One entry per queue family, in driver order
    pub pd_queue_families: Vec<vk::QueueFlags>,
    /// Device extension names
    pub pd_extensions: Vec<String>,
    /// Only filled in if VK_EXT_pci_bus_info is available
    pub pd_pci: Option<PciLocation>,
}

impl PhysicalDevice {
    /// Create a capability record by hand
    ///
    /// Used by selection tests and tooling that replays a probe.
    pub fn from_parts(
        name: &str,
        ty: vk::PhysicalDeviceType,
        max_image_dimension_2d: u32,
        queue_families: Vec<vk::QueueFlags>,
        extensions: &[&str],
    ) -> Self {
        Self {
            pd_handle: vk::PhysicalDevice::null(),
            pd_name: name.to_string(),
            pd_type: ty,
            pd_api_version: vk::API_VERSION_1_3,
            pd_max_image_dimension_2d: max_image_dimension_2d,
            pd_queue_families: queue_families,
            pd_extensions: extensions.iter().map(|e| e.to_string()).collect(),
            pd_pci: None,
        }
    }

    pub fn with_pci(mut self, pci: PciLocation) -> Self {
        self.pd_pci = Some(pci);
        self
    }

    pub fn handle(&self) -> vk::PhysicalDevice {
        self.pd_handle
    }

    pub fn has_extension(&self, name: &CStr) -> bool {
        let name = name.to_string_lossy();
        self.pd_extensions.iter().any(|e| *e == name)
    }

    fn has_queue_flags(&self, flags: vk::QueueFlags) -> bool {
        self.pd_queue_families.iter().any(|f| f.contains(flags))
    }

    pub fn supports_graphics(&self) -> bool {
        self.has_queue_flags(vk::QueueFlags::GRAPHICS)
    }

    pub fn supports_compute(&self) -> bool {
        self.has_queue_flags(vk::QueueFlags::COMPUTE)
    }

    /// VK_KHR_push_descriptor is mandatory for all of our devices
    pub fn supports_push_descriptors(&self) -> bool {
        self.has_extension(khr::PushDescriptor::name())
    }

    /// We record with dynamic rendering, which is core in 1.3
    pub fn supports_dynamic_rendering(&self) -> bool {
        vk::api_version_major(self.pd_api_version) > 1
            || vk::api_version_minor(self.pd_api_version) >= 3
    }

    /// Probe one physical device
    ///
    /// Queries properties, queue families and extensions. The PCI bus
    /// address is fetched through VK_EXT_pci_bus_info if the device has it.
    pub fn probe(inst: &Instance, pdev: vk::PhysicalDevice) -> Result<Self> {
        let props = unsafe { inst.inst.get_physical_device_properties(pdev) };
        let families = unsafe { inst.inst.get_physical_device_queue_family_properties(pdev) };
        let exts = unsafe {
            inst.inst
                .enumerate_device_extension_properties(pdev)
                .map_err(vk_err("vkEnumerateDeviceExtensionProperties"))?
        };

        let extensions: Vec<String> = exts
            .iter()
            .map(|e| {
                unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let mut ret = Self {
            pd_handle: pdev,
            pd_name: name,
            pd_type: props.device_type,
            pd_api_version: props.api_version,
            pd_max_image_dimension_2d: props.limits.max_image_dimension2_d,
            pd_queue_families: families.iter().map(|f| f.queue_flags).collect(),
            pd_extensions: extensions,
            pd_pci: None,
        };

        if ret.has_extension(vk::ExtPciBusInfoFn::name()) {
            let mut pci_info = vk::PhysicalDevicePCIBusInfoPropertiesEXT::default();
            let mut info = vk::PhysicalDeviceProperties2::builder().push_next(&mut pci_info);
            unsafe { inst.inst.get_physical_device_properties2(pdev, &mut info) };

            ret.pd_pci = Some(PciLocation::new(
                pci_info.pci_domain,
                pci_info.pci_bus,
                pci_info.pci_device,
                pci_info.pci_function,
            ));
        } else {
            log::info!(
                "Device {} does not support VK_EXT_pci_bus_info, it can't be matched to DRM nodes",
                ret.pd_name
            );
        }

        log::debug!(
            "Probed {} ({:?}), max dimension {}, pci {:?}",
            ret.pd_name,
            ret.pd_type,
            ret.pd_max_image_dimension_2d,
            ret.pd_pci
        );

        Ok(ret)
    }
}

/// Enumerate and probe every physical device in this instance
///
/// This is done once per enumeration pass. It may run on its own thread
/// at startup, the results are plain data.
pub fn enumerate_physical_devices(inst: &Instance) -> Result<Vec<PhysicalDevice>> {
    let pdevices = unsafe {
        inst.inst
            .enumerate_physical_devices()
            .map_err(vk_err("vkEnumeratePhysicalDevices"))?
    };

    pdevices
        .iter()
        .map(|pdev| PhysicalDevice::probe(inst, *pdev))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pci_slot() {
        let loc = PciLocation::parse("0000:03:00.1").unwrap();
        assert_eq!(loc, PciLocation::new(0, 3, 0, 1));
        assert_eq!(loc.to_string(), "0000:03:00.1");

        let loc = PciLocation::parse("0001:0a:1f.7").unwrap();
        assert_eq!(loc, PciLocation::new(1, 0xa, 0x1f, 7));
    }

    #[test]
    fn parse_pci_slot_rejects_garbage() {
        assert!(PciLocation::parse("").is_none());
        assert!(PciLocation::parse("card0").is_none());
        assert!(PciLocation::parse("0000:03:00").is_none());
        assert!(PciLocation::parse("0000:03:00.1:2").is_none());
    }

    #[test]
    fn capability_checks() {
        let dev = PhysicalDevice::from_parts(
            "test",
            vk::PhysicalDeviceType::DISCRETE_GPU,
            4096,
            vec![vk::QueueFlags::TRANSFER, vk::QueueFlags::COMPUTE],
            &["VK_KHR_push_descriptor"],
        );
        assert!(!dev.supports_graphics());
        assert!(dev.supports_compute());
        assert!(dev.supports_push_descriptors());
        assert!(dev.supports_dynamic_rendering());
    }
}
