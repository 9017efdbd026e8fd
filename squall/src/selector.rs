// Physical device selection
//
// Scores the probed physical devices against what the caller needs
// and picks the best one.
//
// Austin Shafer - 2024
use ash::vk;
use bitflags::bitflags;

use crate::caps::PhysicalDevice;
use utils::log;

bitflags! {
    /// What a caller needs out of a device
    ///
    /// `PREFER_INTEGRATED` flips the type bonus so integrated GPUs win
    /// over discrete ones. `WIDE_COLOR` awards a bonus to devices that can
    /// present an HDR/wide gamut format to the presentation target.
    pub struct Requirements: u32 {
        const GRAPHICS = 1 << 0;
        const COMPUTE = 1 << 1;
        const TRANSFER = 1 << 2;
        const PREFER_INTEGRATED = 1 << 3;
        const WIDE_COLOR = 1 << 4;
    }
}

/// Bonus for the preferred device type
pub const PREFERRED_TYPE_BONUS: u64 = 200_000;
/// Bonus for the other of integrated/discrete
pub const OTHER_TYPE_BONUS: u64 = 100_000;
/// Bonus for wide color support on the presentation target
pub const WIDE_COLOR_BONUS: u64 = 1_000_000;

/// Surface formats we know how to render to
pub const SUPPORTED_FORMATS: [vk::Format; 6] = [
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::R8G8B8A8_UNORM,
    vk::Format::B8G8R8A8_SRGB,
    vk::Format::R8G8B8A8_SRGB,
    vk::Format::A2B10G10R10_UNORM_PACK32,
    vk::Format::A2R10G10B10_UNORM_PACK32,
];

/// A presentation target that devices can be checked against
///
/// This is implemented by `Surface` for a real VkSurfaceKHR.
pub trait PresentationQuery {
    /// Can any queue family of this device present to the target
    fn can_present(&self, dev: &PhysicalDevice) -> bool;

    /// The surface formats this device advertises for the target
    fn surface_formats(&self, dev: &PhysicalDevice) -> Vec<vk::SurfaceFormatKHR>;
}

/// Is this a format/colorspace pair we consider wide color
pub fn is_wide_color(fmt: &vk::SurfaceFormatKHR) -> bool {
    match (fmt.format, fmt.color_space) {
        (vk::Format::A2B10G10R10_UNORM_PACK32, vk::ColorSpaceKHR::HDR10_ST2084_EXT)
        | (vk::Format::A2R10G10B10_UNORM_PACK32, vk::ColorSpaceKHR::HDR10_ST2084_EXT)
        | (vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT) => true,
        _ => false,
    }
}

/// Check the hard requirements
///
/// Returns the advertised surface formats on success so the scoring
/// step doesn't have to ask again.
fn meets_requirements(
    dev: &PhysicalDevice,
    presentation: Option<&dyn PresentationQuery>,
    reqs: Requirements,
) -> Option<Vec<vk::SurfaceFormatKHR>> {
    if reqs.contains(Requirements::GRAPHICS) && !dev.supports_graphics() {
        log::debug!("Rejecting {}: no graphics queue", dev.pd_name);
        return None;
    }
    if reqs.contains(Requirements::COMPUTE) && !dev.supports_compute() {
        log::debug!("Rejecting {}: no compute queue", dev.pd_name);
        return None;
    }
    if !dev.supports_push_descriptors() {
        log::debug!("Rejecting {}: no VK_KHR_push_descriptor", dev.pd_name);
        return None;
    }
    if !dev.supports_dynamic_rendering() {
        log::debug!("Rejecting {}: Vulkan 1.3 is required", dev.pd_name);
        return None;
    }

    let pres = match presentation {
        Some(pres) => pres,
        None => return Some(Vec::new()),
    };

    if !pres.can_present(dev) {
        log::debug!("Rejecting {}: cannot present to target", dev.pd_name);
        return None;
    }

    let formats = pres.surface_formats(dev);
    if !formats
        .iter()
        .any(|fmt| SUPPORTED_FORMATS.contains(&fmt.format))
    {
        log::debug!("Rejecting {}: no supported surface format", dev.pd_name);
        return None;
    }

    Some(formats)
}

/// Score a device that passed `meets_requirements`
pub fn score(
    dev: &PhysicalDevice,
    formats: &[vk::SurfaceFormatKHR],
    reqs: Requirements,
) -> u64 {
    let mut score = dev.pd_max_image_dimension_2d as u64;

    let (preferred, other) = match reqs.contains(Requirements::PREFER_INTEGRATED) {
        true => (
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vk::PhysicalDeviceType::DISCRETE_GPU,
        ),
        false => (
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vk::PhysicalDeviceType::INTEGRATED_GPU,
        ),
    };
    if dev.pd_type == preferred {
        score += PREFERRED_TYPE_BONUS;
    } else if dev.pd_type == other {
        score += OTHER_TYPE_BONUS;
    }

    if reqs.contains(Requirements::WIDE_COLOR) && formats.iter().any(is_wide_color) {
        score += WIDE_COLOR_BONUS;
    }

    score
}

/// Pick the best physical device
///
/// Returns the index into `devices` of the highest scoring candidate that
/// satisfies `reqs`, or None if nothing does. Ties keep the first device
/// seen, so the result only depends on the order and contents of the list.
pub fn pick_best(
    devices: &[PhysicalDevice],
    presentation: Option<&dyn PresentationQuery>,
    reqs: Requirements,
) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;

    for (i, dev) in devices.iter().enumerate() {
        let formats = match meets_requirements(dev, presentation, reqs) {
            Some(f) => f,
            None => continue,
        };
        let s = score(dev, &formats, reqs);
        log::debug!("Device {} scored {}", dev.pd_name, s);

        if best.map_or(true, |(_, best_score)| s > best_score) {
            best = Some((i, s));
        }
    }

    if let Some((i, s)) = best {
        log::info!("Selected device {} (score {})", devices[i].pd_name, s);
    }

    best.map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUSH: &str = "VK_KHR_push_descriptor";

    fn gpu(name: &str, ty: vk::PhysicalDeviceType, dim: u32) -> PhysicalDevice {
        PhysicalDevice::from_parts(
            name,
            ty,
            dim,
            vec![vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE],
            &[PUSH],
        )
    }

    /// A presentation target with a fixed answer for each device name
    struct FakeTarget {
        presentable: Vec<&'static str>,
        formats: Vec<vk::SurfaceFormatKHR>,
    }

    impl PresentationQuery for FakeTarget {
        fn can_present(&self, dev: &PhysicalDevice) -> bool {
            self.presentable.contains(&dev.pd_name.as_str())
        }

        fn surface_formats(&self, _dev: &PhysicalDevice) -> Vec<vk::SurfaceFormatKHR> {
            self.formats.clone()
        }
    }

    fn fmt(format: vk::Format, cs: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format: format,
            color_space: cs,
        }
    }

    #[test]
    fn discrete_4096_beats_integrated_8192() {
        let devs = vec![
            gpu("A", vk::PhysicalDeviceType::DISCRETE_GPU, 4096),
            gpu("B", vk::PhysicalDeviceType::INTEGRATED_GPU, 8192),
        ];
        assert_eq!(pick_best(&devs, None, Requirements::GRAPHICS), Some(0));
        assert_eq!(score(&devs[0], &[], Requirements::GRAPHICS), 204096);
        assert_eq!(score(&devs[1], &[], Requirements::GRAPHICS), 108192);
    }

    #[test]
    fn selection_is_deterministic() {
        let devs = vec![
            gpu("A", vk::PhysicalDeviceType::DISCRETE_GPU, 8192),
            gpu("B", vk::PhysicalDeviceType::DISCRETE_GPU, 8192),
            gpu("C", vk::PhysicalDeviceType::INTEGRATED_GPU, 16384),
        ];
        let first = pick_best(&devs, None, Requirements::GRAPHICS);
        for _ in 0..10 {
            assert_eq!(pick_best(&devs, None, Requirements::GRAPHICS), first);
        }
        // equal scores keep the first one seen
        assert_eq!(first, Some(0));
    }

    #[test]
    fn larger_dimension_increases_score_and_can_win() {
        let small = gpu("A", vk::PhysicalDeviceType::DISCRETE_GPU, 4096);
        let large = gpu("B", vk::PhysicalDeviceType::DISCRETE_GPU, 4097);
        assert!(
            score(&large, &[], Requirements::GRAPHICS) > score(&small, &[], Requirements::GRAPHICS)
        );

        let devs = vec![small, large];
        assert_eq!(pick_best(&devs, None, Requirements::GRAPHICS), Some(1));
    }

    #[test]
    fn preference_flag_swaps_winner() {
        let devs = vec![
            gpu("I0", vk::PhysicalDeviceType::INTEGRATED_GPU, 8192),
            gpu("D0", vk::PhysicalDeviceType::DISCRETE_GPU, 8192),
            gpu("I1", vk::PhysicalDeviceType::INTEGRATED_GPU, 8192),
            gpu("D1", vk::PhysicalDeviceType::DISCRETE_GPU, 8192),
        ];

        let discrete = pick_best(&devs, None, Requirements::GRAPHICS).unwrap();
        assert_eq!(devs[discrete].pd_type, vk::PhysicalDeviceType::DISCRETE_GPU);

        let integrated = pick_best(
            &devs,
            None,
            Requirements::GRAPHICS | Requirements::PREFER_INTEGRATED,
        )
        .unwrap();
        assert_eq!(
            devs[integrated].pd_type,
            vk::PhysicalDeviceType::INTEGRATED_GPU
        );
    }

    #[test]
    fn missing_capability_is_never_returned() {
        let no_compute = PhysicalDevice::from_parts(
            "huge",
            vk::PhysicalDeviceType::DISCRETE_GPU,
            65536,
            vec![vk::QueueFlags::GRAPHICS],
            &[PUSH],
        );
        let no_push = PhysicalDevice::from_parts(
            "nopush",
            vk::PhysicalDeviceType::DISCRETE_GPU,
            65536,
            vec![vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE],
            &[],
        );
        let ok = gpu("small", vk::PhysicalDeviceType::CPU, 1024);

        let reqs = Requirements::GRAPHICS | Requirements::COMPUTE;
        let devs = vec![no_compute.clone(), no_push.clone(), ok];
        assert_eq!(pick_best(&devs, None, reqs), Some(2));

        let devs = vec![no_compute, no_push];
        assert_eq!(pick_best(&devs, None, reqs), None);
    }

    #[test]
    fn presentation_filters_devices() {
        let devs = vec![
            gpu("A", vk::PhysicalDeviceType::DISCRETE_GPU, 16384),
            gpu("B", vk::PhysicalDeviceType::INTEGRATED_GPU, 4096),
        ];
        let target = FakeTarget {
            presentable: vec!["B"],
            formats: vec![fmt(
                vk::Format::B8G8R8A8_UNORM,
                vk::ColorSpaceKHR::SRGB_NONLINEAR,
            )],
        };
        assert_eq!(
            pick_best(&devs, Some(&target), Requirements::GRAPHICS),
            Some(1)
        );

        // No format from the allow list means nobody qualifies
        let target = FakeTarget {
            presentable: vec!["A", "B"],
            formats: vec![fmt(
                vk::Format::R5G6B5_UNORM_PACK16,
                vk::ColorSpaceKHR::SRGB_NONLINEAR,
            )],
        };
        assert_eq!(pick_best(&devs, Some(&target), Requirements::GRAPHICS), None);
    }

    #[test]
    fn wide_color_bonus() {
        let dev = gpu("A", vk::PhysicalDeviceType::DISCRETE_GPU, 4096);
        let hdr = vec![
            fmt(
                vk::Format::B8G8R8A8_UNORM,
                vk::ColorSpaceKHR::SRGB_NONLINEAR,
            ),
            fmt(
                vk::Format::A2B10G10R10_UNORM_PACK32,
                vk::ColorSpaceKHR::HDR10_ST2084_EXT,
            ),
        ];
        let plain = score(&dev, &hdr, Requirements::GRAPHICS);
        let wide = score(&dev, &hdr, Requirements::GRAPHICS | Requirements::WIDE_COLOR);
        assert_eq!(wide, plain + WIDE_COLOR_BONUS);

        let sdr = &hdr[..1];
        assert_eq!(
            score(&dev, sdr, Requirements::GRAPHICS | Requirements::WIDE_COLOR),
            plain
        );
    }
}
