// The GPU fleet
//
// Registry of every physical device we know about, the logical device
// opened on it, and the render targets bound to each logical device.
//
// Austin Shafer - 2024
use ash::vk;

use crate::caps::{PciLocation, PhysicalDevice};
use crate::device::LogicalDevice;
use crate::error::{Result, SquallError};
use crate::gate::DeviceGate;
use crate::instance::Instance;
use crate::reclaimer::GpuResourceReclaimer;
use crate::selector::Requirements;
use crate::target::{FrameStatus, RenderTarget, Renderable, Surface, SurfaceSource, TargetOptions};
use utils::log;

/// Index of a physical device in the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub usize);

/// Handle to an attached render target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub usize);

struct FleetDevice {
    fd_physical: PhysicalDevice,
    /// Opened on first use
    fd_logical: Option<LogicalDevice>,
    fd_targets: Vec<(TargetId, RenderTarget)>,
}

impl FleetDevice {
    fn has_active_targets(&self) -> bool {
        self.fd_logical.is_some() && !self.fd_targets.is_empty()
    }

    /// Render every target on this device
    ///
    /// Each target gets its own thread, waiting on one output's frame
    /// fence doesn't hold up the others. Submission and present still
    /// take turns on the device's queues.
    fn render(&mut self, reclaimer: &GpuResourceReclaimer) -> Result<usize> {
        let dev = match self.fd_logical.as_ref() {
            Some(dev) => dev,
            None => return Ok(0),
        };

        let targets: Vec<&mut (TargetId, RenderTarget)> = self.fd_targets.iter_mut().collect();
        fan_out(targets, |entry| {
            let (id, target) = entry;
            match target.render(dev, reclaimer)? {
                FrameStatus::Presented => Ok(1),
                FrameStatus::Recreated => {
                    log::debug!("Target {:?} recreated its chain", id);
                    Ok(0)
                }
                FrameStatus::Paused => Ok(0),
            }
        })
    }
}

/// Run `work` on every item, each on its own scoped thread
///
/// A single item runs on the calling thread. Every item is run to
/// completion even if some fail, the counts are summed and the first
/// error is returned.
fn fan_out<T, F>(mut items: Vec<T>, work: F) -> Result<usize>
where
    T: Send,
    F: Fn(T) -> Result<usize> + Sync,
{
    match items.len() {
        0 => return Ok(0),
        1 => {
            if let Some(item) = items.pop() {
                return work(item);
            }
        }
        _ => {}
    }

    let work = &work;
    std::thread::scope(|s| {
        let handles: Vec<_> = items
            .drain(..)
            .map(|item| s.spawn(move || work(item)))
            .collect();

        let mut count = 0;
        let mut ret = Ok(());
        for handle in handles {
            match handle.join() {
                Ok(Ok(n)) => count += n,
                Ok(Err(e)) => {
                    log::error!("Rendering failed: {}", e);
                    if ret.is_ok() {
                        ret = Err(e);
                    }
                }
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        ret.map(|_| count)
    })
}

/// All of our GPUs and what they drive
///
/// Logical devices are owned here by value and looked up by `DeviceId`.
/// Render targets are owned by the device entry they render on. The
/// instance is passed in to the operations that need it, it has to
/// outlive the fleet.
pub struct GpuFleet {
    f_reqs: Requirements,
    f_devices: Vec<FleetDevice>,
    f_next_target: usize,
    f_reclaimer: GpuResourceReclaimer,
}

impl GpuFleet {
    /// Create an empty fleet
    ///
    /// `reqs` is used when opening logical devices.
    pub fn new(reqs: Requirements) -> std::io::Result<Self> {
        Ok(Self::with_reclaimer(reqs, GpuResourceReclaimer::new()?))
    }

    pub fn with_reclaimer(reqs: Requirements, reclaimer: GpuResourceReclaimer) -> Self {
        Self {
            f_reqs: reqs,
            f_devices: Vec::new(),
            f_next_target: 0,
            f_reclaimer: reclaimer,
        }
    }

    pub fn reclaimer(&self) -> &GpuResourceReclaimer {
        &self.f_reclaimer
    }

    /// Register a physical device
    ///
    /// Registering the same device twice is a bug in the caller.
    pub fn add_physical_device(&mut self, physical: PhysicalDevice) -> DeviceId {
        // hand built records have no handle to compare
        assert!(
            physical.pd_handle == vk::PhysicalDevice::null()
                || !self
                    .f_devices
                    .iter()
                    .any(|d| d.fd_physical.pd_handle == physical.pd_handle),
            "Physical device {} registered twice",
            physical.pd_name
        );

        log::debug!("Adding {} to the fleet", physical.pd_name);
        self.f_devices.push(FleetDevice {
            fd_physical: physical,
            fd_logical: None,
            fd_targets: Vec::new(),
        });
        DeviceId(self.f_devices.len() - 1)
    }

    pub fn physical_devices(&self) -> Vec<&PhysicalDevice> {
        self.f_devices.iter().map(|d| &d.fd_physical).collect()
    }

    pub fn physical_device(&self, id: DeviceId) -> Result<&PhysicalDevice> {
        self.f_devices
            .get(id.0)
            .map(|d| &d.fd_physical)
            .ok_or(SquallError::INVALID_DEVICE)
    }

    /// Find the device at a PCI address
    pub fn find_by_pci(&self, pci: &PciLocation) -> Option<DeviceId> {
        self.f_devices
            .iter()
            .position(|d| d.fd_physical.pd_pci.as_ref() == Some(pci))
            .map(DeviceId)
    }

    fn device_entry(&mut self, id: DeviceId) -> Result<&mut FleetDevice> {
        self.f_devices.get_mut(id.0).ok_or(SquallError::INVALID_DEVICE)
    }

    /// Open the logical device for `id` if it isn't already
    fn open(&mut self, inst: &Instance, id: DeviceId, present_support: &[bool]) -> Result<()> {
        let reqs = self.f_reqs;
        let entry = self.device_entry(id)?;
        if entry.fd_logical.is_none() {
            entry.fd_logical = Some(LogicalDevice::open(
                inst,
                &entry.fd_physical,
                reqs,
                present_support,
            )?);
        }
        Ok(())
    }

    /// Get the logical device for `id`, opening it on first use
    pub fn logical_device(&mut self, inst: &Instance, id: DeviceId) -> Result<&LogicalDevice> {
        self.open(inst, id, &[])?;
        self.device_entry(id)?
            .fd_logical
            .as_ref()
            .ok_or(SquallError::INVALID_DEVICE)
    }

    /// Is a logical device open for `id`
    pub fn is_open(&self, id: DeviceId) -> bool {
        self.f_devices
            .get(id.0)
            .map_or(false, |d| d.fd_logical.is_some())
    }

    /// Create a render target for `source` on device `id`
    pub fn attach(
        &mut self,
        inst: &Instance,
        id: DeviceId,
        source: &SurfaceSource,
        renderables: Vec<Box<dyn Renderable>>,
        gate: DeviceGate,
        options: TargetOptions,
    ) -> Result<TargetId> {
        let surface = Surface::new(inst, self.physical_device(id)?, source)?;
        let present_support = surface.present_support(self.physical_device(id)?)?;
        if !present_support.iter().any(|s| *s) {
            return Err(SquallError::SURFACE_NOT_SUPPORTED);
        }
        self.open(inst, id, &present_support)?;

        let mut options = options;
        options.wide_color &= inst.supports_wide_color();
        let target_id = TargetId(self.f_next_target);
        let entry = self.device_entry(id)?;
        let dev = entry.fd_logical.as_ref().ok_or(SquallError::INVALID_DEVICE)?;
        let target = RenderTarget::new(dev, surface, renderables, gate, options)?;
        entry.fd_targets.push((target_id, target));
        self.f_next_target += 1;

        log::info!("Attached target {:?} to device {:?}", target_id, id);
        Ok(target_id)
    }

    fn find_target(&self, target: TargetId) -> Option<(usize, usize)> {
        for (di, dev) in self.f_devices.iter().enumerate() {
            if let Some(ti) = dev.fd_targets.iter().position(|(id, _)| *id == target) {
                return Some((di, ti));
            }
        }
        None
    }

    /// Destroy a render target
    ///
    /// Waits for all of its frames. The logical device stays open even
    /// if this was its last target.
    pub fn detach(&mut self, target: TargetId) -> Result<()> {
        let (di, ti) = self.find_target(target).ok_or(SquallError::INVALID_TARGET)?;
        let (_, t) = self.f_devices[di].fd_targets.remove(ti);
        drop(t);
        log::info!("Detached target {:?}", target);
        Ok(())
    }

    /// Detach every target on device `id`
    pub fn detach_device(&mut self, id: DeviceId) -> Result<usize> {
        let entry = self.device_entry(id)?;
        let count = entry.fd_targets.len();
        entry.fd_targets.clear();
        Ok(count)
    }

    pub fn targets(&self, id: DeviceId) -> Vec<TargetId> {
        self.f_devices
            .get(id.0)
            .map(|d| d.fd_targets.iter().map(|(t, _)| *t).collect())
            .unwrap_or_default()
    }

    pub fn target(&self, target: TargetId) -> Result<&RenderTarget> {
        let (di, ti) = self.find_target(target).ok_or(SquallError::INVALID_TARGET)?;
        Ok(&self.f_devices[di].fd_targets[ti].1)
    }

    /// Change the size of a render target
    pub fn resize(&mut self, target: TargetId, extent: vk::Extent2D) -> Result<()> {
        let (di, ti) = self.find_target(target).ok_or(SquallError::INVALID_TARGET)?;
        let entry = &mut self.f_devices[di];
        let dev = entry.fd_logical.as_ref().ok_or(SquallError::INVALID_DEVICE)?;
        entry.fd_targets[ti].1.resize(dev, extent)
    }

    /// Render one frame on every target
    ///
    /// Every device with targets gets its own thread, and so does every
    /// target on it, so a stalled output can't hold up another output or
    /// another GPU. Returns the number of frames presented.
    pub fn render_all(&mut self) -> Result<usize> {
        let reclaimer = &self.f_reclaimer;
        let active: Vec<&mut FleetDevice> = self
            .f_devices
            .iter_mut()
            .filter(|d| d.has_active_targets())
            .collect();

        fan_out(active, |dev| dev.render(reclaimer))
    }

    /// Tear everything down
    ///
    /// Detaches all targets, drains the reclaimer, then closes every
    /// logical device after it goes idle. Safe to call more than once.
    pub fn shutdown(&mut self) -> Result<()> {
        for dev in self.f_devices.iter_mut() {
            dev.fd_targets.clear();
        }

        let reclaimed = self.f_reclaimer.drain()?;
        log::debug!("Reclaimed {} objects at shutdown", reclaimed);

        for dev in self.f_devices.iter_mut() {
            if let Some(mut logical) = dev.fd_logical.take() {
                logical.close()?;
            }
        }
        Ok(())
    }
}

impl Drop for GpuFleet {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Fleet shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::{Fence, HostFence};
    use crate::target::FrameRing;
    use ash::vk::Handle;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn gpu(handle: u64, pci: Option<PciLocation>) -> PhysicalDevice {
        let mut dev = PhysicalDevice::from_parts(
            &format!("gpu{}", handle),
            vk::PhysicalDeviceType::DISCRETE_GPU,
            8192,
            vec![vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE],
            &["VK_KHR_push_descriptor"],
        );
        dev.pd_handle = vk::PhysicalDevice::from_raw(handle);
        if let Some(pci) = pci {
            dev = dev.with_pci(pci);
        }
        dev
    }

    fn fleet() -> GpuFleet {
        GpuFleet::with_reclaimer(Requirements::GRAPHICS, GpuResourceReclaimer::manual())
    }

    #[test]
    fn register_and_lookup() {
        let mut fleet = fleet();
        let pci = PciLocation::new(0, 3, 0, 0);
        let a = fleet.add_physical_device(gpu(1, None));
        let b = fleet.add_physical_device(gpu(2, Some(pci)));

        assert_eq!(a, DeviceId(0));
        assert_eq!(b, DeviceId(1));
        assert_eq!(fleet.find_by_pci(&pci), Some(b));
        assert_eq!(fleet.find_by_pci(&PciLocation::new(0, 4, 0, 0)), None);
        assert_eq!(fleet.physical_devices().len(), 2);
        assert!(!fleet.is_open(a));
    }

    #[test]
    #[should_panic]
    fn duplicate_device_panics() {
        let mut fleet = fleet();
        fleet.add_physical_device(gpu(7, None));
        fleet.add_physical_device(gpu(7, None));
    }

    #[test]
    fn invalid_ids() {
        let mut fleet = fleet();
        assert!(matches!(
            fleet.physical_device(DeviceId(3)),
            Err(SquallError::INVALID_DEVICE)
        ));
        assert!(matches!(
            fleet.detach(TargetId(0)),
            Err(SquallError::INVALID_TARGET)
        ));
        assert!(matches!(
            fleet.resize(TargetId(0), vk::Extent2D::default()),
            Err(SquallError::INVALID_TARGET)
        ));
        assert!(fleet.targets(DeviceId(0)).is_empty());
    }

    #[test]
    fn idle_fleet_renders_nothing() {
        let mut fleet = fleet();
        fleet.add_physical_device(gpu(1, None));
        assert_eq!(fleet.render_all().unwrap(), 0);
        fleet.shutdown().unwrap();
        fleet.shutdown().unwrap();
    }

    #[test]
    fn stalled_output_does_not_block_its_neighbour() {
        let stuck = Arc::new(HostFence::new(false));
        let rings = vec![
            FrameRing::new(vec![stuck.clone()]),
            FrameRing::new(vec![Arc::new(HostFence::new(true))]),
        ];
        let done = Arc::new(AtomicUsize::new(0));

        let worker_done = done.clone();
        let render = std::thread::spawn(move || {
            let mut rings = rings;
            let outputs: Vec<&mut FrameRing<Arc<HostFence>>> = rings.iter_mut().collect();
            fan_out(outputs, |ring| {
                ring.next_slot(|fence| fence.wait())?;
                worker_done.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
        });

        let start = Instant::now();
        while done.load(Ordering::SeqCst) == 0 {
            assert!(start.elapsed() < Duration::from_secs(5));
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(done.load(Ordering::SeqCst), 1);

        stuck.signal();
        assert_eq!(render.join().unwrap().unwrap(), 2);
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn one_failure_does_not_skip_the_rest() {
        let ran = AtomicUsize::new(0);
        let ret = fan_out(vec![1, 2, 3], |n| {
            ran.fetch_add(1, Ordering::SeqCst);
            match n {
                2 => Err(SquallError::OUT_OF_DATE),
                n => Ok(n),
            }
        });
        assert!(matches!(ret, Err(SquallError::OUT_OF_DATE)));
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }
}
