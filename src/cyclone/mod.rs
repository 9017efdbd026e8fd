// The Cyclone display core
//
// This wires the pieces together: the seat session, the display
// devices it hands us, and the GPU fleet that presents to them.
//
// Austin Shafer - 2024
pub mod config;
mod enumerate;
mod session;

use config::{Backend, Config};
use enumerate::{
    resolve_physical_devices, scan_drm_nodes, DisplayEnumerator, DrmProbe, ManagedDevice,
};
use session::logind::LogindBus;
use session::{Listener, PauseKind, SessionBackend, SessionNotice};
use squall::{
    enumerate_physical_devices, pick_best, DeviceId, DisplayMode, GpuFleet, Instance,
    InstanceInfo, SquallError, SurfaceSource, TargetOptions,
};
use utils::{anyhow, bail, log, Context, Result};

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// How long to sleep when nothing was presented
const IDLE_SLEEP: Duration = Duration::from_millis(16);

/// The display core
///
/// Fields are dropped in order, so targets go before the devices they
/// present to, and the session is released before the instance goes.
pub struct Cyclone {
    c_fleet: GpuFleet,
    c_devices: Vec<ManagedDevice>,
    c_listener: Option<Listener>,
    c_session: Option<SessionBackend>,
    /// Devices the session reported as gone, handled in the main loop
    c_removed: Arc<Mutex<Vec<(u32, u32)>>>,
    c_config: Config,
    c_frames: u64,
    c_instance: Arc<Instance>,
}

impl Cyclone {
    /// Bring everything up
    ///
    /// This is a cooler way of saying new
    pub fn spin() -> Result<Self> {
        let config = Config::from_env();
        let instance = Arc::new(
            Instance::new(&InstanceInfo {
                enable_validation: config.validation,
            })
            .context("Could not create the Vulkan instance")?,
        );

        // Probing every GPU can take a while, do it while we talk to
        // logind and udev
        let probe_inst = instance.clone();
        let probe = thread::Builder::new()
            .name("cyclone-probe".to_string())
            .spawn(move || enumerate_physical_devices(&probe_inst))
            .context("Could not spawn the device probe thread")?;

        let (session, devices) = match &config.backend {
            Backend::Drm => {
                if !instance.supports_drm_display() {
                    bail!("The Vulkan driver can't drive DRM displays");
                }
                let bus = LogindBus::connect().context("Could not connect to logind")?;
                let mut session = SessionBackend::new(Box::new(bus), config.session_id.as_deref())
                    .context("Could not take control of the session")?;
                let nodes = scan_drm_nodes().context("Could not scan for DRM devices")?;
                let devices = DisplayEnumerator::new(DrmProbe).enumerate(&mut session, &nodes);
                log::info!(
                    "Found {} display devices on {}",
                    devices.len(),
                    session.seat()
                );
                (Some(session), devices)
            }
            Backend::Nested { display } => {
                if !instance.supports_wayland() {
                    bail!("The Vulkan driver can't present to Wayland surfaces");
                }
                log::info!("Running nested inside {}", display);
                (None, Vec::new())
            }
        };

        let physical = probe
            .join()
            .map_err(|_| anyhow!("The device probe thread panicked"))?
            .context("Could not probe the physical devices")?;
        let reqs = instance.usable_requirements(config.requirements());
        let best = pick_best(&physical, None, reqs);

        let mut fleet = GpuFleet::new(reqs).context("Could not start the reclaimer")?;
        for pd in physical.into_iter() {
            fleet.add_physical_device(pd);
        }

        let mut ret = Self {
            c_fleet: fleet,
            c_devices: Vec::new(),
            c_listener: None,
            c_session: session,
            c_removed: Arc::new(Mutex::new(Vec::new())),
            c_config: config,
            c_frames: 0,
            c_instance: instance,
        };

        match ret.c_config.backend {
            Backend::Drm => ret.bind_outputs(devices)?,
            Backend::Nested { .. } => {
                // The embedder attaches its own surfaces, we only need
                // a device ready for them
                let id = DeviceId(best.ok_or(SquallError::NO_SUITABLE_DEVICE)?);
                let dev = ret
                    .c_fleet
                    .logical_device(&ret.c_instance, id)
                    .context("Could not open the rendering device")?;
                log::info!("Rendering on {}", dev.physical().pd_name);
            }
        }

        if let Some(name) = ret.c_config.socket_name.as_deref() {
            config::advertise_display(name);
        }

        Ok(ret)
    }

    fn target_options(&self) -> TargetOptions {
        TargetOptions {
            wide_color: self.c_config.wide_color && self.c_instance.supports_wide_color(),
            ..TargetOptions::default()
        }
    }

    /// Attach a render target to every output we can drive
    fn bind_outputs(&mut self, devices: Vec<ManagedDevice>) -> Result<()> {
        let options = self.target_options();
        let session = match self.c_session.as_mut() {
            Some(session) => session,
            None => return Ok(()),
        };

        let devices = resolve_physical_devices(devices, &self.c_fleet, session);
        let mut attached = 0;
        for dev in devices.iter() {
            let id = match dev.md_physical {
                Some(id) => id,
                None => continue,
            };
            if dev.is_paused() {
                log::info!("{} starts out paused", dev.md_node.sysname);
            }

            for output in dev.md_outputs.iter() {
                // Vulkan reports refresh in its own precision, match any rate
                let mode = output.startup_mode().map(|m| DisplayMode {
                    width: m.width,
                    height: m.height,
                    refresh_mhz: 0,
                });
                let source = SurfaceSource::Drm {
                    drm_fd: dev.md_fd.raw(),
                    connector_id: output.connector_id,
                    mode: mode,
                };

                match self.c_fleet.attach(
                    &self.c_instance,
                    id,
                    &source,
                    Vec::new(),
                    dev.md_gate.clone(),
                    options,
                ) {
                    Ok(target) => {
                        log::info!("Driving {} as {:?}", output.name, target);
                        attached += 1;
                    }
                    Err(e @ SquallError::DISPLAY_NOT_FOUND)
                    | Err(e @ SquallError::SURFACE_NOT_SUPPORTED)
                    | Err(e @ SquallError::MISSING_EXTENSION(_)) => {
                        log::error!("Skipping output {}: {}", output.name, e);
                    }
                    Err(e) => {
                        return Err(e).context(format!("Could not attach output {}", output.name))
                    }
                }
            }
        }
        self.c_devices = devices;

        if attached == 0 {
            bail!("None of the connected outputs could be driven");
        }

        // Gone devices have to be detached from the main loop
        let removed = self.c_removed.clone();
        self.c_listener = self.c_session.as_ref().map(|session| {
            session.listen(move |notice| {
                if let SessionNotice::Paused {
                    major,
                    minor,
                    kind: PauseKind::Gone,
                } = *notice
                {
                    removed
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((major, minor));
                }
            })
        });

        Ok(())
    }

    /// Drop the targets of devices that were unplugged
    fn handle_removed(&mut self) -> Result<()> {
        let gone: Vec<(u32, u32)> = std::mem::take(
            &mut *self
                .c_removed
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        for (major, minor) in gone {
            let pos = match self
                .c_devices
                .iter()
                .position(|d| d.md_node.major == major && d.md_node.minor == minor)
            {
                Some(pos) => pos,
                None => continue,
            };
            let dev = self.c_devices.remove(pos);
            if let Some(id) = dev.md_physical {
                let count = self.c_fleet.detach_device(id)?;
                log::info!(
                    "{} was removed, detached {} targets",
                    dev.md_node.sysname,
                    count
                );
            }

            if self.c_devices.is_empty() {
                bail!("Every display device is gone");
            }
        }

        Ok(())
    }

    /// This is the main loop of the entire system
    ///
    /// Runs until an error, or until the configured frame limit.
    pub fn run_forever(&mut self) -> Result<()> {
        loop {
            if let Some(session) = self.c_session.as_mut() {
                session.dispatch().context("Lost our session")?;
            }
            self.handle_removed()?;

            let presented = self.c_fleet.render_all().context("Rendering failed")?;
            if presented == 0 {
                // Everything is paused, or there is nothing to draw
                thread::sleep(IDLE_SLEEP);
            }

            self.c_frames += 1;
            if let Some(limit) = self.c_config.frame_limit {
                if self.c_frames >= limit {
                    log::info!("Stopping after {} frames", self.c_frames);
                    break;
                }
            }
        }

        self.shutdown()
    }

    /// Tear down in order
    ///
    /// GPU work first, then the devices are handed back to the session.
    /// Safe to call more than once.
    pub fn shutdown(&mut self) -> Result<()> {
        self.c_fleet
            .shutdown()
            .context("Could not shut down the GPU fleet")?;
        self.c_listener = None;
        self.c_devices.clear();
        if let Some(mut session) = self.c_session.take() {
            session.teardown();
        }
        Ok(())
    }
}

impl Drop for Cyclone {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Shutdown failed: {:?}", e);
        }
    }
}
