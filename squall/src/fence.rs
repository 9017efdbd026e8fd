// GPU to CPU synchronization
//
// Austin Shafer - 2024
use ash::vk;

use crate::error::{vk_err, Result};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, TryLockError};

/// Unique ids for fences, used as the key for garbage batches
static NEXT_FENCE_ID: AtomicU64 = AtomicU64::new(1);

/// Hand out a process-unique fence id
pub fn next_fence_id() -> u64 {
    NEXT_FENCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Something the GPU signals when submitted work completes
///
/// The reclaimer only ever polls fences with `is_signaled`, which must
/// never block. `wait` blocks until the fence signals and is used by
/// render targets before reusing a frame slot and by shutdown.
pub trait Fence: Send + Sync {
    /// Stable identifier for this fence
    fn id(&self) -> u64;

    /// Zero timeout poll
    fn is_signaled(&self) -> Result<bool>;

    /// Wait without a timeout
    fn wait(&self) -> Result<()>;

    /// Return the fence to the unsignaled state
    fn reset(&self) -> Result<()>;
}

/// A vkFence owned by a frame slot
///
/// Vulkan requires host access to a fence to be externally synchronized
/// when resetting it or submitting with it. The render thread and the
/// reclaimer thread both touch these, so every access goes through
/// `f_host`. Polls use a try-lock and report "not yet" if the render
/// thread is currently holding it.
pub struct GpuFence {
    f_id: u64,
    f_dev: ash::Device,
    f_fence: vk::Fence,
    f_host: Mutex<()>,
}

impl GpuFence {
    /// Create a new fence. `signaled` controls the initial state, frame
    /// slots start signaled so the first wait returns immediately.
    pub fn new(dev: &ash::Device, signaled: bool) -> Result<Self> {
        let flags = match signaled {
            true => vk::FenceCreateFlags::SIGNALED,
            false => vk::FenceCreateFlags::empty(),
        };
        let fence = unsafe {
            dev.create_fence(&vk::FenceCreateInfo::builder().flags(flags), None)
                .map_err(vk_err("vkCreateFence"))?
        };

        Ok(Self {
            f_id: next_fence_id(),
            f_dev: dev.clone(),
            f_fence: fence,
            f_host: Mutex::new(()),
        })
    }

    /// Run `f` with exclusive host access to the raw fence
    ///
    /// Queue submission has to go through here since it writes the fence.
    pub(crate) fn with_handle<T, F: FnOnce(vk::Fence) -> T>(&self, f: F) -> T {
        let _guard = self.f_host.lock().unwrap_or_else(|e| e.into_inner());
        f(self.f_fence)
    }
}

impl Fence for GpuFence {
    fn id(&self) -> u64 {
        self.f_id
    }

    fn is_signaled(&self) -> Result<bool> {
        let _guard = match self.f_host.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return Ok(false),
        };
        unsafe {
            self.f_dev
                .get_fence_status(self.f_fence)
                .map_err(vk_err("vkGetFenceStatus"))
        }
    }

    fn wait(&self) -> Result<()> {
        self.with_handle(|fence| unsafe {
            self.f_dev
                .wait_for_fences(&[fence], true, u64::MAX)
                .map_err(vk_err("vkWaitForFences"))
        })
    }

    fn reset(&self) -> Result<()> {
        self.with_handle(|fence| unsafe {
            self.f_dev
                .reset_fences(&[fence])
                .map_err(vk_err("vkResetFences"))
        })
    }
}

impl Drop for GpuFence {
    fn drop(&mut self) {
        unsafe { self.f_dev.destroy_fence(self.f_fence, None) };
    }
}

/// A fence signaled by the host
///
/// Used for resources that were never submitted anywhere, and in tests
/// to drive the reclaimer without a GPU.
pub struct HostFence {
    hf_id: u64,
    hf_state: Mutex<bool>,
    hf_cond: std::sync::Condvar,
}

impl HostFence {
    pub fn new(signaled: bool) -> Self {
        Self {
            hf_id: next_fence_id(),
            hf_state: Mutex::new(signaled),
            hf_cond: std::sync::Condvar::new(),
        }
    }

    pub fn signal(&self) {
        let mut state = self.hf_state.lock().unwrap_or_else(|e| e.into_inner());
        *state = true;
        self.hf_cond.notify_all();
    }
}

impl Fence for HostFence {
    fn id(&self) -> u64 {
        self.hf_id
    }

    fn is_signaled(&self) -> Result<bool> {
        Ok(*self.hf_state.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn wait(&self) -> Result<()> {
        let mut state = self.hf_state.lock().unwrap_or_else(|e| e.into_inner());
        while !*state {
            state = self
                .hf_cond
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        *self.hf_state.lock().unwrap_or_else(|e| e.into_inner()) = false;
        Ok(())
    }
}
