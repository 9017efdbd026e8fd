/// Fence based deletion queue
///
/// GPU objects referenced by submitted work can't be destroyed until the
/// GPU is done with them. Instead of destroying them inline, owners hand
/// them to the reclaimer along with the fence of the submission that last
/// used them. Everything recycled under the same fence lives in one batch,
/// and the whole batch is dropped once that fence signals.
///
/// Austin Shafer - 2024
use crate::fence::Fence;
use crate::{Droppable, Result};
use utils::log;

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

/// How long the worker sleeps while batches are still waiting on the GPU
pub const RECLAIM_BACKOFF: Duration = Duration::from_millis(100);

type Garbage = Box<dyn Droppable + Send>;

/// A list of items to be dropped once a fence signals
struct GarbageBatch {
    gb_fence: Arc<dyn Fence>,
    gb_items: Vec<Garbage>,
}

struct ReclaimerState {
    /// One batch per fence id
    rs_batches: HashMap<u64, GarbageBatch>,
    /// Cleared when the worker thread should exit
    rs_running: bool,
}

struct ReclaimerShared {
    r_state: Mutex<ReclaimerState>,
    r_cond: Condvar,
}

impl ReclaimerShared {
    fn lock(&self) -> MutexGuard<'_, ReclaimerState> {
        self.r_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One non-blocking pass over every batch
    ///
    /// Batches are dropped without holding the lock, so a slow
    /// destructor never blocks `recycle`.
    fn collect(&self) -> Result<usize> {
        let fences: Vec<Arc<dyn Fence>> = self
            .lock()
            .rs_batches
            .values()
            .map(|b| b.gb_fence.clone())
            .collect();

        let mut signaled = Vec::new();
        for fence in fences.iter() {
            if fence.is_signaled()? {
                signaled.push(fence.id());
            }
        }
        if signaled.is_empty() {
            return Ok(0);
        }

        // A frame slot may have reset its fence and recycled more work
        // under it since the poll above. Check again while `recycle`
        // is locked out.
        let ready: Vec<GarbageBatch> = {
            let mut state = self.lock();
            let mut ready = Vec::new();
            for id in signaled.iter() {
                let still_signaled = match state.rs_batches.get(id) {
                    Some(batch) => batch.gb_fence.is_signaled()?,
                    None => false,
                };
                if still_signaled {
                    ready.extend(state.rs_batches.remove(id));
                }
            }
            ready
        };

        let count = ready.iter().map(|b| b.gb_items.len()).sum();
        log::debug!(
            "Reclaimer: destroying {} objects from {} batches",
            count,
            ready.len()
        );
        drop(ready);

        Ok(count)
    }

    /// Wait on every outstanding fence and drop everything
    fn drain(&self) -> Result<usize> {
        let batches: Vec<GarbageBatch> = self.lock().rs_batches.drain().map(|(_, b)| b).collect();

        let mut count = 0;
        let mut ret = Ok(());
        for batch in batches.into_iter() {
            // Keep going on failure, the device is going away regardless
            if let Err(e) = batch.gb_fence.wait() {
                log::error!("Reclaimer: failed to wait for fence during drain: {}", e);
                ret = Err(e);
            }
            count += batch.gb_items.len();
        }

        ret.map(|_| count)
    }

    /// Background sweep loop
    fn worker(&self) {
        loop {
            {
                let mut state = self.lock();
                while state.rs_running && state.rs_batches.is_empty() {
                    state = self.r_cond.wait(state).unwrap_or_else(|e| e.into_inner());
                }
                if !state.rs_running {
                    return;
                }
            }

            if let Err(e) = self.collect() {
                log::error!("Reclaimer: fence poll failed: {}", e);
            }

            // Back off while things are still in flight
            let state = self.lock();
            if state.rs_running && !state.rs_batches.is_empty() {
                let _ = self
                    .r_cond
                    .wait_timeout(state, RECLAIM_BACKOFF)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }
    }
}

/// Deferred destruction for GPU resources
///
/// Shared by every logical device in the fleet. The worker thread is
/// optional, `manual()` builds a reclaimer that only sweeps when
/// `collect` is called.
pub struct GpuResourceReclaimer {
    r_shared: Arc<ReclaimerShared>,
    r_thread: Option<JoinHandle<()>>,
}

impl GpuResourceReclaimer {
    fn with_shared() -> Arc<ReclaimerShared> {
        Arc::new(ReclaimerShared {
            r_state: Mutex::new(ReclaimerState {
                rs_batches: HashMap::new(),
                rs_running: true,
            }),
            r_cond: Condvar::new(),
        })
    }

    /// Create a reclaimer with a background sweep thread
    pub fn new() -> std::io::Result<Self> {
        let shared = Self::with_shared();
        let worker_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("squall-reclaimer".to_string())
            .spawn(move || worker_shared.worker())?;

        Ok(Self {
            r_shared: shared,
            r_thread: Some(thread),
        })
    }

    /// Create a reclaimer without a worker thread
    pub fn manual() -> Self {
        Self {
            r_shared: Self::with_shared(),
            r_thread: None,
        }
    }

    /// Schedule `item` to be dropped once `fence` signals
    pub fn recycle(&self, fence: &Arc<dyn Fence>, item: Garbage) {
        self.recycle_all(fence, vec![item]);
    }

    /// Schedule every item in `items` to be dropped once `fence` signals
    ///
    /// Items recycled under a fence that already has a batch are merged
    /// into it.
    pub fn recycle_all(&self, fence: &Arc<dyn Fence>, items: Vec<Garbage>) {
        if items.is_empty() {
            return;
        }

        let mut state = self.r_shared.lock();
        state
            .rs_batches
            .entry(fence.id())
            .or_insert_with(|| GarbageBatch {
                gb_fence: fence.clone(),
                gb_items: Vec::new(),
            })
            .gb_items
            .extend(items);
        self.r_shared.r_cond.notify_all();
    }

    /// Run one sweep, returns the number of objects destroyed
    pub fn collect(&self) -> Result<usize> {
        self.r_shared.collect()
    }

    /// Block until every batch's fence signals and destroy everything
    ///
    /// Used at shutdown. Returns the number of objects destroyed.
    pub fn drain(&self) -> Result<usize> {
        self.r_shared.drain()
    }

    /// Number of fences with garbage waiting on them
    pub fn pending_batches(&self) -> usize {
        self.r_shared.lock().rs_batches.len()
    }

    /// Is anything waiting on this fence id
    pub fn is_pending(&self, fence_id: u64) -> bool {
        self.r_shared.lock().rs_batches.contains_key(&fence_id)
    }
}

impl Drop for GpuResourceReclaimer {
    fn drop(&mut self) {
        {
            let mut state = self.r_shared.lock();
            state.rs_running = false;
            self.r_shared.r_cond.notify_all();
        }
        if let Some(thread) = self.r_thread.take() {
            if thread.join().is_err() {
                log::error!("Reclaimer worker thread panicked");
            }
        }
        if let Err(e) = self.r_shared.drain() {
            log::error!("Reclaimer: could not drain on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::HostFence;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    /// Bumps a counter when destroyed
    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracked(count: &Arc<AtomicUsize>) -> Garbage {
        Box::new(Tracked(count.clone()))
    }

    #[test]
    fn three_objects_one_fence() {
        let rec = GpuResourceReclaimer::manual();
        let host = Arc::new(HostFence::new(false));
        let fence: Arc<dyn Fence> = host.clone();
        let dropped = Arc::new(AtomicUsize::new(0));

        rec.recycle(&fence, tracked(&dropped));
        rec.recycle_all(&fence, vec![tracked(&dropped), tracked(&dropped)]);
        assert_eq!(rec.pending_batches(), 1);
        assert!(rec.is_pending(fence.id()));

        // Nothing goes away before the GPU is done
        assert_eq!(rec.collect().unwrap(), 0);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        host.signal();
        assert_eq!(rec.collect().unwrap(), 3);
        assert_eq!(dropped.load(Ordering::SeqCst), 3);
        assert_eq!(rec.pending_batches(), 0);
        assert!(!rec.is_pending(fence.id()));
    }

    #[test]
    fn batches_are_independent() {
        let rec = GpuResourceReclaimer::manual();
        let first = Arc::new(HostFence::new(false));
        let second = Arc::new(HostFence::new(false));
        let f1: Arc<dyn Fence> = first.clone();
        let f2: Arc<dyn Fence> = second.clone();
        let dropped = Arc::new(AtomicUsize::new(0));

        rec.recycle(&f1, tracked(&dropped));
        rec.recycle(&f2, tracked(&dropped));
        rec.recycle(&f2, tracked(&dropped));
        assert_eq!(rec.pending_batches(), 2);

        second.signal();
        assert_eq!(rec.collect().unwrap(), 2);
        assert!(rec.is_pending(f1.id()));
        assert!(!rec.is_pending(f2.id()));
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
    }

    /// A frame slot fence that gets reused by the render thread right
    /// after the reclaimer's first poll sees it signaled
    struct ReusedFence {
        rf_inner: HostFence,
        rf_on_poll: Mutex<Option<Box<dyn FnOnce(&HostFence) + Send>>>,
    }

    impl Fence for ReusedFence {
        fn id(&self) -> u64 {
            self.rf_inner.id()
        }

        fn is_signaled(&self) -> Result<bool> {
            let ret = self.rf_inner.is_signaled();
            if let Some(reuse) = self.rf_on_poll.lock().unwrap().take() {
                reuse(&self.rf_inner);
            }
            ret
        }

        fn wait(&self) -> Result<()> {
            self.rf_inner.wait()
        }

        fn reset(&self) -> Result<()> {
            self.rf_inner.reset()
        }
    }

    #[test]
    fn reused_fence_keeps_new_garbage() {
        let rec = Arc::new(GpuResourceReclaimer::manual());
        let slot = Arc::new(ReusedFence {
            rf_inner: HostFence::new(true),
            rf_on_poll: Mutex::new(None),
        });
        let fence: Arc<dyn Fence> = slot.clone();
        let old = Arc::new(AtomicUsize::new(0));
        let new = Arc::new(AtomicUsize::new(0));

        rec.recycle(&fence, tracked(&old));

        // wait, reset, submit, then retire the next frame's objects
        let weak_rec = Arc::downgrade(&rec);
        let weak_fence = Arc::downgrade(&fence);
        let next_frame = tracked(&new);
        *slot.rf_on_poll.lock().unwrap() = Some(Box::new(move |inner: &HostFence| {
            inner.reset().unwrap();
            let rec = weak_rec.upgrade().unwrap();
            let fence = weak_fence.upgrade().unwrap();
            rec.recycle(&fence, next_frame);
        }));

        assert_eq!(rec.collect().unwrap(), 0);
        assert_eq!(old.load(Ordering::SeqCst), 0);
        assert_eq!(new.load(Ordering::SeqCst), 0);
        assert!(rec.is_pending(fence.id()));

        slot.rf_inner.signal();
        assert_eq!(rec.collect().unwrap(), 2);
        assert_eq!(old.load(Ordering::SeqCst), 1);
        assert_eq!(new.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drain_destroys_everything() {
        let rec = GpuResourceReclaimer::manual();
        let fence: Arc<dyn Fence> = Arc::new(HostFence::new(true));
        let dropped = Arc::new(AtomicUsize::new(0));

        rec.recycle_all(&fence, vec![tracked(&dropped), tracked(&dropped)]);
        assert_eq!(rec.drain().unwrap(), 2);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
        assert_eq!(rec.pending_batches(), 0);
    }

    #[test]
    fn worker_sweeps_after_signal() {
        let rec = GpuResourceReclaimer::new().unwrap();
        let host = Arc::new(HostFence::new(false));
        let fence: Arc<dyn Fence> = host.clone();
        let dropped = Arc::new(AtomicUsize::new(0));

        rec.recycle(&fence, tracked(&dropped));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        host.signal();
        let start = Instant::now();
        while dropped.load(Ordering::SeqCst) == 0 {
            assert!(start.elapsed() < Duration::from_secs(5));
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(rec.pending_batches(), 0);
    }

    #[test]
    fn drop_drains_pending() {
        let dropped = Arc::new(AtomicUsize::new(0));
        {
            let rec = GpuResourceReclaimer::new().unwrap();
            let fence: Arc<dyn Fence> = Arc::new(HostFence::new(true));
            rec.recycle(&fence, tracked(&dropped));
        }
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }
}
