use std::future::Future;
use std::pin::Pin;

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// Opaque handle for a fiber spawned via [`spawn()`](crate::spawn).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(pub(crate) u32);

impl FiberId {
    /// Returns the fiber's slot index.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// State of a single fiber slot.
enum FiberSlot {
    /// Slot is empty (no fiber).
    Empty,
    /// Fiber is suspended, waiting for a wakeup.
    Parked(BoxFuture),
    /// Fiber is ready to be polled.
    Ready(BoxFuture),
    /// Fiber is being polled right now; its future is on the executor's stack.
    Running,
}

/// Slab of fibers for one thread.
///
/// Free list for O(1) spawn/remove; grows when full. Daemon fibers
/// (reapers) are tracked separately so the runtime can tell when all user
/// work has finished.
pub(crate) struct FiberSlab {
    fibers: Vec<FiberSlot>,
    daemon: Vec<bool>,
    free_list: Vec<u32>,
    live_user: usize,
}

impl FiberSlab {
    /// Create a slab with room for `capacity` fibers before growing.
    pub(crate) fn new(capacity: u32) -> Self {
        let mut fibers = Vec::with_capacity(capacity as usize);
        let mut free_list = Vec::with_capacity(capacity as usize);
        for i in (0..capacity).rev() {
            fibers.push(FiberSlot::Empty);
            free_list.push(i);
        }
        FiberSlab {
            fibers,
            daemon: vec![false; capacity as usize],
            free_list,
            live_user: 0,
        }
    }

    /// Insert a fiber, marked Ready for its first poll. Returns the slot index.
    pub(crate) fn spawn(&mut self, future: BoxFuture, daemon: bool) -> u32 {
        let idx = match self.free_list.pop() {
            Some(idx) => idx,
            None => {
                self.fibers.push(FiberSlot::Empty);
                self.daemon.push(false);
                (self.fibers.len() - 1) as u32
            }
        };
        self.fibers[idx as usize] = FiberSlot::Ready(future);
        self.daemon[idx as usize] = daemon;
        if !daemon {
            self.live_user += 1;
        }
        idx
    }

    /// Take a Ready fiber out for polling. The slot becomes Running.
    pub(crate) fn take_ready(&mut self, idx: u32) -> Option<BoxFuture> {
        let slot = self.fibers.get_mut(idx as usize)?;
        match std::mem::replace(slot, FiberSlot::Running) {
            FiberSlot::Ready(fut) => Some(fut),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Park a fiber back after it returned `Poll::Pending`.
    pub(crate) fn park(&mut self, idx: u32, future: BoxFuture) {
        debug_assert!(matches!(self.fibers[idx as usize], FiberSlot::Running));
        self.fibers[idx as usize] = FiberSlot::Parked(future);
    }

    /// Mark a Parked fiber Ready. Returns true if it was parked.
    pub(crate) fn wake(&mut self, idx: u32) -> bool {
        let Some(slot) = self.fibers.get_mut(idx as usize) else {
            return false;
        };
        match std::mem::replace(slot, FiberSlot::Empty) {
            FiberSlot::Parked(fut) => {
                *slot = FiberSlot::Ready(fut);
                true
            }
            other => {
                *slot = other;
                false
            }
        }
    }

    /// Release a finished fiber's slot.
    pub(crate) fn remove(&mut self, idx: u32) {
        let i = idx as usize;
        if i < self.fibers.len() && !matches!(self.fibers[i], FiberSlot::Empty) {
            self.fibers[i] = FiberSlot::Empty;
            if !self.daemon[i] {
                self.live_user -= 1;
            }
            self.free_list.push(idx);
        }
    }

    /// Number of non-daemon fibers that have not finished.
    pub(crate) fn live_user(&self) -> usize {
        self.live_user
    }

    #[cfg(test)]
    pub(crate) fn has_fiber(&self, idx: u32) -> bool {
        self.fibers
            .get(idx as usize)
            .is_some_and(|s| !matches!(s, FiberSlot::Empty))
    }
}
