use std::cell::RefCell;
use std::collections::VecDeque;
use std::task::{RawWaker, RawWakerVTable, Waker};

thread_local! {
    /// Thread-local queue of fiber indices that were woken.
    /// Wakers push to this queue; the runtime drains it between polls.
    pub(crate) static READY_QUEUE: RefCell<VecDeque<u32>> =
        const { RefCell::new(VecDeque::new()) };
}

/// Create a [`Waker`] for the fiber at `fiber_idx`.
///
/// When woken, the waker pushes `fiber_idx` onto the thread-local
/// `READY_QUEUE`. Zero allocation: the index is encoded as the raw pointer.
///
/// Completions are always delivered on the thread that owns the fiber (the
/// reaper runs there), so waking from another thread never happens. The
/// dedicated-thread path publishes through the token's `done` flag instead.
pub(crate) fn fiber_waker(fiber_idx: u32) -> Waker {
    let data = fiber_idx as usize as *const ();
    // SAFETY: The vtable functions below follow the RawWaker contract.
    // The "data" is just a usize cast to a pointer, no heap allocation.
    unsafe { Waker::from_raw(RawWaker::new(data, &VTABLE)) }
}

const VTABLE: RawWakerVTable = RawWakerVTable::new(clone_fn, wake_fn, wake_by_ref_fn, drop_fn);

unsafe fn clone_fn(data: *const ()) -> RawWaker {
    RawWaker::new(data, &VTABLE)
}

unsafe fn wake_fn(data: *const ()) {
    // SAFETY: wake_by_ref_fn is safe to call with data from our vtable.
    unsafe { wake_by_ref_fn(data) };
}

unsafe fn wake_by_ref_fn(data: *const ()) {
    let fiber_idx = data as usize as u32;
    READY_QUEUE.with(|q| {
        q.borrow_mut().push_back(fiber_idx);
    });
}

unsafe fn drop_fn(_data: *const ()) {}

/// Drain the thread-local ready queue into the provided buffer.
pub(crate) fn drain_ready_queue(buf: &mut VecDeque<u32>) {
    READY_QUEUE.with(|q| {
        buf.append(&mut q.borrow_mut());
    });
}

/// Whether any wakeups are waiting to be collected.
pub(crate) fn has_pending_wakeups() -> bool {
    READY_QUEUE.with(|q| !q.borrow().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waker_pushes_to_ready_queue() {
        READY_QUEUE.with(|q| q.borrow_mut().clear());

        let waker = fiber_waker(42);
        waker.wake_by_ref();
        waker.wake_by_ref();
        assert!(has_pending_wakeups());

        let mut buf = VecDeque::new();
        drain_ready_queue(&mut buf);
        assert_eq!(buf, [42, 42]);
        assert!(!has_pending_wakeups());
    }

    #[test]
    fn cloned_waker_targets_same_fiber() {
        READY_QUEUE.with(|q| q.borrow_mut().clear());

        let waker = fiber_waker(7);
        let cloned = waker.clone();
        assert!(waker.will_wake(&cloned));
        cloned.wake();

        let mut buf = VecDeque::new();
        drain_ready_queue(&mut buf);
        assert_eq!(buf, [7]);
    }
}
