//! Cooperative fiber runtime.
//!
//! A fiber is a `'static` future driven by a single-threaded executor. Fibers
//! on one thread never run in parallel; one runs until it suspends on an
//! `.await`, then the next ready fiber is polled. Wakers carry the fiber's
//! slot index and push it to a thread-local ready queue.
//!
//! Reapers run as daemon fibers: they do not keep [`FiberRuntime::block_on`]
//! alive once user work is finished. Before `block_on` returns, every
//! backend opened on the thread is torn down.

pub(crate) mod task;
pub(crate) mod waker;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::error::{Error, fatal};

use self::task::{BoxFuture, FiberId, FiberSlab};
use self::waker::{drain_ready_queue, fiber_waker, has_pending_wakeups};

const DEFAULT_CAPACITY: u32 = 256;

/// Per-thread scheduler state: the fiber slab and the queue of fibers to poll.
struct Scheduler {
    slab: FiberSlab,
    ready: VecDeque<u32>,
    /// Scratch buffer for draining the waker queue.
    woken: VecDeque<u32>,
}

impl Scheduler {
    fn new(capacity: u32) -> Self {
        Scheduler {
            slab: FiberSlab::new(capacity),
            ready: VecDeque::with_capacity(64),
            woken: VecDeque::with_capacity(64),
        }
    }

    fn spawn(&mut self, future: BoxFuture, daemon: bool) -> FiberId {
        let idx = self.slab.spawn(future, daemon);
        self.ready.push_back(idx);
        FiberId(idx)
    }

    /// Move woken fibers from the waker queue onto the ready queue.
    fn collect_wakeups(&mut self) {
        drain_ready_queue(&mut self.woken);
        while let Some(idx) = self.woken.pop_front() {
            if self.slab.wake(idx) {
                self.ready.push_back(idx);
            }
        }
    }
}

thread_local! {
    static SCHEDULER: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
    /// The fiber currently being polled, if any.
    static CURRENT_FIBER: Cell<Option<u32>> = const { Cell::new(None) };
}

fn try_with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> Option<R> {
    SCHEDULER.with(|s| s.borrow_mut().as_mut().map(f))
}

/// Whether a [`FiberRuntime`] is driving this thread.
pub fn in_runtime() -> bool {
    SCHEDULER.with(|s| s.borrow().is_some())
}

/// The fiber currently being polled on this thread.
pub fn current_fiber() -> Option<FiberId> {
    CURRENT_FIBER.with(|c| c.get()).map(FiberId)
}

/// Spawn a fiber on the current thread's runtime.
///
/// The fiber is first polled after the spawning fiber next suspends.
/// Returns [`Error::NoRuntime`] outside [`FiberRuntime::block_on`].
pub fn spawn(future: impl Future<Output = ()> + 'static) -> Result<FiberId, Error> {
    try_with_scheduler(|s| s.spawn(Box::pin(future), false)).ok_or(Error::NoRuntime)
}

/// Spawn a fiber that does not keep `block_on` alive.
pub(crate) fn spawn_daemon(future: impl Future<Output = ()> + 'static) -> Result<FiberId, Error> {
    try_with_scheduler(|s| s.spawn(Box::pin(future), true)).ok_or(Error::NoRuntime)
}

/// Whether another fiber on this thread could make progress right now.
///
/// The reaper checks this before blocking the OS thread in the kernel.
pub(crate) fn has_ready_fibers() -> bool {
    has_pending_wakeups() || try_with_scheduler(|s| !s.ready.is_empty()).unwrap_or(false)
}

/// Suspend the current fiber once, letting every other ready fiber run.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now()`].
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Single-threaded cooperative executor for fibers.
///
/// ```rust
/// use aioline::FiberRuntime;
///
/// let mut rt = FiberRuntime::new();
/// let v = rt.block_on(async {
///     let cell = std::rc::Rc::new(std::cell::Cell::new(0));
///     let c = cell.clone();
///     aioline::spawn(async move { c.set(41) }).unwrap();
///     aioline::yield_now().await;
///     cell.get() + 1
/// });
/// assert_eq!(v, 42);
/// ```
pub struct FiberRuntime {
    capacity: u32,
    _not_send: PhantomData<*const ()>,
}

impl Default for FiberRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the thread's scheduler when `block_on` exits, including by panic.
struct SchedulerGuard;

impl Drop for SchedulerGuard {
    fn drop(&mut self) {
        // Take the scheduler out before dropping it: fiber destructors may
        // look at the thread-local.
        let sched = SCHEDULER.with(|s| s.borrow_mut().take());
        drop(sched);
        waker::READY_QUEUE.with(|q| q.borrow_mut().clear());
    }
}

impl FiberRuntime {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Runtime whose fiber slab starts with room for `capacity` fibers.
    pub fn with_capacity(capacity: u32) -> Self {
        FiberRuntime {
            capacity: capacity.max(1),
            _not_send: PhantomData,
        }
    }

    /// Run `future` as the root fiber until it and every fiber it spawned
    /// have finished, then tear down this thread's backends.
    ///
    /// Aborts if every remaining fiber is suspended with nothing left that
    /// could wake them.
    pub fn block_on<F>(&mut self, future: F) -> F::Output
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        if in_runtime() {
            fatal("FiberRuntime::block_on called from inside a fiber");
        }
        SCHEDULER.with(|s| *s.borrow_mut() = Some(Scheduler::new(self.capacity)));
        let _guard = SchedulerGuard;

        let output: Rc<Cell<Option<F::Output>>> = Rc::new(Cell::new(None));
        let slot = output.clone();
        try_with_scheduler(|s| {
            s.spawn(
                Box::pin(async move {
                    slot.set(Some(future.await));
                }),
                false,
            )
        });
        run_until_idle();

        if crate::reaper::has_thread_backends() {
            try_with_scheduler(|s| {
                s.spawn(Box::pin(crate::reaper::teardown_thread_backends()), false)
            });
            run_until_idle();
        }

        match output.take() {
            Some(v) => v,
            None => fatal("root fiber finished without producing output"),
        }
    }
}

/// Poll ready fibers until no user fiber is left.
///
/// Daemons still in the ready queue are not polled again.
fn run_until_idle() {
    loop {
        let next = try_with_scheduler(|s| {
            s.collect_wakeups();
            if s.slab.live_user() == 0 {
                return None;
            }
            match s.ready.pop_front() {
                Some(idx) => Some(idx),
                None => fatal(format!(
                    "{} fiber(s) suspended with nothing left to wake them",
                    s.slab.live_user()
                )),
            }
        })
        .flatten();
        match next {
            Some(idx) => poll_fiber(idx),
            None => return,
        }
    }
}

fn poll_fiber(idx: u32) {
    let Some(mut future) = try_with_scheduler(|s| s.slab.take_ready(idx)).flatten() else {
        return;
    };
    let waker = fiber_waker(idx);
    let mut cx = Context::from_waker(&waker);

    CURRENT_FIBER.with(|c| c.set(Some(idx)));
    let poll = future.as_mut().poll(&mut cx);
    CURRENT_FIBER.with(|c| c.set(None));

    match poll {
        Poll::Ready(()) => {
            try_with_scheduler(|s| s.slab.remove(idx));
            drop(future);
        }
        Poll::Pending => {
            try_with_scheduler(|s| s.slab.park(idx, future));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_on_returns_root_output() {
        let mut rt = FiberRuntime::new();
        assert_eq!(rt.block_on(async { 7 }), 7);
        assert!(!in_runtime());
    }

    #[test]
    fn spawned_fibers_run_before_block_on_returns() {
        let counter = Rc::new(Cell::new(0));
        let c = counter.clone();
        let mut rt = FiberRuntime::with_capacity(2);
        rt.block_on(async move {
            for _ in 0..10 {
                let c = c.clone();
                spawn(async move {
                    yield_now().await;
                    c.set(c.get() + 1);
                })
                .unwrap();
            }
        });
        assert_eq!(counter.get(), 10);
    }

    #[test]
    fn yield_interleaves_fibers() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut rt = FiberRuntime::new();
        let l = log.clone();
        rt.block_on(async move {
            for id in 0..2u32 {
                let l = l.clone();
                spawn(async move {
                    for step in 0..3u32 {
                        l.borrow_mut().push((id, step));
                        yield_now().await;
                    }
                })
                .unwrap();
            }
        });
        let log = log.borrow();
        assert_eq!(&log[..4], &[(0, 0), (1, 0), (0, 1), (1, 1)]);
    }

    #[test]
    fn daemons_do_not_block_exit() {
        let mut rt = FiberRuntime::new();
        rt.block_on(async {
            spawn_daemon(async {
                loop {
                    yield_now().await;
                }
            })
            .unwrap();
        });
    }

    #[test]
    fn busy_daemon_stops_with_last_user_fiber() {
        let ticks = Rc::new(Cell::new(0u32));
        let t = ticks.clone();
        let mut rt = FiberRuntime::new();
        rt.block_on(async move {
            spawn_daemon(async move {
                loop {
                    t.set(t.get() + 1);
                    yield_now().await;
                }
            })
            .unwrap();
            spawn(async {
                for _ in 0..3 {
                    yield_now().await;
                }
            })
            .unwrap();
        });
        // The daemon ran alongside the user fiber, then was left behind.
        assert!(ticks.get() >= 3);
        assert!(ticks.get() <= 5);
    }

    #[test]
    fn ready_fibers_are_visible() {
        let mut rt = FiberRuntime::new();
        rt.block_on(async {
            assert!(!has_ready_fibers());
            spawn(async {}).unwrap();
            assert!(has_ready_fibers());
            assert!(current_fiber().is_some());
        });
    }

    #[test]
    fn spawn_outside_runtime_fails() {
        assert!(matches!(spawn(async {}), Err(Error::NoRuntime)));
        assert!(!has_ready_fibers());
    }

    #[test]
    fn runtime_is_reusable() {
        let mut rt = FiberRuntime::new();
        assert_eq!(rt.block_on(async { 1 }), 1);
        assert_eq!(rt.block_on(async { 2 }), 2);
    }
}
