//! Reapers and the per-thread backend registry.
//!
//! Each OS thread lazily opens at most one context per [`BackendKind`] and
//! spawns one reaper daemon fiber for it. The reaper alternates between
//! reaping (blocking the thread only when no other fiber is ready) and
//! yielding. With nothing outstanding it parks until the next submission or
//! a stop request.
//!
//! [`IoFuture`] is the scheduler adapter: it records the fiber's waker in
//! the request's token, submits, and completes once the reaper marks the
//! token done.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::{Future, poll_fn};
use std::io;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::backend::{BackendDriver, BackendKind, Submit};
use crate::completion::InFlight;
use crate::config::Config;
use crate::error::{Error, fatal};
use crate::metrics;
use crate::runtime::{self, yield_now};

/// Lifecycle of a reaper.
///
/// `Ready -> Running` when first scheduled, `Running -> Stopping` on a
/// teardown request, `Stopping -> Stopped` once nothing is outstanding and
/// no fiber is waiting to retry a busy submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaperState {
    Ready,
    Running,
    Stopping,
    Stopped,
}

/// Type-erased view of a reaper, as stored in the thread registry.
pub(crate) trait ReaperHandle {
    fn kind(&self) -> BackendKind;

    /// # Safety
    /// See [`BackendDriver::submit`].
    unsafe fn submit(&self, slot: *mut InFlight) -> Submit;

    fn state(&self) -> ReaperState;

    fn outstanding(&self) -> usize;

    /// A fiber got [`Submit::Busy`] and will submit again. The reaper does
    /// not stop while any such fiber is pending.
    fn begin_retry(&self);

    /// The retrying fiber submitted, failed or was dropped.
    fn end_retry(&self);

    /// Ask the reaper to stop once it has drained.
    fn request_stop(&self);

    /// Ready once the reaper has reached `Stopped`.
    fn poll_stopped(&self, cx: &mut Context<'_>) -> Poll<()>;
}

pub(crate) struct Reaper<D: BackendDriver> {
    driver: RefCell<D>,
    state: Cell<ReaperState>,
    /// Fibers between a `Busy` submit and their retry.
    retrying: Cell<usize>,
    /// The reaper fiber's waker while it is parked.
    parked: Cell<Option<Waker>>,
    stop_waiters: RefCell<Vec<Waker>>,
}

impl<D: BackendDriver> Reaper<D> {
    /// Open the backend context and spawn the reaper fiber.
    fn start(config: &Config) -> Result<Rc<Self>, Error> {
        if !runtime::in_runtime() {
            return Err(Error::NoRuntime);
        }
        let driver = D::setup(config)?;
        let reaper = Rc::new(Reaper {
            driver: RefCell::new(driver),
            state: Cell::new(ReaperState::Ready),
            retrying: Cell::new(0),
            parked: Cell::new(None),
            stop_waiters: RefCell::new(Vec::new()),
        });
        runtime::spawn_daemon(reaper.clone().run())?;
        tracing::debug!(backend = D::KIND.name(), "reaper started");
        Ok(reaper)
    }

    async fn run(self: Rc<Self>) {
        if self.state.get() == ReaperState::Ready {
            self.state.set(ReaperState::Running);
        }
        loop {
            metrics::REAPER_ROUNDS.increment();
            if self.driver.borrow().outstanding() == 0 {
                if self.state.get() == ReaperState::Stopping && self.retrying.get() == 0 {
                    break;
                }
                self.park().await;
                continue;
            }
            let may_block = !runtime::has_ready_fibers();
            if may_block {
                metrics::REAPER_BLOCKING_WAITS.increment();
            }
            self.driver.borrow_mut().reap(may_block);
            yield_now().await;
        }
        self.state.set(ReaperState::Stopped);
        for waker in self.stop_waiters.borrow_mut().drain(..) {
            waker.wake();
        }
        tracing::debug!(backend = D::KIND.name(), "reaper stopped");
    }

    /// Suspend until [`notify`](Self::notify) or a stop request.
    async fn park(&self) {
        let mut parked = false;
        poll_fn(|cx| {
            if parked {
                return Poll::Ready(());
            }
            parked = true;
            self.parked.set(Some(cx.waker().clone()));
            Poll::Pending
        })
        .await
    }

    fn notify(&self) {
        if let Some(waker) = self.parked.take() {
            waker.wake();
        }
    }
}

impl<D: BackendDriver> ReaperHandle for Reaper<D> {
    fn kind(&self) -> BackendKind {
        D::KIND
    }

    unsafe fn submit(&self, slot: *mut InFlight) -> Submit {
        let result = unsafe { self.driver.borrow_mut().submit(slot) };
        if result == Submit::Submitted {
            self.notify();
        }
        result
    }

    fn state(&self) -> ReaperState {
        self.state.get()
    }

    fn outstanding(&self) -> usize {
        self.driver.borrow().outstanding()
    }

    fn begin_retry(&self) {
        self.retrying.set(self.retrying.get() + 1);
    }

    fn end_retry(&self) {
        self.retrying.set(self.retrying.get() - 1);
        self.notify();
    }

    fn request_stop(&self) {
        if matches!(self.state.get(), ReaperState::Ready | ReaperState::Running) {
            self.state.set(ReaperState::Stopping);
            self.notify();
        }
    }

    fn poll_stopped(&self, cx: &mut Context<'_>) -> Poll<()> {
        if self.state.get() == ReaperState::Stopped {
            return Poll::Ready(());
        }
        self.stop_waiters.borrow_mut().push(cx.waker().clone());
        Poll::Pending
    }
}

impl<D: BackendDriver> Drop for Reaper<D> {
    fn drop(&mut self) {
        let outstanding = self.driver.get_mut().outstanding();
        if outstanding > 0 {
            fatal(format!(
                "releasing {} backend context with {outstanding} outstanding request(s)",
                D::KIND.name()
            ));
        }
        tracing::debug!(backend = D::KIND.name(), "backend context released");
    }
}

thread_local! {
    static BACKENDS: RefCell<Vec<Rc<dyn ReaperHandle>>> = const { RefCell::new(Vec::new()) };
}

/// The calling thread's reaper for `kind`, started on first use.
///
/// A reaper that is stopping is not reused; a fresh one is started instead.
pub(crate) fn reaper_for(kind: BackendKind, config: &Config) -> Result<Rc<dyn ReaperHandle>, Error> {
    let existing = BACKENDS.with(|b| {
        b.borrow()
            .iter()
            .find(|r| {
                r.kind() == kind
                    && matches!(r.state(), ReaperState::Ready | ReaperState::Running)
            })
            .cloned()
    });
    if let Some(r) = existing {
        return Ok(r);
    }
    let reaper = start(kind, config)?;
    BACKENDS.with(|b| b.borrow_mut().push(reaper.clone()));
    Ok(reaper)
}

fn start(kind: BackendKind, config: &Config) -> Result<Rc<dyn ReaperHandle>, Error> {
    match kind {
        #[cfg(all(feature = "uring", target_os = "linux"))]
        BackendKind::Ring => Ok(Reaper::<crate::backend::ring::RingDriver>::start(config)?),
        #[cfg(target_os = "linux")]
        BackendKind::LegacyAio => Ok(Reaper::<crate::backend::legacy::LegacyDriver>::start(config)?),
        #[cfg(unix)]
        BackendKind::Posix => Ok(Reaper::<crate::backend::posix::PosixDriver>::start(config)?),
        #[allow(unreachable_patterns)]
        other => Err(Error::Unsupported(format!(
            "{} backend not available in this build",
            other.name()
        ))),
    }
}

/// Requests outstanding on this thread's `kind` backends, stopping ones
/// included. Opens nothing.
pub(crate) fn thread_outstanding(kind: BackendKind) -> usize {
    BACKENDS.with(|b| {
        b.borrow()
            .iter()
            .filter(|r| r.kind() == kind)
            .map(|r| r.outstanding())
            .sum()
    })
}

/// Whether this thread has opened any backend context.
pub(crate) fn has_thread_backends() -> bool {
    BACKENDS.with(|b| !b.borrow().is_empty())
}

/// Drain and stop every reaper on this thread, then release their contexts.
///
/// Waits for outstanding requests of other fibers to complete. Calling it
/// again, or on a thread without backends, returns immediately.
pub(crate) async fn teardown_thread_backends() {
    loop {
        let handles: Vec<Rc<dyn ReaperHandle>> = BACKENDS.with(|b| b.borrow().clone());
        if handles.is_empty() {
            return;
        }
        for h in &handles {
            h.request_stop();
        }
        for h in &handles {
            poll_fn(|cx| h.poll_stopped(cx)).await;
        }
        BACKENDS.with(|b| {
            b.borrow_mut()
                .retain(|r| !handles.iter().any(|h| Rc::ptr_eq(h, r)))
        });
        tracing::debug!(count = handles.len(), "thread backends torn down");
    }
}

/// A positioned request submitted to a reaper-backed backend.
///
/// Dropping it while the request is in flight aborts the process: the
/// kernel still holds the token and buffer addresses.
pub(crate) struct IoFuture {
    backend: Rc<dyn ReaperHandle>,
    slot: Option<Box<InFlight>>,
    submitted: bool,
    /// Registered with the reaper as a pending retry.
    retrying: bool,
}

impl IoFuture {
    pub(crate) fn new(backend: Rc<dyn ReaperHandle>, slot: Box<InFlight>) -> Self {
        IoFuture {
            backend,
            slot: Some(slot),
            submitted: false,
            retrying: false,
        }
    }

    fn finish_retry(&mut self) {
        if self.retrying {
            self.retrying = false;
            self.backend.end_retry();
        }
    }
}

impl Future for IoFuture {
    type Output = io::Result<usize>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let Some(slot) = this.slot.as_mut() else {
            panic!("IoFuture polled after completion");
        };

        if !this.submitted {
            slot.token.set_waiter(cx.waker());
            // SAFETY: the slot is boxed and owned by this future, which
            // aborts on drop until the token is done.
            let result = unsafe { this.backend.submit(&mut **slot) };
            if result != Submit::Busy && this.retrying {
                this.retrying = false;
                this.backend.end_retry();
            }
            match result {
                Submit::Submitted => {
                    this.submitted = true;
                    metrics::REQUESTS_SUBMITTED.increment();
                    metrics::REQUESTS_IN_FLIGHT.increment();
                    return Poll::Pending;
                }
                Submit::Busy => {
                    if !this.retrying {
                        this.retrying = true;
                        this.backend.begin_retry();
                    }
                    metrics::SUBMIT_RETRIES.increment();
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                Submit::Failed(errno) => {
                    this.slot = None;
                    metrics::REQUESTS_FAILED.increment();
                    return Poll::Ready(Err(io::Error::from_raw_os_error(errno)));
                }
            }
        }

        if slot.token.is_done() {
            let result = slot.token.result();
            this.slot = None;
            metrics::REQUESTS_IN_FLIGHT.decrement();
            Poll::Ready(result)
        } else {
            slot.token.set_waiter(cx.waker());
            Poll::Pending
        }
    }
}

impl Drop for IoFuture {
    fn drop(&mut self) {
        self.finish_retry();
        if let Some(slot) = &self.slot
            && self.submitted
            && !slot.token.is_done()
        {
            fatal(format!(
                "in-flight {} request dropped before completion",
                self.backend.kind().name()
            ));
        }
    }
}

impl fmt::Debug for IoFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoFuture")
            .field("backend", &self.backend.kind())
            .field("submitted", &self.submitted)
            .finish()
    }
}
