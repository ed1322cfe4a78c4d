//! Backend drivers: one kernel async I/O mechanism each.
//!
//! A driver owns a per-thread backend context. Fibers on the owning thread
//! submit through it between suspension points; the thread's reaper fiber
//! calls [`BackendDriver::reap`] to move completions into tokens and wake
//! the waiting fibers. Drivers are never shared across threads.
//!
//! The synchronous backend has no context and no reaper, so it is not a
//! `BackendDriver`; see [`sync`].

#[cfg(target_os = "linux")]
pub(crate) mod aio_abi;
#[cfg(target_os = "linux")]
pub(crate) mod legacy;
#[cfg(unix)]
pub(crate) mod posix;
#[cfg(all(feature = "uring", target_os = "linux"))]
pub(crate) mod ring;
pub(crate) mod sync;

use crate::completion::InFlight;
use crate::config::Config;
use crate::error::Error;

/// The reaper-backed backends. One reaper and one context per kind per thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Ring,
    LegacyAio,
    Posix,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Ring => "ring",
            BackendKind::LegacyAio => "legacy-aio",
            BackendKind::Posix => "posix",
        }
    }
}

/// Outcome of handing one request to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Submit {
    /// The backend owns the request until its token is done.
    Submitted,
    /// Transient back-pressure (full queue, `EAGAIN`). Yield and retry.
    Busy,
    /// The request never reached the kernel; positive errno.
    Failed(i32),
}

pub(crate) trait BackendDriver: Sized + 'static {
    const KIND: BackendKind;

    /// Create the backend context for the calling thread.
    fn setup(config: &Config) -> Result<Self, Error>;

    /// Hand one request to the backend.
    ///
    /// # Safety
    /// `slot` must stay valid, and must not move, until its token is done.
    unsafe fn submit(&mut self, slot: *mut InFlight) -> Submit;

    /// Complete every finished request. When `may_block` is true no other
    /// fiber on this thread is ready, so the driver may block the thread
    /// until at least one request finishes. Returns the number completed.
    fn reap(&mut self, may_block: bool) -> usize;

    /// Requests submitted and not yet completed.
    fn outstanding(&self) -> usize;
}
