//! Public entry points.
//!
//! A [`Dispatcher`] holds a validated [`Config`] and the provider chosen for
//! it. The free functions ([`read`], [`write`], ...) go through a
//! process-wide default dispatcher, built from the environment on first use
//! unless one was [`install`]ed first.

use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::OnceLock;

use crate::backend::{self, BackendKind};
use crate::completion::{InFlight, IoRequest};
use crate::config::Config;
use crate::error::{Error, fatal, or_fatal};
use crate::provider::{Capabilities, Provider, Selection};
use crate::reaper::{self, IoFuture, ReaperHandle};

static DEFAULT: OnceLock<Dispatcher> = OnceLock::new();

/// Routes positioned I/O to the selected provider.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    config: Config,
    selection: Selection,
}

impl Dispatcher {
    /// Validate `config`, probe the platform and select a provider.
    pub fn new(config: Config) -> Result<Self, Error> {
        Self::with_capabilities(config, Capabilities::probe())
    }

    /// Like [`new`](Self::new), against explicit capabilities.
    pub fn with_capabilities(config: Config, capabilities: Capabilities) -> Result<Self, Error> {
        config.validate()?;
        let selection = Selection::resolve_with(config.provider, capabilities)?;
        Ok(Dispatcher { config, selection })
    }

    /// The process-wide default dispatcher.
    ///
    /// Built from [`Config::from_env`] on first use; aborts if the requested
    /// provider is unsupported.
    pub fn global() -> &'static Dispatcher {
        DEFAULT.get_or_init(|| or_fatal(Dispatcher::new(Config::from_env())))
    }

    pub fn provider(&self) -> Provider {
        self.selection.provider
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Positioned read into `buf` at `offset`.
    ///
    /// Suspends the calling fiber until the request completes. With the
    /// synchronous provider the read happens inline.
    pub async fn read(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        match self.reaper()? {
            None => backend::sync::read(fd, buf, offset),
            Some(reaper) => IoFuture::new(reaper, InFlight::new(IoRequest::read(fd, buf, offset))).await,
        }
    }

    /// Positioned write of `buf` at `offset`.
    pub async fn write(&self, fd: RawFd, buf: &[u8], offset: u64) -> io::Result<usize> {
        match self.reaper()? {
            None => backend::sync::write(fd, buf, offset),
            Some(reaper) => IoFuture::new(reaper, InFlight::new(IoRequest::write(fd, buf, offset))).await,
        }
    }

    /// Positioned write serviced by the dedicated thread.
    ///
    /// Aborts when kernel AIO is unavailable or the synchronous provider is
    /// selected.
    pub async fn durable_write(&self, fd: RawFd, buf: &[u8], offset: u64) -> io::Result<usize> {
        #[cfg(target_os = "linux")]
        {
            self.dedicated().write(fd, buf, offset).await
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (fd, buf, offset);
            self.durable_unsupported()
        }
    }

    /// Positioned read serviced by the dedicated thread.
    pub async fn durable_read(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        #[cfg(target_os = "linux")]
        {
            self.dedicated().read(fd, buf, offset).await
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (fd, buf, offset);
            self.durable_unsupported()
        }
    }

    /// Advisory readahead for `buf`. See [`crate::prefetch::prefetch_hint`].
    pub async fn prefetch_hint(&self, buf: &[u8]) {
        crate::prefetch::prefetch_hint(buf).await
    }

    /// Requests submitted on the calling thread through the selected
    /// provider and not yet completed. Always 0 for the synchronous provider.
    pub fn outstanding(&self) -> usize {
        self.backend_kind().map_or(0, reaper::thread_outstanding)
    }

    fn backend_kind(&self) -> Option<BackendKind> {
        match self.selection.provider {
            Provider::Synchronous => None,
            Provider::Posix => Some(BackendKind::Posix),
            Provider::LegacyAio => Some(BackendKind::LegacyAio),
            Provider::Ring => Some(BackendKind::Ring),
        }
    }

    /// The calling thread's reaper for the selected provider, or `None` for
    /// the synchronous provider.
    fn reaper(&self) -> io::Result<Option<Rc<dyn ReaperHandle>>> {
        let Some(kind) = self.backend_kind() else {
            return Ok(None);
        };
        match reaper::reaper_for(kind, &self.config) {
            Ok(r) => Ok(Some(r)),
            Err(Error::NoRuntime) => Err(io::Error::other(Error::NoRuntime)),
            Err(e) => fatal(e),
        }
    }

    #[cfg(target_os = "linux")]
    fn dedicated(&self) -> &'static crate::dedicated::DedicatedThread {
        if !self.selection.durable_supported() {
            self.durable_unsupported();
        }
        or_fatal(crate::dedicated::DedicatedThread::global(&self.config))
    }

    fn durable_unsupported(&self) -> ! {
        fatal(Error::Unsupported(format!(
            "durable I/O needs kernel AIO and an asynchronous provider (selected: {})",
            self.selection.provider
        )))
    }
}

/// Install `dispatcher` as the process-wide default.
///
/// Fails, returning it back, if the default was already installed or
/// already built by an earlier call.
pub fn install(dispatcher: Dispatcher) -> Result<(), Dispatcher> {
    DEFAULT.set(dispatcher)
}

/// Positioned read through the default dispatcher.
pub async fn read(fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    Dispatcher::global().read(fd, buf, offset).await
}

/// Positioned write through the default dispatcher.
pub async fn write(fd: RawFd, buf: &[u8], offset: u64) -> io::Result<usize> {
    Dispatcher::global().write(fd, buf, offset).await
}

/// Positioned write through the dedicated thread.
pub async fn durable_write(fd: RawFd, buf: &[u8], offset: u64) -> io::Result<usize> {
    Dispatcher::global().durable_write(fd, buf, offset).await
}

/// Positioned read through the dedicated thread.
pub async fn durable_read(fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    Dispatcher::global().durable_read(fd, buf, offset).await
}

/// Advisory readahead for a memory-mapped range.
pub async fn prefetch_hint(buf: &[u8]) {
    crate::prefetch::prefetch_hint(buf).await
}

/// Drain and stop this thread's reapers and release their contexts.
///
/// Waits for every outstanding request on the thread. Idempotent; a later
/// request reopens what it needs. [`FiberRuntime::block_on`](crate::FiberRuntime::block_on)
/// calls this before returning.
pub async fn teardown() {
    reaper::teardown_thread_backends().await
}
