//! aioline: fiber-cooperative asynchronous file I/O.
//!
//! aioline lets many cooperatively scheduled fibers on one OS thread issue
//! positioned reads and writes without blocking that thread. A request is
//! handed to a kernel async I/O facility (io_uring, Linux kernel AIO or
//! POSIX AIO); the issuing fiber suspends, and a per-thread reaper fiber
//! collects completions and resumes it.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::os::fd::AsRawFd;
//!
//! let file = std::fs::File::open("/etc/hostname").unwrap();
//! let fd = file.as_raw_fd();
//!
//! let mut rt = aioline::FiberRuntime::new();
//! let n = rt.block_on(async move {
//!     let mut buf = vec![0u8; 4096];
//!     aioline::read(fd, &mut buf, 0).await
//! });
//! println!("read {} bytes", n.unwrap());
//! ```
//!
//! # Providers
//!
//! The provider is chosen once per [`Dispatcher`], from
//! `AIOLINE_IO_PROVIDER` for the default one: `ring` (the default),
//! `legacy-aio`, `posix` or `synchronous`. A ring request on a kernel older
//! than 5.1, or on a build without the `uring` feature, falls back to POSIX
//! AIO.
//!
//! # Platform
//!
//! Linux for the ring and legacy-AIO providers and for
//! [`durable_write`]/[`durable_read`]; any unix for POSIX AIO and the
//! synchronous provider.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod backend;
pub(crate) mod completion;
pub(crate) mod metrics;
pub(crate) mod reaper;
pub(crate) mod runtime;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
#[cfg(target_os = "linux")]
pub mod dedicated;
pub mod dispatch;
pub mod error;
pub mod prefetch;
pub mod provider;

// ── Re-exports: Fiber runtime ───────────────────────────────────────────

/// Single-threaded cooperative executor for fibers.
pub use runtime::FiberRuntime;
/// Future returned by [`yield_now()`].
pub use runtime::YieldNow;
/// The fiber currently being polled on this thread.
pub use runtime::current_fiber;
/// Whether a [`FiberRuntime`] is driving this thread.
pub use runtime::in_runtime;
/// Spawn a fiber on the current thread's runtime.
pub use runtime::spawn;
/// Opaque handle for a spawned fiber.
pub use runtime::task::FiberId;
/// Suspend the current fiber once.
pub use runtime::yield_now;

// ── Re-exports: I/O entry points ────────────────────────────────────────

/// Routes positioned I/O to the selected provider.
pub use dispatch::Dispatcher;
/// Positioned read through the dedicated thread.
pub use dispatch::durable_read;
/// Positioned write through the dedicated thread.
pub use dispatch::durable_write;
/// Install the process-wide default [`Dispatcher`].
pub use dispatch::install;
/// Advisory readahead for a memory-mapped range.
pub use dispatch::prefetch_hint;
/// Positioned read through the default dispatcher.
pub use dispatch::read;
/// Drain and stop this thread's reapers.
pub use dispatch::teardown;
/// Positioned write through the default dispatcher.
pub use dispatch::write;

// ── Re-exports: Shared types ────────────────────────────────────────────

/// Backend kinds served by a reaper.
pub use backend::BackendKind;
/// Correlation record between a request and its result.
pub use completion::CompletionToken;
/// Direction of a positioned request.
pub use completion::IoKind;
/// Dispatcher configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Dedicated I/O thread with its own kernel AIO context.
#[cfg(target_os = "linux")]
pub use dedicated::DedicatedThread;
/// Errors returned by setup and dispatch.
pub use error::Error;
/// Log and abort on an unrecoverable condition.
pub use error::fatal;
/// What the running platform and build can do.
pub use provider::Capabilities;
/// Kernel release number.
pub use provider::KernelVersion;
/// The backend serving requests.
pub use provider::Provider;
/// Outcome of provider selection.
pub use provider::Selection;
/// Provider decision policy.
pub use provider::select_provider;
/// Reaper lifecycle state.
pub use reaper::ReaperState;
