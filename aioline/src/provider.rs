//! Provider selection: which backend serves positioned I/O.
//!
//! Split into a capability probe ([`Capabilities::probe`]) and a pure
//! decision policy ([`select_provider`]) so the policy can be exercised
//! against simulated kernels.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// The backend serving requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    /// `pread`/`pwrite` on the calling thread.
    Synchronous,
    /// POSIX AIO (`aio_read`/`aio_write`).
    Posix,
    /// Linux kernel AIO (`io_submit`/`io_getevents`).
    LegacyAio,
    /// io_uring.
    Ring,
}

impl Provider {
    /// Canonical name, as accepted by `AIOLINE_IO_PROVIDER`.
    pub fn name(&self) -> &'static str {
        match self {
            Provider::Synchronous => "synchronous",
            Provider::Posix => "posix",
            Provider::LegacyAio => "legacy-aio",
            Provider::Ring => "ring",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synchronous" | "sync" => Ok(Provider::Synchronous),
            "posix" => Ok(Provider::Posix),
            "legacy-aio" | "legacy_aio" | "aio" => Ok(Provider::LegacyAio),
            "ring" | "uring" | "io_uring" | "io-uring" => Ok(Provider::Ring),
            other => Err(Error::Config(format!("unknown provider {other:?}"))),
        }
    }
}

/// Kernel release as `(major, minor, patch)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KernelVersion {
    /// First kernel with io_uring.
    pub const RING_MIN: KernelVersion = KernelVersion::new(5, 1, 0);
    /// First kernel with `IORING_OP_READ`/`IORING_OP_WRITE`.
    pub const RING_RW_OPCODES: KernelVersion = KernelVersion::new(5, 6, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        KernelVersion {
            major,
            minor,
            patch,
        }
    }

    /// Parse a `uname -r` style release such as `6.1.0-18-amd64`.
    ///
    /// Missing components are zero; trailing text after each number is
    /// ignored. Returns `None` if not even a major number is present.
    pub fn parse(release: &str) -> Option<Self> {
        let mut parts = release.split('.').map(|p| {
            let digits: &str = &p[..p.find(|c: char| !c.is_ascii_digit()).unwrap_or(p.len())];
            digits.parse::<u32>().ok()
        });
        let major = parts.next().flatten()?;
        let minor = parts.next().flatten().unwrap_or(0);
        let patch = parts.next().flatten().unwrap_or(0);
        Some(KernelVersion::new(major, minor, patch))
    }

    /// Version of the running kernel, from `uname(2)`.
    pub fn current() -> Option<Self> {
        #[cfg(unix)]
        {
            // SAFETY: utsname is plain old data; uname fills it in.
            let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
            if unsafe { libc::uname(&mut uts) } != 0 {
                return None;
            }
            // SAFETY: uname NUL-terminates release.
            let release = unsafe { std::ffi::CStr::from_ptr(uts.release.as_ptr()) };
            Self::parse(&release.to_string_lossy())
        }
        #[cfg(not(unix))]
        {
            None
        }
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// What the running platform and build can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Running kernel; `None` when it could not be determined.
    pub kernel: Option<KernelVersion>,
    /// io_uring support was compiled in (cargo feature `uring`).
    pub ring_compiled: bool,
    /// Linux kernel AIO is available (`io_setup` succeeds).
    pub legacy_aio: bool,
    /// POSIX AIO is available.
    pub posix_aio: bool,
}

impl Capabilities {
    pub fn probe() -> Self {
        Capabilities {
            kernel: KernelVersion::current(),
            ring_compiled: cfg!(all(feature = "uring", target_os = "linux")),
            legacy_aio: legacy_aio_available(),
            posix_aio: cfg!(unix),
        }
    }

    /// Whether the kernel is new enough for io_uring at all.
    pub fn ring_kernel(&self) -> bool {
        self.kernel.is_some_and(|k| k >= KernelVersion::RING_MIN)
    }
}

#[cfg(target_os = "linux")]
fn legacy_aio_available() -> bool {
    crate::backend::aio_abi::kernel_aio_available()
}

#[cfg(not(target_os = "linux"))]
fn legacy_aio_available() -> bool {
    false
}

/// Decide which provider serves requests.
///
/// * no request: ring;
/// * ring: downgraded to POSIX when not compiled in or the kernel predates
///   io_uring;
/// * legacy-aio / posix on a platform without them: `Unsupported`.
pub fn select_provider(
    requested: Option<Provider>,
    caps: &Capabilities,
) -> Result<Provider, Error> {
    match requested.unwrap_or(Provider::Ring) {
        Provider::Ring => {
            if caps.ring_compiled && caps.ring_kernel() {
                return Ok(Provider::Ring);
            }
            let reason = if caps.ring_compiled {
                "kernel predates io_uring"
            } else {
                "io_uring support not compiled in"
            };
            if !caps.posix_aio {
                return Err(Error::Unsupported(format!(
                    "ring provider unavailable ({reason}) and no POSIX AIO fallback"
                )));
            }
            tracing::warn!(
                kernel = ?caps.kernel,
                reason,
                "ring provider unavailable, falling back to posix"
            );
            crate::metrics::PROVIDER_DOWNGRADES.increment();
            Ok(Provider::Posix)
        }
        Provider::LegacyAio if !caps.legacy_aio => Err(Error::Unsupported(
            "legacy-aio provider requires Linux kernel AIO".into(),
        )),
        Provider::Posix if !caps.posix_aio => Err(Error::Unsupported(
            "posix provider requires POSIX AIO".into(),
        )),
        other => Ok(other),
    }
}

/// The outcome of provider selection, immutable once computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    /// What the configuration asked for.
    pub requested: Option<Provider>,
    /// What will actually serve requests.
    pub provider: Provider,
    pub capabilities: Capabilities,
}

impl Selection {
    /// Probe the platform and apply [`select_provider`].
    pub fn resolve(requested: Option<Provider>) -> Result<Self, Error> {
        Self::resolve_with(requested, Capabilities::probe())
    }

    pub fn resolve_with(requested: Option<Provider>, capabilities: Capabilities) -> Result<Self, Error> {
        let provider = select_provider(requested, &capabilities)?;
        tracing::info!(
            requested = requested.map(|p| p.name()).unwrap_or("default"),
            %provider,
            "selected I/O provider"
        );
        Ok(Selection {
            requested,
            provider,
            capabilities,
        })
    }

    /// Whether the dedicated-thread path (`durable_*`) is usable.
    pub fn durable_supported(&self) -> bool {
        self.capabilities.legacy_aio && self.provider != Provider::Synchronous
    }
}
