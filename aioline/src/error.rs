use std::io;

use thiserror::Error;

/// Errors returned by aioline setup and dispatch.
///
/// Request-level failures (a read that hit `EIO`, a bad descriptor) are not
/// represented here; they come back to the issuing fiber as [`io::Error`].
#[derive(Debug, Error)]
pub enum Error {
    /// A system call failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A backend context (ring, kernel AIO context) could not be created.
    #[error("backend setup: {0}")]
    BackendSetup(String),
    /// The requested provider is not available on this platform or build.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// A configuration value is out of range.
    #[error("invalid config: {0}")]
    Config(String),
    /// A fiber-only operation was used outside a [`FiberRuntime`](crate::FiberRuntime).
    #[error("no fiber runtime on this thread")]
    NoRuntime,
}

/// Log `msg` and terminate the process.
///
/// Used when a kernel-resident completion context can no longer be trusted:
/// unexpected submit/reap errors, teardown with outstanding requests, or a
/// token freed while the kernel still holds its address.
#[cold]
#[track_caller]
pub fn fatal(msg: impl std::fmt::Display) -> ! {
    let location = std::panic::Location::caller();
    tracing::error!(%location, "fatal: {msg}");
    eprintln!("aioline fatal error at {location}: {msg}");
    std::process::abort()
}

/// Unwrap a setup result or terminate the process.
#[track_caller]
pub(crate) fn or_fatal<T>(result: Result<T, Error>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => fatal(e),
    }
}

/// Current `errno` as a positive integer.
pub(crate) fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        let err: Error = io::Error::from_raw_os_error(libc::EBADF).into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().starts_with("I/O error"));
    }

    #[test]
    fn messages_name_the_problem() {
        let err = Error::Unsupported("legacy-aio requires Linux".into());
        assert_eq!(err.to_string(), "unsupported: legacy-aio requires Linux");
        assert_eq!(Error::NoRuntime.to_string(), "no fiber runtime on this thread");
    }

    #[test]
    fn or_fatal_passes_values_through() {
        assert_eq!(or_fatal(Ok::<_, Error>(7)), 7);
    }
}
