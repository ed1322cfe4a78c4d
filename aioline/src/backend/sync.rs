//! Synchronous backend: `pread`/`pwrite` on the calling thread.
//!
//! No context, no reaper and no suspension. Works with or without a fiber
//! runtime.

use std::io;
use std::os::fd::RawFd;

use crate::metrics;

/// Positioned read, retried on `EINTR`.
pub(crate) fn read(fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    loop {
        // SAFETY: buf is valid for buf.len() writable bytes.
        let ret = unsafe {
            libc::pread(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        match check(ret) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return record(other),
        }
    }
}

/// Positioned write, retried on `EINTR`.
pub(crate) fn write(fd: RawFd, buf: &[u8], offset: u64) -> io::Result<usize> {
    loop {
        // SAFETY: buf is valid for buf.len() readable bytes.
        let ret = unsafe {
            libc::pwrite(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        match check(ret) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return record(other),
        }
    }
}

fn check(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Count a finished request the way the asynchronous backends do.
fn record(result: io::Result<usize>) -> io::Result<usize> {
    metrics::REQUESTS_SUBMITTED.increment();
    metrics::REQUESTS_COMPLETED.increment();
    if result.is_err() {
        metrics::REQUESTS_FAILED.increment();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn positioned_round_trip() {
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        assert_eq!(write(fd, b"abcdef", 10).unwrap(), 6);

        let mut buf = [0u8; 4];
        assert_eq!(read(fd, &mut buf, 12).unwrap(), 4);
        assert_eq!(&buf, b"cdef");

        // Past end of file.
        assert_eq!(read(fd, &mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn bad_descriptor() {
        let mut buf = [0u8; 4];
        let err = read(-1, &mut buf, 0).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn failures_are_counted() {
        // Counters are process-wide; other tests only ever add to them.
        let failed = metrics::REQUESTS_FAILED.value();
        let completed = metrics::REQUESTS_COMPLETED.value();
        assert!(write(-1, b"x", 0).is_err());
        assert!(metrics::REQUESTS_FAILED.value() > failed);
        assert!(metrics::REQUESTS_COMPLETED.value() > completed);
    }
}
