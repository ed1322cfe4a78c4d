//! Linux kernel AIO ABI: `struct iocb`, `struct io_event` and the
//! `io_setup`/`io_submit`/`io_getevents`/`io_destroy` syscalls.
//!
//! glibc does not wrap these, so they are issued through `libc::syscall`.
//! Shared by the legacy-AIO driver and the dedicated thread.

use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::time::Duration;

use crate::completion::{IoKind, IoRequest};

pub(crate) const IOCB_CMD_PREAD: u16 = 0;
pub(crate) const IOCB_CMD_PWRITE: u16 = 1;

/// Kernel AIO context handle (`aio_context_t`).
type AioContextId = libc::c_ulong;

/// Mirror of the kernel's `struct iocb` (64 bytes).
#[allow(dead_code)]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Iocb {
    /// Returned untouched in `io_event.data`.
    pub aio_data: u64,
    #[cfg(target_endian = "little")]
    pub aio_key: u32,
    #[cfg(target_endian = "little")]
    pub aio_rw_flags: i32,
    #[cfg(target_endian = "big")]
    pub aio_rw_flags: i32,
    #[cfg(target_endian = "big")]
    pub aio_key: u32,
    pub aio_lio_opcode: u16,
    pub aio_reqprio: i16,
    pub aio_fildes: u32,
    pub aio_buf: u64,
    pub aio_nbytes: u64,
    pub aio_offset: i64,
    pub aio_reserved2: u64,
    pub aio_flags: u32,
    pub aio_resfd: u32,
}

impl Iocb {
    /// Positioned read or write of `request`, tagged with `user_data`.
    pub(crate) fn for_request(request: &IoRequest, user_data: u64) -> Self {
        let opcode = match request.kind {
            IoKind::Read => IOCB_CMD_PREAD,
            IoKind::Write => IOCB_CMD_PWRITE,
        };
        Self::new(opcode, request.fd, request.buf, request.len, request.offset, user_data)
    }

    pub(crate) fn new(
        opcode: u16,
        fd: RawFd,
        buf: *mut u8,
        len: usize,
        offset: u64,
        user_data: u64,
    ) -> Self {
        Iocb {
            aio_data: user_data,
            aio_lio_opcode: opcode,
            aio_fildes: fd as u32,
            aio_buf: buf as u64,
            aio_nbytes: len as u64,
            aio_offset: offset as i64,
            ..Default::default()
        }
    }
}

/// Mirror of the kernel's `struct io_event`.
#[allow(dead_code)]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct IoEvent {
    /// `aio_data` of the completed iocb.
    pub data: u64,
    /// Address of the completed iocb.
    pub obj: u64,
    /// Bytes transferred, or a negative errno.
    pub res: i64,
    pub res2: i64,
}

/// A kernel AIO context, destroyed on drop.
pub(crate) struct AioContext {
    id: AioContextId,
}

impl AioContext {
    /// `io_setup(max_events)`.
    pub(crate) fn new(max_events: u32) -> io::Result<Self> {
        let mut id: AioContextId = 0;
        // SAFETY: io_setup writes the new context id through the pointer.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_setup,
                max_events as libc::c_long,
                &mut id as *mut AioContextId,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(AioContext { id })
    }

    /// `io_submit`. Returns how many of `iocbs` the kernel accepted, which
    /// may be fewer than all of them.
    ///
    /// # Safety
    /// Every pointed-to iocb, and the buffer it describes, must stay valid
    /// until its event is reaped.
    pub(crate) unsafe fn submit(&self, iocbs: &mut [*mut Iocb]) -> io::Result<usize> {
        if iocbs.is_empty() {
            return Ok(0);
        }
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_submit,
                self.id,
                iocbs.len() as libc::c_long,
                iocbs.as_mut_ptr(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    /// `io_getevents`. `timeout = None` blocks until `min_nr` events are
    /// available; `Some(Duration::ZERO)` never blocks.
    pub(crate) fn get_events(
        &self,
        min_nr: usize,
        events: &mut [IoEvent],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(ptr::null(), |t| t as *const libc::timespec);
        // SAFETY: events is a writable buffer of events.len() entries.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_getevents,
                self.id,
                min_nr as libc::c_long,
                events.len() as libc::c_long,
                events.as_mut_ptr(),
                ts_ptr,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }
}

impl Drop for AioContext {
    fn drop(&mut self) {
        // SAFETY: id came from io_setup and is destroyed exactly once.
        let ret = unsafe { libc::syscall(libc::SYS_io_destroy, self.id) };
        if ret < 0 {
            crate::error::fatal(format!(
                "io_destroy failed: {}",
                io::Error::last_os_error()
            ));
        }
    }
}

/// Whether the running kernel accepts `io_setup`.
pub(crate) fn kernel_aio_available() -> bool {
    AioContext::new(1).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    #[test]
    fn abi_sizes() {
        assert_eq!(std::mem::size_of::<Iocb>(), 64);
        assert_eq!(std::mem::size_of::<IoEvent>(), 32);
    }

    #[test]
    fn iocb_for_request() {
        let mut buf = [0u8; 16];
        let req = IoRequest::read(5, &mut buf, 4096);
        let cb = Iocb::for_request(&req, 0xdead_beef);
        assert_eq!(cb.aio_data, 0xdead_beef);
        assert_eq!(cb.aio_lio_opcode, IOCB_CMD_PREAD);
        assert_eq!(cb.aio_fildes, 5);
        assert_eq!(cb.aio_nbytes, 16);
        assert_eq!(cb.aio_offset, 4096);
        assert_eq!(cb.aio_buf, buf.as_ptr() as u64);

        let wreq = IoRequest::write(5, &buf, 0);
        assert_eq!(Iocb::for_request(&wreq, 0).aio_lio_opcode, IOCB_CMD_PWRITE);
    }

    #[test]
    fn read_through_context() {
        let Ok(ctx) = AioContext::new(8) else {
            eprintln!("SKIP: kernel AIO not available");
            return;
        };
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"hello kernel aio").unwrap();

        let mut buf = [0u8; 6];
        let mut cb = Iocb::new(
            IOCB_CMD_PREAD,
            file.as_raw_fd(),
            buf.as_mut_ptr(),
            buf.len(),
            6,
            42,
        );
        let mut list = [&mut cb as *mut Iocb];
        assert_eq!(unsafe { ctx.submit(&mut list) }.unwrap(), 1);

        let mut events = [IoEvent::default(); 4];
        let n = ctx.get_events(1, &mut events, None).unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].data, 42);
        assert_eq!(events[0].res, 6);
        assert_eq!(&buf, b"kernel");
    }

    #[test]
    fn nonblocking_reap_on_idle_context() {
        let Ok(ctx) = AioContext::new(4) else {
            eprintln!("SKIP: kernel AIO not available");
            return;
        };
        let mut events = [IoEvent::default(); 4];
        assert_eq!(
            ctx.get_events(0, &mut events, Some(Duration::ZERO)).unwrap(),
            0
        );
    }
}
