//! Completion tokens: the correlation record between one submitted request
//! and the fiber waiting for it.
//!
//! The token's address is the opaque user-data handed to the kernel
//! (`sqe.user_data`, `iocb.aio_data`) or to the dedicated thread. Tokens are
//! boxed inside an [`InFlight`] record so that address stays fixed from
//! submission until `done` is observed, regardless of where the owning
//! future moves.

use std::cell::Cell;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicIsize, Ordering};
use std::task::Waker;

/// Direction of a positioned I/O request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
}

/// A positioned read or write, described by raw parts.
///
/// The buffer is borrowed by the future that owns the request; the pointer
/// stays valid until the request's token is done.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IoRequest {
    pub fd: RawFd,
    pub buf: *mut u8,
    pub len: usize,
    pub offset: u64,
    pub kind: IoKind,
}

impl IoRequest {
    pub(crate) fn read(fd: RawFd, buf: &mut [u8], offset: u64) -> Self {
        IoRequest {
            fd,
            buf: buf.as_mut_ptr(),
            len: buf.len(),
            offset,
            kind: IoKind::Read,
        }
    }

    pub(crate) fn write(fd: RawFd, buf: &[u8], offset: u64) -> Self {
        IoRequest {
            fd,
            buf: buf.as_ptr() as *mut u8,
            len: buf.len(),
            offset,
            kind: IoKind::Write,
        }
    }
}

/// Correlates one in-flight request with its issuing fiber and its result.
///
/// `result_len` and `error_code` follow the positioned-I/O convention: bytes
/// transferred and 0 on success, -1 and a positive errno on failure.
///
/// `waiting_fiber` is only touched on the issuing thread. The other fields
/// are atomics so the dedicated thread can publish a result; `done` is
/// stored with release and loaded with acquire ordering.
pub struct CompletionToken {
    waiting_fiber: Cell<Option<Waker>>,
    result_len: AtomicIsize,
    error_code: AtomicI32,
    done: AtomicBool,
}

impl CompletionToken {
    pub(crate) const fn new() -> Self {
        CompletionToken {
            waiting_fiber: Cell::new(None),
            result_len: AtomicIsize::new(-1),
            error_code: AtomicI32::new(0),
            done: AtomicBool::new(false),
        }
    }

    /// Record the fiber to resume on completion.
    pub(crate) fn set_waiter(&self, waker: &Waker) {
        match self.waiting_fiber.take() {
            Some(w) if w.will_wake(waker) => self.waiting_fiber.set(Some(w)),
            _ => self.waiting_fiber.set(Some(waker.clone())),
        }
    }

    /// Store the result, publish `done` and wake the waiting fiber.
    ///
    /// Must be called on the issuing thread.
    pub(crate) fn complete(&self, result_len: isize, error_code: i32) {
        self.publish(result_len, error_code);
        if let Some(waker) = self.waiting_fiber.take() {
            waker.wake();
        }
    }

    /// Store the result and publish `done` without touching the waiter.
    ///
    /// Safe to call from a thread other than the issuing one.
    pub(crate) fn publish(&self, result_len: isize, error_code: i32) {
        debug_assert!(!self.is_done(), "token completed twice");
        self.result_len.store(result_len, Ordering::Relaxed);
        self.error_code.store(error_code, Ordering::Relaxed);
        self.done.store(true, Ordering::Release);
        crate::metrics::REQUESTS_COMPLETED.increment();
        if error_code != 0 {
            crate::metrics::REQUESTS_FAILED.increment();
        }
    }

    /// Whether the request has completed.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Bytes transferred, or -1 on failure. Meaningful once done.
    pub fn result_len(&self) -> isize {
        self.result_len.load(Ordering::Relaxed)
    }

    /// 0 on success, otherwise a positive errno. Meaningful once done.
    pub fn error_code(&self) -> i32 {
        self.error_code.load(Ordering::Relaxed)
    }

    /// The result in `io::Result` form.
    pub fn result(&self) -> io::Result<usize> {
        match self.error_code() {
            0 => Ok(self.result_len().max(0) as usize),
            errno => Err(io::Error::from_raw_os_error(errno)),
        }
    }

    /// The token's address, as handed to the kernel.
    pub(crate) fn user_data(&self) -> u64 {
        self as *const CompletionToken as u64
    }

    /// Recover a token from kernel user-data.
    ///
    /// # Safety
    /// `user_data` must come from [`user_data`](Self::user_data) of a token
    /// whose request has not been observed done yet.
    pub(crate) unsafe fn from_user_data<'a>(user_data: u64) -> &'a CompletionToken {
        unsafe { &*(user_data as *const CompletionToken) }
    }
}

/// Map a raw kernel result pair to `(result_len, error_code)`.
///
/// Kernel AIO reports failure as a negative errno in `res`; `res2` carries
/// a secondary status that is normally zero.
pub(crate) fn normalize(res: i64, res2: i64) -> (isize, i32) {
    if res < 0 {
        (-1, (-res) as i32)
    } else if res2 != 0 {
        (-1, res2.unsigned_abs() as i32)
    } else {
        (res as isize, 0)
    }
}

/// Backend-native control block that must outlive the kernel's use of it.
pub(crate) enum ControlBlock {
    None,
    Iovec(libc::iovec),
    #[cfg(target_os = "linux")]
    Iocb(crate::backend::aio_abi::Iocb),
    Aiocb(libc::aiocb),
}

/// Heap record for one request: token first, then the request and its
/// native control block.
#[repr(C)]
pub(crate) struct InFlight {
    pub(crate) token: CompletionToken,
    pub(crate) request: IoRequest,
    pub(crate) control: ControlBlock,
}

impl InFlight {
    pub(crate) fn new(request: IoRequest) -> Box<InFlight> {
        Box::new(InFlight {
            token: CompletionToken::new(),
            request,
            control: ControlBlock::None,
        })
    }

    /// Install a single iovec describing the request buffer and return a
    /// pointer to it.
    pub(crate) fn iovec(&mut self) -> *const libc::iovec {
        self.control = ControlBlock::Iovec(libc::iovec {
            iov_base: self.request.buf as *mut libc::c_void,
            iov_len: self.request.len,
        });
        match &self.control {
            ControlBlock::Iovec(iov) => iov as *const libc::iovec,
            _ => unreachable!(),
        }
    }
}
