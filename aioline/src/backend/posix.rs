use std::ptr;
use std::sync::Once;

use crate::backend::{BackendDriver, BackendKind, Submit};
use crate::completion::{CompletionToken, ControlBlock, InFlight, IoKind};
use crate::config::Config;
use crate::error::{Error, last_errno};

/// POSIX AIO driver.
///
/// `blocks[i]` and `tokens[i]` describe the same request. Finished entries
/// are nulled in place and compacted away once they make up more than a
/// quarter of the list; `aio_suspend` skips null entries.
pub(crate) struct PosixDriver {
    blocks: Vec<*const libc::aiocb>,
    tokens: Vec<*const CompletionToken>,
    live: usize,
}

#[cfg(target_env = "gnu")]
mod glibc {
    /// glibc's `struct aioinit`.
    #[repr(C)]
    #[derive(Default)]
    pub(super) struct AioInit {
        pub aio_threads: libc::c_int,
        pub aio_num: libc::c_int,
        pub aio_locks: libc::c_int,
        pub aio_usedba: libc::c_int,
        pub aio_debug: libc::c_int,
        pub aio_numusers: libc::c_int,
        pub aio_idle_time: libc::c_int,
        pub aio_reserved: libc::c_int,
    }

    unsafe extern "C" {
        pub(super) fn aio_init(init: *const AioInit);
    }
}

static AIO_INIT: Once = Once::new();

/// Size glibc's AIO thread pool, once per process.
fn init_thread_pool(threads: u32) {
    if threads == 0 {
        return;
    }
    AIO_INIT.call_once(|| {
        #[cfg(target_env = "gnu")]
        {
            let init = glibc::AioInit {
                aio_threads: threads.min(i32::MAX as u32) as libc::c_int,
                aio_num: 64,
                ..Default::default()
            };
            // SAFETY: init is a valid aioinit for the duration of the call.
            unsafe { glibc::aio_init(&init) };
            tracing::debug!(threads, "posix AIO thread pool sized");
        }
        #[cfg(not(target_env = "gnu"))]
        tracing::debug!(threads, "posix AIO thread count ignored on this libc");
    });
}

impl BackendDriver for PosixDriver {
    const KIND: BackendKind = BackendKind::Posix;

    fn setup(config: &Config) -> Result<Self, Error> {
        init_thread_pool(config.posix_aio_threads);
        Ok(PosixDriver {
            blocks: Vec::with_capacity(64),
            tokens: Vec::with_capacity(64),
            live: 0,
        })
    }

    unsafe fn submit(&mut self, slot: *mut InFlight) -> Submit {
        let slot = unsafe { &mut *slot };
        let req = slot.request;
        // SAFETY: aiocb is plain old data; all-zero is a valid initial state
        // (SIGEV_NONE is 1 on Linux, so it is set explicitly).
        let mut cb: libc::aiocb = unsafe { std::mem::zeroed() };
        cb.aio_fildes = req.fd;
        cb.aio_buf = req.buf as *mut libc::c_void;
        cb.aio_nbytes = req.len;
        cb.aio_offset = req.offset as libc::off_t;
        cb.aio_sigevent.sigev_notify = libc::SIGEV_NONE;
        slot.control = ControlBlock::Aiocb(cb);
        let ControlBlock::Aiocb(cb) = &mut slot.control else {
            unreachable!()
        };

        // SAFETY: cb lives in the boxed slot until the token is done.
        let ret = unsafe {
            match req.kind {
                IoKind::Read => libc::aio_read(cb),
                IoKind::Write => libc::aio_write(cb),
            }
        };
        if ret != 0 {
            return match last_errno() {
                libc::EAGAIN => Submit::Busy,
                errno => Submit::Failed(errno),
            };
        }
        self.blocks.push(cb as *const libc::aiocb);
        self.tokens.push(&slot.token);
        self.live += 1;
        Submit::Submitted
    }

    fn reap(&mut self, may_block: bool) -> usize {
        if self.live == 0 {
            return 0;
        }
        if may_block {
            // SAFETY: every non-null entry points at a submitted aiocb.
            let ret = unsafe {
                libc::aio_suspend(
                    self.blocks.as_ptr(),
                    self.blocks.len() as libc::c_int,
                    ptr::null(),
                )
            };
            if ret != 0 && !matches!(last_errno(), libc::EINTR | libc::EAGAIN) {
                crate::error::fatal(format!(
                    "aio_suspend failed: {}",
                    std::io::Error::last_os_error()
                ));
            }
        }

        let mut completed = 0;
        for i in 0..self.blocks.len() {
            let cb = self.blocks[i];
            if cb.is_null() {
                continue;
            }
            // SAFETY: cb points at a submitted aiocb whose slot is alive.
            let err = unsafe { libc::aio_error(cb) };
            if err == libc::EINPROGRESS {
                continue;
            }
            let ret = unsafe { libc::aio_return(cb as *mut libc::aiocb) };
            let token = unsafe { &*self.tokens[i] };
            self.blocks[i] = ptr::null();
            self.tokens[i] = ptr::null();
            self.live -= 1;
            completed += 1;
            match err {
                0 => token.complete(ret as isize, 0),
                e if e > 0 => token.complete(-1, e),
                _ => token.complete(-1, last_errno()),
            }
        }

        let stale = self.blocks.len() - self.live;
        if stale > self.blocks.len() / 4 {
            self.compact();
        }
        completed
    }

    fn outstanding(&self) -> usize {
        self.live
    }
}

impl PosixDriver {
    fn compact(&mut self) {
        let mut keep = 0;
        for i in 0..self.blocks.len() {
            if !self.blocks[i].is_null() {
                self.blocks[keep] = self.blocks[i];
                self.tokens[keep] = self.tokens[i];
                keep += 1;
            }
        }
        self.blocks.truncate(keep);
        self.tokens.truncate(keep);
    }
}
