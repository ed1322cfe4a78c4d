use std::io;

use io_uring::types::Fd;
use io_uring::{IoUring, Probe, opcode, squeue};

use crate::backend::{BackendDriver, BackendKind, Submit};
use crate::completion::{CompletionToken, InFlight, IoKind};
use crate::config::Config;
use crate::error::{Error, fatal};
use crate::provider::KernelVersion;

/// io_uring driver. One SQE per request, `user_data` = token address.
///
/// `queued` counts SQEs pushed but not yet submitted to the kernel;
/// `outstanding` counts every request whose CQE has not been reaped yet,
/// queued ones included.
pub(crate) struct RingDriver {
    ring: IoUring,
    vectored: bool,
    queued: usize,
    outstanding: usize,
}

impl BackendDriver for RingDriver {
    const KIND: BackendKind = BackendKind::Ring;

    fn setup(config: &Config) -> Result<Self, Error> {
        let ring = IoUring::builder()
            .build(config.ring_queue_depth)
            .map_err(|e| {
                Error::BackendSetup(format!("io_uring_setup({}): {e}", config.ring_queue_depth))
            })?;
        let vectored = config.ring_force_vectored || !rw_opcodes_supported(&ring);
        tracing::debug!(
            entries = config.ring_queue_depth,
            vectored,
            "io_uring instance created"
        );
        Ok(RingDriver {
            ring,
            vectored,
            queued: 0,
            outstanding: 0,
        })
    }

    unsafe fn submit(&mut self, slot: *mut InFlight) -> Submit {
        let slot = unsafe { &mut *slot };
        let entry = self.build_entry(slot);

        // SAFETY: the entry's buffer, and its iovec when vectored, live in
        // (or are borrowed by) the boxed slot until the CQE is reaped.
        if unsafe { self.ring.submission().push(&entry) }.is_err() {
            // SQ full: flush and collect what we can, then try once more.
            self.submit_pending(0);
            self.drain_completions();
            if unsafe { self.ring.submission().push(&entry) }.is_err() {
                return Submit::Busy;
            }
        }
        self.queued += 1;
        self.outstanding += 1;
        Submit::Submitted
    }

    fn reap(&mut self, may_block: bool) -> usize {
        if self.queued > 0 {
            let nothing_in_kernel = self.outstanding == self.queued;
            self.submit_pending(usize::from(nothing_in_kernel && may_block));
        } else if self.outstanding > 0 && may_block {
            self.submit_pending(1);
        }
        self.drain_completions()
    }

    fn outstanding(&self) -> usize {
        self.outstanding
    }
}

impl RingDriver {
    fn build_entry(&self, slot: &mut InFlight) -> squeue::Entry {
        let user_data = slot.token.user_data();
        let req = slot.request;
        let fd = Fd(req.fd);
        // Reads and writes longer than u32::MAX come back short.
        let len = req.len.min(u32::MAX as usize) as u32;
        let entry = if self.vectored {
            let iov = slot.iovec();
            match req.kind {
                IoKind::Read => opcode::Readv::new(fd, iov, 1).offset(req.offset).build(),
                IoKind::Write => opcode::Writev::new(fd, iov, 1).offset(req.offset).build(),
            }
        } else {
            match req.kind {
                IoKind::Read => opcode::Read::new(fd, req.buf, len).offset(req.offset).build(),
                IoKind::Write => opcode::Write::new(fd, req.buf, len).offset(req.offset).build(),
            }
        };
        entry.user_data(user_data)
    }

    /// Submit queued SQEs, waiting for `want` completions.
    fn submit_pending(&mut self, want: usize) {
        match self.ring.submit_and_wait(want) {
            Ok(n) => self.queued -= n.min(self.queued),
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::EAGAIN | libc::EBUSY | libc::EINTR)
                ) =>
            {
                crate::metrics::SUBMIT_RETRIES.increment();
            }
            Err(e) => fatal(format!("io_uring_enter failed: {e}")),
        }
    }

    /// Deliver every available CQE to its token.
    fn drain_completions(&mut self) -> usize {
        let mut n = 0;
        for cqe in self.ring.completion() {
            // SAFETY: user_data is the token address set in build_entry.
            let token = unsafe { CompletionToken::from_user_data(cqe.user_data()) };
            let res = cqe.result();
            if res >= 0 {
                token.complete(res as isize, 0);
            } else if res == -libc::EAGAIN {
                token.complete(-1, libc::EAGAIN);
            } else {
                fatal(format!(
                    "io_uring completion failed: {}",
                    io::Error::from_raw_os_error(-res)
                ));
            }
            n += 1;
        }
        self.outstanding -= n;
        n
    }
}

/// Whether the kernel has `IORING_OP_READ`/`IORING_OP_WRITE`.
fn rw_opcodes_supported(ring: &IoUring) -> bool {
    if !KernelVersion::current().is_some_and(|k| k >= KernelVersion::RING_RW_OPCODES) {
        return false;
    }
    let mut probe = Probe::new();
    if ring.submitter().register_probe(&mut probe).is_err() {
        return false;
    }
    probe.is_supported(opcode::Read::CODE) && probe.is_supported(opcode::Write::CODE)
}
