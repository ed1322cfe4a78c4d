//! Dedicated-thread path: one OS thread outside the fiber scheduler that
//! services requests through its own kernel AIO context.
//!
//! Callers push raw iocb pointers onto a bounded lock-free queue and poll
//! the token's `done` flag. The thread batches submissions, reaps without
//! blocking and publishes each result with a release store. No locks or
//! condition variables are involved on either side.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use crate::backend::aio_abi::{AioContext, IoEvent, Iocb};
use crate::completion::{CompletionToken, ControlBlock, InFlight, IoRequest, normalize};
use crate::config::Config;
use crate::error::{Error, fatal};
use crate::metrics;
use crate::runtime::yield_now;

/// Caller polls this many times between OS-thread yields.
const SPINS_PER_OS_YIELD: u32 = 256;

/// A queued kernel control block.
struct DtRequest(*mut Iocb);

// SAFETY: the iocb lives in a boxed in-flight record whose owner blocks
// (cooperatively) until the dedicated thread publishes its completion.
unsafe impl Send for DtRequest {}

/// Handle to a dedicated I/O thread.
pub struct DedicatedThread {
    queue: Arc<ArrayQueue<DtRequest>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

static GLOBAL: OnceLock<Result<DedicatedThread, String>> = OnceLock::new();

impl DedicatedThread {
    /// Start a dedicated thread with its own kernel AIO context.
    pub fn spawn(config: &Config) -> Result<Self, Error> {
        let max_events = Config::aio_max_events(config.dedicated_batch as u32);
        let ctx = AioContext::new(max_events)
            .map_err(|e| Error::BackendSetup(format!("dedicated io_setup({max_events}): {e}")))?;
        let queue = Arc::new(ArrayQueue::new(config.dedicated_queue_capacity));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            ctx,
            queue: queue.clone(),
            stop: stop.clone(),
            batch: config.dedicated_batch,
        };
        let handle = thread::Builder::new()
            .name("aioline-dt".to_string())
            .spawn(move || worker.run())
            .map_err(Error::Io)?;
        tracing::debug!(
            queue_capacity = config.dedicated_queue_capacity,
            batch = config.dedicated_batch,
            "dedicated I/O thread started"
        );
        Ok(DedicatedThread {
            queue,
            stop,
            handle: Some(handle),
        })
    }

    /// The process-wide instance, started on first use. Never shut down.
    pub fn global(config: &Config) -> Result<&'static DedicatedThread, Error> {
        GLOBAL
            .get_or_init(|| Self::spawn(config).map_err(|e| e.to_string()))
            .as_ref()
            .map_err(|msg| Error::BackendSetup(msg.clone()))
    }

    /// Positioned write through the dedicated thread.
    pub async fn write(&self, fd: RawFd, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.exec(InFlight::new(IoRequest::write(fd, buf, offset)))
            .await
    }

    /// Positioned read through the dedicated thread.
    pub async fn read(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.exec(InFlight::new(IoRequest::read(fd, buf, offset)))
            .await
    }

    async fn exec(&self, mut slot: Box<InFlight>) -> io::Result<usize> {
        if self.stop.load(Ordering::Acquire) {
            return Err(io::Error::other("dedicated I/O thread is shut down"));
        }
        let user_data = slot.token.user_data();
        slot.control = ControlBlock::Iocb(Iocb::for_request(&slot.request, user_data));
        let ControlBlock::Iocb(cb) = &mut slot.control else {
            unreachable!()
        };
        let mut req = DtRequest(cb as *mut Iocb);

        while let Err(back) = self.queue.push(req) {
            req = back;
            metrics::DEDICATED_QUEUE_FULL.increment();
            yield_now().await;
        }
        metrics::REQUESTS_SUBMITTED.increment();
        let pending = PendingGuard(&slot.token);

        let mut spins = 0u32;
        while !pending.0.is_done() {
            spins = spins.wrapping_add(1);
            if spins % SPINS_PER_OS_YIELD == 0 {
                thread::yield_now();
            } else {
                yield_now().await;
            }
        }
        pending.0.result()
    }

    /// Stop the thread after it drains every queued and outstanding request,
    /// then join it.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        if handle.join().is_err() {
            tracing::error!("dedicated I/O thread panicked");
        }
        tracing::debug!("dedicated I/O thread stopped");
    }
}

impl Drop for DedicatedThread {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Aborts if the waiting future is dropped before the thread publishes.
struct PendingGuard<'a>(&'a CompletionToken);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.0.is_done() {
            fatal("dedicated-thread request dropped before completion");
        }
    }
}

/// State owned by the dedicated thread.
struct Worker {
    ctx: AioContext,
    queue: Arc<ArrayQueue<DtRequest>>,
    stop: Arc<AtomicBool>,
    batch: usize,
}

impl Worker {
    fn run(self) {
        let mut unsubmitted: Vec<*mut Iocb> = Vec::with_capacity(self.batch);
        let mut events = vec![IoEvent::default(); self.batch];
        let mut submitted: u64 = 0;
        let mut reaped: u64 = 0;

        loop {
            let mut worked = false;

            while unsubmitted.len() < self.batch {
                match self.queue.pop() {
                    Some(DtRequest(cb)) => unsubmitted.push(cb),
                    None => break,
                }
            }

            if !unsubmitted.is_empty() {
                // SAFETY: each iocb lives in a boxed slot whose owner waits
                // for the published completion.
                match unsafe { self.ctx.submit(&mut unsubmitted) } {
                    Ok(n) => {
                        unsubmitted.drain(..n);
                        submitted += n as u64;
                        worked |= n > 0;
                    }
                    Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => {
                        metrics::SUBMIT_RETRIES.increment();
                    }
                    Err(e) => fatal(format!("dedicated io_submit failed: {e}")),
                }
            }

            if submitted > reaped {
                let n = match self.ctx.get_events(0, &mut events, Some(Duration::ZERO)) {
                    Ok(n) => n,
                    Err(e) if e.raw_os_error() == Some(libc::EINTR) => 0,
                    Err(e) => fatal(format!("dedicated io_getevents failed: {e}")),
                };
                for ev in &events[..n] {
                    let (len, err) = normalize(ev.res, ev.res2);
                    // SAFETY: data is the address of a live token.
                    unsafe { CompletionToken::from_user_data(ev.data) }.publish(len, err);
                }
                metrics::DEDICATED_COMPLETED.add(n as u64);
                reaped += n as u64;
                worked |= n > 0;
            }

            if self.stop.load(Ordering::Acquire)
                && unsubmitted.is_empty()
                && self.queue.is_empty()
                && submitted == reaped
            {
                break;
            }
            if !worked {
                thread::yield_now();
            }
        }
        // ctx is destroyed when self drops.
    }
}
