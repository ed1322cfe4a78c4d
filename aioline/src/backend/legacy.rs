use std::time::Duration;

use crate::backend::aio_abi::{AioContext, IoEvent, Iocb};
use crate::backend::{BackendDriver, BackendKind, Submit};
use crate::completion::{CompletionToken, ControlBlock, InFlight, normalize};
use crate::config::Config;
use crate::error::{Error, fatal};

/// Linux kernel AIO driver: one `io_submit` per request, batched
/// `io_getevents` reaps.
pub(crate) struct LegacyDriver {
    ctx: AioContext,
    events: Vec<IoEvent>,
    in_flight: usize,
}

impl BackendDriver for LegacyDriver {
    const KIND: BackendKind = BackendKind::LegacyAio;

    fn setup(config: &Config) -> Result<Self, Error> {
        let max_events = Config::aio_max_events(config.aio_reap_batch);
        let ctx = AioContext::new(max_events)
            .map_err(|e| Error::BackendSetup(format!("io_setup({max_events}): {e}")))?;
        tracing::debug!(max_events, "kernel AIO context created");
        Ok(LegacyDriver {
            ctx,
            events: vec![IoEvent::default(); config.aio_reap_batch as usize],
            in_flight: 0,
        })
    }

    unsafe fn submit(&mut self, slot: *mut InFlight) -> Submit {
        let slot = unsafe { &mut *slot };
        slot.control = ControlBlock::Iocb(Iocb::for_request(&slot.request, slot.token.user_data()));
        let ControlBlock::Iocb(cb) = &mut slot.control else {
            unreachable!()
        };
        let mut list = [cb as *mut Iocb];
        match unsafe { self.ctx.submit(&mut list) } {
            Ok(1) => {
                self.in_flight += 1;
                Submit::Submitted
            }
            Ok(_) => Submit::Busy,
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => Submit::Busy,
            Err(e) => {
                tracing::debug!(error = %e, fd = slot.request.fd, "io_submit rejected request");
                Submit::Failed(e.raw_os_error().unwrap_or(libc::EIO))
            }
        }
    }

    fn reap(&mut self, may_block: bool) -> usize {
        let mut total = 0;
        loop {
            let block = may_block && total == 0 && self.in_flight > 0;
            let (min_nr, timeout) = if block {
                (1, None)
            } else {
                (0, Some(Duration::ZERO))
            };
            let n = match self.ctx.get_events(min_nr, &mut self.events, timeout) {
                Ok(n) => n,
                Err(e) if matches!(e.raw_os_error(), Some(libc::EINTR | libc::EAGAIN)) => break,
                Err(e) => fatal(format!("io_getevents failed: {e}")),
            };
            for ev in &self.events[..n] {
                let (len, err) = normalize(ev.res, ev.res2);
                // SAFETY: data is the token address set in submit; the slot
                // stays alive until the token is done.
                unsafe { CompletionToken::from_user_data(ev.data) }.complete(len, err);
            }
            self.in_flight -= n;
            total += n;
            if n < self.events.len() {
                break;
            }
        }
        total
    }

    fn outstanding(&self) -> usize {
        self.in_flight
    }
}
