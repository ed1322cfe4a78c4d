//! Advisory prefetch for memory-mapped ranges.

use std::sync::OnceLock;

use crate::metrics;
use crate::runtime::yield_now;

/// Pages probed with `mincore` before deciding to advise.
const MAX_PROBED_PAGES: usize = 8;

fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 { sz as usize } else { 4096 }
    })
}

/// Page-aligned `(start, len)` covering `[addr, addr + len)`.
fn page_span(addr: usize, len: usize, page: usize) -> (usize, usize) {
    let start = addr & !(page - 1);
    let end = (addr + len).div_ceil(page) * page;
    (start, end - start)
}

/// Whether any of the first few pages of the span is not resident.
/// `None` when residency could not be determined.
fn probe_non_resident(start: usize, len: usize, page: usize) -> Option<bool> {
    let pages = (len / page).min(MAX_PROBED_PAGES);
    let mut vec = [0u8; MAX_PROBED_PAGES];
    // SAFETY: start is page-aligned and vec has room for `pages` entries.
    let ret = unsafe {
        libc::mincore(
            start as *mut libc::c_void,
            pages * page,
            vec.as_mut_ptr() as *mut _,
        )
    };
    if ret != 0 {
        return None;
    }
    Some(vec[..pages].iter().any(|v| v & 1 == 0))
}

/// Hint that `buf` (typically part of a memory-mapped file) will be read
/// soon.
///
/// If any of the first pages is not resident, advise the kernel to read
/// the whole range ahead and yield the calling fiber once so the readahead
/// can start before the caller faults. Never fails and never yields more
/// than once.
pub async fn prefetch_hint(buf: &[u8]) {
    if buf.is_empty() {
        return;
    }
    let page = page_size();
    let (start, len) = page_span(buf.as_ptr() as usize, buf.len(), page);
    if probe_non_resident(start, len, page) != Some(true) {
        return;
    }
    // SAFETY: advisory only; the range covers pages backing `buf`.
    let ret = unsafe {
        libc::posix_madvise(start as *mut libc::c_void, len, libc::POSIX_MADV_WILLNEED)
    };
    if ret != 0 {
        tracing::debug!(errno = ret, "posix_madvise(WILLNEED) failed");
        return;
    }
    metrics::PREFETCH_ADVISED.increment();
    yield_now().await;
}
