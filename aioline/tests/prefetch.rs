//! Integration tests: prefetch hints over memory-mapped files never fail
//! and suspend the caller at most once.

use std::cell::Cell;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::rc::Rc;

use aioline::{FiberRuntime, prefetch_hint, spawn, yield_now};

/// Read-only shared mapping of a whole file.
struct Mapping {
    ptr: *mut libc::c_void,
    len: usize,
}

impl Mapping {
    fn new(file: &std::fs::File, len: usize) -> Mapping {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED, "mmap failed");
        Mapping { ptr, len }
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ptr, self.len) };
    }
}

/// Run `prefetch_hint` over `range` and count how often another fiber got
/// to run meanwhile.
fn yields_during_prefetch(range: &'static [u8]) -> u32 {
    let ticks = Rc::new(Cell::new(0u32));
    let stop = Rc::new(Cell::new(false));

    let mut rt = FiberRuntime::new();
    let (t2, s2) = (ticks.clone(), stop.clone());
    let s = stop.clone();
    rt.block_on(async move {
        spawn(async move {
            while !s2.get() {
                t2.set(t2.get() + 1);
                yield_now().await;
            }
        })
        .unwrap();
        prefetch_hint(range).await;
        s.set(true);
    });
    ticks.get()
}

#[test]
fn mapped_file_prefetch_yields_at_most_once() {
    let file = tempfile::tempfile().unwrap();
    let len = 64 * 4096;
    file.write_all_at(&vec![7u8; len], 0).unwrap();

    let map = Box::leak(Box::new(Mapping::new(&file, len)));
    let slice: &'static [u8] = map.as_slice();

    assert!(yields_during_prefetch(slice) <= 1);
    // Unaligned sub-range.
    assert!(yields_during_prefetch(&slice[100..5000]) <= 1);
    assert_eq!(slice[4096], 7);
}

#[test]
fn heap_and_empty_ranges_do_not_yield() {
    let heap: &'static [u8] = Box::leak(vec![1u8; 3 * 4096].into_boxed_slice());
    assert_eq!(yields_during_prefetch(heap), 0);
    assert_eq!(yields_during_prefetch(&[]), 0);
}

#[test]
fn prefetch_outside_a_runtime_is_harmless() {
    // Resident memory needs no advice and never suspends.
    let buf = vec![0u8; 8192];
    let fut = std::pin::pin!(prefetch_hint(&buf));
    let mut cx = std::task::Context::from_waker(std::task::Waker::noop());
    assert!(std::future::Future::poll(fut, &mut cx).is_ready());
}
