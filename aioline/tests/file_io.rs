//! Integration tests: positioned reads and writes on every available
//! provider, driven from fibers.
//!
//! Providers the running kernel or build cannot serve are skipped.

use std::cell::{Cell, RefCell};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::rc::Rc;

use aioline::{Capabilities, Config, Dispatcher, FiberRuntime, Provider, spawn};

// ── Helpers ─────────────────────────────────────────────────────────

/// Check if io_uring is supported on this kernel.
fn io_uring_supported() -> bool {
    io_uring_probe().is_ok()
}

fn io_uring_probe() -> std::io::Result<()> {
    let mut params = [0u8; 120];
    let fd = unsafe { libc::syscall(libc::SYS_io_uring_setup, 4u32, params.as_mut_ptr()) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    unsafe { libc::close(fd as i32) };
    Ok(())
}

/// Every provider this machine can serve, each behind its own dispatcher.
fn dispatchers() -> Vec<Rc<Dispatcher>> {
    let caps = Capabilities::probe();
    let mut out = Vec::new();
    for provider in [
        Provider::Synchronous,
        Provider::Posix,
        Provider::LegacyAio,
        Provider::Ring,
    ] {
        match provider {
            Provider::LegacyAio if !caps.legacy_aio => {
                eprintln!("SKIP: legacy-aio (kernel AIO unavailable)");
                continue;
            }
            Provider::Ring if !io_uring_supported() => {
                eprintln!("SKIP: ring (io_uring unavailable)");
                continue;
            }
            _ => {}
        }
        let config = Config {
            provider: Some(provider),
            ..Config::default()
        };
        let d = Dispatcher::with_capabilities(config, caps).unwrap();
        if d.provider() != provider {
            eprintln!("SKIP: {provider} (downgraded to {})", d.provider());
            continue;
        }
        out.push(Rc::new(d));
    }
    out
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

// ── Round trip ──────────────────────────────────────────────────────

#[test]
fn round_trip_lengths() {
    const LENGTHS: [usize; 6] = [0, 1, 4095, 4096, 4097, 1 << 20];

    for d in dispatchers() {
        let provider = d.provider();
        let mut rt = FiberRuntime::new();
        rt.block_on(async move {
            for (i, &len) in LENGTHS.iter().enumerate() {
                let file = tempfile::tempfile().unwrap();
                let fd = file.as_raw_fd();
                let data = pattern(len, i as u8);

                let n = d.write(fd, &data, 0).await.unwrap();
                assert_eq!(n, len, "{provider}: write of {len}");

                let mut buf = vec![0u8; len];
                let n = d.read(fd, &mut buf, 0).await.unwrap();
                assert_eq!(n, len, "{provider}: read of {len}");
                assert!(buf == data, "{provider}: content mismatch at {len}");
            }
        });
    }
}

#[test]
fn read_past_end_of_file_is_short() {
    for d in dispatchers() {
        let mut rt = FiberRuntime::new();
        rt.block_on(async move {
            let file = tempfile::tempfile().unwrap();
            let fd = file.as_raw_fd();
            d.write(fd, b"0123456789", 0).await.unwrap();

            let mut buf = [0u8; 8];
            assert_eq!(d.read(fd, &mut buf, 6).await.unwrap(), 4);
            assert_eq!(&buf[..4], b"6789");
            assert_eq!(d.read(fd, &mut buf, 4096).await.unwrap(), 0);
        });
    }
}

#[test]
fn bad_descriptor_fails_only_that_request() {
    for d in dispatchers() {
        let provider = d.provider();
        // The ring backend aborts on failed completions other than EAGAIN.
        if provider == Provider::Ring {
            continue;
        }
        let mut rt = FiberRuntime::new();
        rt.block_on(async move {
            let file = tempfile::tempfile().unwrap();
            let fd = file.as_raw_fd();

            let mut buf = [0u8; 16];
            let err = d.read(-1, &mut buf, 0).await.unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EBADF), "{provider}");

            // The backend keeps working for other requests.
            assert_eq!(d.write(fd, b"still fine", 0).await.unwrap(), 10);
        });
    }
}

// ── Concurrency ─────────────────────────────────────────────────────

#[test]
fn concurrent_fibers_see_only_their_own_results() {
    const FIBERS: usize = 64;
    const LEN: usize = 8192;

    for d in dispatchers() {
        let provider = d.provider();
        let file = Rc::new(tempfile::tempfile().unwrap());
        let verified = Rc::new(Cell::new(0));

        let mut rt = FiberRuntime::new();
        let (f, v) = (file.clone(), verified.clone());
        rt.block_on(async move {
            for i in 0..FIBERS {
                let d = d.clone();
                let f = f.clone();
                let v = v.clone();
                spawn(async move {
                    let fd = f.as_raw_fd();
                    let offset = (i * LEN) as u64;
                    let data = pattern(LEN, i as u8);
                    assert_eq!(d.write(fd, &data, offset).await.unwrap(), LEN);

                    let mut buf = vec![0u8; LEN];
                    assert_eq!(d.read(fd, &mut buf, offset).await.unwrap(), LEN);
                    assert!(buf == data, "{provider}: fiber {i} saw foreign data");
                    v.set(v.get() + 1);
                })
                .unwrap();
            }
        });
        assert_eq!(verified.get(), FIBERS, "{provider}");
    }
}

#[test]
fn thousand_fibers_read_distinct_pages() {
    const FIBERS: usize = 1000;
    const PAGE: usize = 4096;

    // Fill the file once with a per-page marker.
    let file = Rc::new(tempfile::tempfile().unwrap());
    let mut contents = vec![0u8; FIBERS * PAGE];
    for (i, page) in contents.chunks_mut(PAGE).enumerate() {
        page.fill((i % 251) as u8);
        page[..8].copy_from_slice(&(i as u64).to_le_bytes());
    }
    file.write_all_at(&contents, 0).unwrap();

    for d in dispatchers() {
        let provider = d.provider();
        let mismatches = Rc::new(RefCell::new(Vec::new()));
        let completed = Rc::new(Cell::new(0usize));

        let mut rt = FiberRuntime::with_capacity(FIBERS as u32 + 8);
        let (f, m, c) = (file.clone(), mismatches.clone(), completed.clone());
        rt.block_on(async move {
            for i in 0..FIBERS {
                let (d, f, m, c) = (d.clone(), f.clone(), m.clone(), c.clone());
                spawn(async move {
                    let mut buf = vec![0u8; PAGE];
                    let n = d
                        .read(f.as_raw_fd(), &mut buf, (i * PAGE) as u64)
                        .await
                        .unwrap();
                    let marker = u64::from_le_bytes(buf[..8].try_into().unwrap());
                    if n != PAGE
                        || marker != i as u64
                        || buf[8..].iter().any(|&b| b != (i % 251) as u8)
                    {
                        m.borrow_mut().push(i);
                    }
                    c.set(c.get() + 1);
                })
                .unwrap();
            }
            while c.get() < FIBERS {
                aioline::yield_now().await;
            }
            assert_eq!(d.outstanding(), 0, "{provider}: requests left in flight");
        });
        assert_eq!(completed.get(), FIBERS, "{provider}");
        assert!(
            mismatches.borrow().is_empty(),
            "{provider}: mismatched pages {:?}",
            mismatches.borrow()
        );
    }
}

#[test]
fn fibers_keep_running_while_io_is_outstanding() {
    for d in dispatchers() {
        if d.provider() == Provider::Synchronous {
            continue;
        }
        let ticks = Rc::new(Cell::new(0u32));
        let finished = Rc::new(Cell::new(false));

        let mut rt = FiberRuntime::new();
        let (t, fin) = (ticks.clone(), finished.clone());
        rt.block_on(async move {
            let fin2 = fin.clone();
            spawn(async move {
                let file = tempfile::tempfile().unwrap();
                let data = vec![5u8; 1 << 20];
                d.write(file.as_raw_fd(), &data, 0).await.unwrap();
                fin2.set(true);
            })
            .unwrap();
            // A compute fiber that only yields.
            while !fin.get() {
                t.set(t.get() + 1);
                aioline::yield_now().await;
            }
        });
        assert!(finished.get());
        assert!(ticks.get() >= 1);
    }
}
