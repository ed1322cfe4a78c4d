//! Integration tests: provider selection against simulated kernels and
//! builds, and I/O through the downgraded provider.

use std::collections::HashMap;
use std::os::fd::AsRawFd;

use aioline::config::{PROVIDER_ENV, URING_QUEUE_DEPTH_ENV};
use aioline::{
    Capabilities, Config, Dispatcher, Error, FiberRuntime, KernelVersion, Provider,
    select_provider,
};

fn caps(kernel: Option<KernelVersion>, ring_compiled: bool) -> Capabilities {
    Capabilities {
        kernel,
        ring_compiled,
        legacy_aio: cfg!(target_os = "linux"),
        posix_aio: true,
    }
}

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn ring_on_old_kernel_runs_on_posix() {
    let old = caps(Some(KernelVersion::new(4, 19, 0)), true);
    let d = Dispatcher::with_capabilities(Config::default(), old).unwrap();
    assert_eq!(d.provider(), Provider::Posix);

    let file = tempfile::tempfile().unwrap();
    let fd = file.as_raw_fd();
    let mut rt = FiberRuntime::new();
    rt.block_on(async move {
        assert_eq!(d.write(fd, b"downgraded", 0).await.unwrap(), 10);
        let mut buf = [0u8; 10];
        assert_eq!(d.read(fd, &mut buf, 0).await.unwrap(), 10);
        assert_eq!(&buf, b"downgraded");
    });
}

#[test]
fn ring_without_compiled_support_runs_on_posix() {
    let mut config = Config::default();
    config.apply_env(env(&[(PROVIDER_ENV, "io_uring")]));
    assert_eq!(config.provider, Some(Provider::Ring));

    let no_ring = caps(Some(KernelVersion::new(6, 8, 0)), false);
    let d = Dispatcher::with_capabilities(config, no_ring).unwrap();
    assert_eq!(d.provider(), Provider::Posix);
    assert_eq!(d.selection().requested, Some(Provider::Ring));
}

#[test]
fn exactly_the_first_ring_kernel_keeps_ring() {
    let first = caps(Some(KernelVersion::new(5, 1, 0)), true);
    assert_eq!(select_provider(None, &first).unwrap(), Provider::Ring);
    let before = caps(Some(KernelVersion::new(5, 0, 21)), true);
    assert_eq!(select_provider(None, &before).unwrap(), Provider::Posix);
}

#[test]
fn unsupported_explicit_provider_is_an_error() {
    let mut no_aio = caps(Some(KernelVersion::new(6, 1, 0)), true);
    no_aio.legacy_aio = false;
    let config = Config {
        provider: Some(Provider::LegacyAio),
        ..Config::default()
    };
    assert!(matches!(
        Dispatcher::with_capabilities(config, no_aio),
        Err(Error::Unsupported(_))
    ));
}

#[test]
fn environment_overrides_apply() {
    let mut config = Config::default();
    config.apply_env(env(&[
        (PROVIDER_ENV, "synchronous"),
        (URING_QUEUE_DEPTH_ENV, "100000"),
    ]));
    assert_eq!(config.provider, Some(Provider::Synchronous));
    assert_eq!(config.ring_queue_depth, aioline::config::MAX_RING_QUEUE_DEPTH);

    let d = Dispatcher::new(config).unwrap();
    assert_eq!(d.provider(), Provider::Synchronous);
}

#[test]
fn unknown_environment_value_keeps_default() {
    let mut config = Config::default();
    config.apply_env(env(&[(PROVIDER_ENV, "carrier-pigeon")]));
    assert_eq!(config.provider, None);
    let d = Dispatcher::with_capabilities(config, caps(Some(KernelVersion::new(6, 1, 0)), true))
        .unwrap();
    assert_eq!(d.provider(), Provider::Ring);
}
