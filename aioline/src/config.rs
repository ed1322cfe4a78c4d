use crate::error::Error;
use crate::provider::Provider;

/// Environment variable selecting the provider (`synchronous`, `posix`,
/// `legacy-aio`, `ring`).
pub const PROVIDER_ENV: &str = "AIOLINE_IO_PROVIDER";
/// Environment variable with the POSIX AIO worker thread count. Only
/// consulted when the POSIX provider is selected.
pub const POSIX_AIO_THREADS_ENV: &str = "AIOLINE_POSIX_AIO_THREADS";
/// Environment variable with the io_uring queue depth. Only consulted for
/// the ring provider; clamped to [`MIN_RING_QUEUE_DEPTH`, `MAX_RING_QUEUE_DEPTH`].
pub const URING_QUEUE_DEPTH_ENV: &str = "AIOLINE_URING_QUEUE_DEPTH";

pub const MIN_RING_QUEUE_DEPTH: u32 = 8;
pub const MAX_RING_QUEUE_DEPTH: u32 = 4096;

/// Dispatcher configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Requested provider. `None` = ring, subject to capability downgrade.
    pub provider: Option<Provider>,
    /// io_uring submission queue entries.
    /// Default: 128 (four reap batches).
    pub ring_queue_depth: u32,
    /// Always use `IORING_OP_READV`/`WRITEV`, even when the kernel supports
    /// the plain read/write opcodes.
    pub ring_force_vectored: bool,
    /// Maximum events pulled per `io_getevents` call. The kernel AIO context
    /// is sized to `4 * aio_reap_batch - 1` events.
    /// Default: 32.
    pub aio_reap_batch: u32,
    /// POSIX AIO worker threads passed to `aio_init`. 0 = platform default.
    pub posix_aio_threads: u32,
    /// Capacity of the dedicated-thread request queue.
    /// Default: 1023.
    pub dedicated_queue_capacity: usize,
    /// Requests the dedicated thread drains and submits per round.
    /// Default: 64.
    pub dedicated_batch: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: None,
            ring_queue_depth: 128,
            ring_force_vectored: false,
            aio_reap_batch: 32,
            posix_aio_threads: 0,
            dedicated_queue_capacity: 1023,
            dedicated_batch: 64,
        }
    }
}

impl Config {
    /// Default config with the `AIOLINE_*` environment variables applied.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Apply environment overrides read through `lookup`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup(PROVIDER_ENV) {
            match raw.parse::<Provider>() {
                Ok(p) => self.provider = Some(p),
                Err(_) => tracing::warn!(value = %raw, "ignoring unknown {PROVIDER_ENV}"),
            }
        }
        if let Some(raw) = lookup(POSIX_AIO_THREADS_ENV) {
            match raw.trim().parse::<i64>() {
                Ok(n) if n > 0 => self.posix_aio_threads = n.min(u32::MAX as i64) as u32,
                Ok(_) => {}
                Err(_) => tracing::warn!(value = %raw, "ignoring bad {POSIX_AIO_THREADS_ENV}"),
            }
        }
        if let Some(raw) = lookup(URING_QUEUE_DEPTH_ENV) {
            match raw.trim().parse::<i64>() {
                Ok(n) => self.ring_queue_depth = clamp_queue_depth(n),
                Err(_) => tracing::warn!(value = %raw, "ignoring bad {URING_QUEUE_DEPTH_ENV}"),
            }
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), Error> {
        if !(MIN_RING_QUEUE_DEPTH..=MAX_RING_QUEUE_DEPTH).contains(&self.ring_queue_depth) {
            return Err(Error::Config(format!(
                "ring_queue_depth must be in {MIN_RING_QUEUE_DEPTH}..={MAX_RING_QUEUE_DEPTH}"
            )));
        }
        if self.aio_reap_batch == 0 || self.aio_reap_batch > 4096 {
            return Err(Error::Config("aio_reap_batch must be in 1..=4096".into()));
        }
        if self.dedicated_queue_capacity == 0 {
            return Err(Error::Config(
                "dedicated_queue_capacity must be > 0".into(),
            ));
        }
        if self.dedicated_batch == 0 || self.dedicated_batch > 1024 {
            return Err(Error::Config("dedicated_batch must be in 1..=1024".into()));
        }
        Ok(())
    }

    /// Max events for a kernel AIO context serving `reap_batch`-sized reaps.
    pub(crate) fn aio_max_events(reap_batch: u32) -> u32 {
        reap_batch * 4 - 1
    }
}

fn clamp_queue_depth(n: i64) -> u32 {
    n.clamp(MIN_RING_QUEUE_DEPTH as i64, MAX_RING_QUEUE_DEPTH as i64) as u32
}

/// Builder for [`Config`] with `build()` validation.
///
/// ```rust
/// use aioline::{ConfigBuilder, Provider};
///
/// let config = ConfigBuilder::new()
///     .provider(Provider::LegacyAio)
///     .aio_reap_batch(16)
///     .build()
///     .expect("invalid config");
/// assert_eq!(config.aio_reap_batch, 16);
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a builder with default values (environment is not consulted).
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from [`Config::from_env`].
    pub fn from_env() -> Self {
        Self {
            config: Config::from_env(),
        }
    }

    /// Request a provider.
    pub fn provider(mut self, provider: Provider) -> Self {
        self.config.provider = Some(provider);
        self
    }

    /// Set the io_uring queue depth.
    pub fn ring_queue_depth(mut self, n: u32) -> Self {
        self.config.ring_queue_depth = n;
        self
    }

    /// Force vectored ring opcodes.
    pub fn ring_force_vectored(mut self, enable: bool) -> Self {
        self.config.ring_force_vectored = enable;
        self
    }

    /// Set the kernel AIO reap batch.
    pub fn aio_reap_batch(mut self, n: u32) -> Self {
        self.config.aio_reap_batch = n;
        self
    }

    /// Set the POSIX AIO worker thread count.
    pub fn posix_aio_threads(mut self, n: u32) -> Self {
        self.config.posix_aio_threads = n;
        self
    }

    /// Set the dedicated-thread queue capacity and per-round batch.
    pub fn dedicated(mut self, queue_capacity: usize, batch: usize) -> Self {
        self.config.dedicated_queue_capacity = queue_capacity;
        self.config.dedicated_batch = batch;
        self
    }

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
