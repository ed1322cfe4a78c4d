//! aioline runtime metrics.
//!
//! Process-wide counters for request flow, reaper activity and the
//! dedicated thread. Registered with metriken for exposition by whatever
//! admin endpoint the embedding process runs.

use metriken::{Counter, Gauge, metric};

// ── Requests ─────────────────────────────────────────────────────

#[metric(
    name = "aioline/requests/submitted",
    description = "Requests handed to a backend"
)]
pub static REQUESTS_SUBMITTED: Counter = Counter::new();

#[metric(
    name = "aioline/requests/completed",
    description = "Requests whose completion was delivered to the issuing fiber"
)]
pub static REQUESTS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "aioline/requests/failed",
    description = "Completed requests that carried an error code"
)]
pub static REQUESTS_FAILED: Counter = Counter::new();

#[metric(
    name = "aioline/requests/in_flight",
    description = "Requests submitted on fiber backends and not yet reaped"
)]
pub static REQUESTS_IN_FLIGHT: Gauge = Gauge::new();

#[metric(
    name = "aioline/submit/retries",
    description = "Submissions retried after EAGAIN or a full queue"
)]
pub static SUBMIT_RETRIES: Counter = Counter::new();

// ── Reaper ───────────────────────────────────────────────────────

#[metric(name = "aioline/reaper/rounds", description = "Reaper loop iterations")]
pub static REAPER_ROUNDS: Counter = Counter::new();

#[metric(
    name = "aioline/reaper/blocking_waits",
    description = "Reaps that blocked the thread because no other fiber was ready"
)]
pub static REAPER_BLOCKING_WAITS: Counter = Counter::new();

// ── Dedicated thread ─────────────────────────────────────────────

#[metric(
    name = "aioline/dedicated/queue_full",
    description = "Pushes to the dedicated-thread queue that found it full"
)]
pub static DEDICATED_QUEUE_FULL: Counter = Counter::new();

#[metric(
    name = "aioline/dedicated/completed",
    description = "Requests completed by the dedicated thread"
)]
pub static DEDICATED_COMPLETED: Counter = Counter::new();

// ── Provider / prefetch ──────────────────────────────────────────

#[metric(
    name = "aioline/provider/downgrades",
    description = "Ring provider requests downgraded to POSIX AIO"
)]
pub static PROVIDER_DOWNGRADES: Counter = Counter::new();

#[metric(
    name = "aioline/prefetch/advised",
    description = "Prefetch hints that found non-resident pages"
)]
pub static PREFETCH_ADVISED: Counter = Counter::new();
