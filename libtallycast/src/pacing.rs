//! Courtesy delays, throttling backoff and soft rate limits
//!
//! All waiting goes through a [`Sleeper`] so tests can run adapters against
//! a [`VirtualClock`] instead of wall time.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::transport::{HttpRequest, HttpResponse, Transport};

type FetchResult<T> = std::result::Result<T, FetchError>;

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real sleeping on the tokio timer
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Shared, manually advanced clock
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    elapsed: Arc<Mutex<Duration>>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        self.elapsed.lock().map(|e| *e).unwrap_or_default()
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut elapsed) = self.elapsed.lock() {
            *elapsed += by;
        }
    }
}

/// Sleeper that returns immediately, advancing a [`VirtualClock`]
#[derive(Debug, Clone, Default)]
pub struct ManualSleeper {
    clock: VirtualClock,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl ManualSleeper {
    pub fn new(clock: VirtualClock) -> Self {
        Self {
            clock,
            sleeps: Arc::default(),
        }
    }

    /// Every requested sleep, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for ManualSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        self.clock.advance(duration);
    }
}

/// Longest single pause, whatever an upstream header asks for
pub const MAX_WAIT: Duration = Duration::from_secs(60 * 60);

/// How a network signals "slow down" and how long to back off
#[derive(Debug, Clone)]
pub struct Throttle {
    /// Statuses treated as throttling rather than failure
    pub statuses: Vec<u16>,
    /// Wait used when no usable `Retry-After` header is present
    pub fallback: Duration,
    /// Added on top of `Retry-After`
    pub retry_after_margin: Duration,
    /// Retries of the same request before giving up
    pub max_retries: u32,
}

impl Throttle {
    pub const DEFAULT_MAX_RETRIES: u32 = 5;

    pub fn new(statuses: &[u16], fallback: Duration) -> Self {
        Self {
            statuses: statuses.to_vec(),
            fallback,
            retry_after_margin: Duration::from_secs(1),
            max_retries: Self::DEFAULT_MAX_RETRIES,
        }
    }

    /// Throttle on HTTP 429 only
    pub fn too_many_requests(fallback: Duration) -> Self {
        Self::new(&[429], fallback)
    }

    pub fn with_margin(mut self, margin: Duration) -> Self {
        self.retry_after_margin = margin;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn is_throttled(&self, resp: &HttpResponse) -> bool {
        self.statuses.contains(&resp.status)
    }

    /// Wait before retrying a throttled response
    pub fn wait_for(&self, resp: &HttpResponse) -> Duration {
        let wait = match resp.header("retry-after").and_then(parse_retry_after) {
            Some(after) => after.saturating_add(self.retry_after_margin),
            None => self.fallback,
        };
        wait.min(MAX_WAIT)
    }
}

/// Parse `Retry-After` as delta-seconds or an HTTP date
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(secs) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Send `request`, sleeping and retrying the same request while throttled
///
/// Returns the first response that is not a throttling response, whatever
/// its status. Gives up with [`FetchError::RateLimited`] once
/// `throttle.max_retries` retries have been spent.
pub async fn send_with_backoff(
    transport: &dyn Transport,
    sleeper: &dyn Sleeper,
    request: &HttpRequest,
    throttle: &Throttle,
) -> FetchResult<HttpResponse> {
    let mut retries = 0;
    loop {
        let resp = transport.execute(request.clone()).await?;
        if !throttle.is_throttled(&resp) {
            return Ok(resp);
        }

        if retries >= throttle.max_retries {
            warn!(
                url = %request.url,
                status = resp.status,
                retries,
                "Still throttled, giving up"
            );
            return Err(FetchError::RateLimited {
                status: resp.status,
                attempts: retries + 1,
            });
        }

        let wait = throttle.wait_for(&resp);
        retries += 1;
        warn!(
            url = %request.url,
            status = resp.status,
            wait_secs = wait.as_secs_f64(),
            retry = retries,
            "Throttled, backing off"
        );
        sleeper.sleep(wait).await;
    }
}

/// Preemptive pause driven by a remaining-budget header
#[derive(Debug, Clone)]
pub struct SoftLimit {
    pub remaining_header: &'static str,
    pub reset_header: &'static str,
    /// Pause once the remaining budget drops below this
    pub threshold: f64,
    /// Added on top of the advertised reset
    pub margin: Duration,
    /// Pause used when the reset header is missing
    pub fallback: Duration,
}

impl SoftLimit {
    /// Wait required before the next request, if any
    pub fn wait_for(&self, resp: &HttpResponse) -> Option<Duration> {
        let remaining = resp
            .header(self.remaining_header)
            .and_then(|v| v.trim().parse::<f64>().ok())?;

        if remaining >= self.threshold {
            return None;
        }

        let wait = resp
            .header(self.reset_header)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .map(|reset| reset.saturating_add(self.margin))
            .unwrap_or(self.fallback);

        Some(wait.min(MAX_WAIT))
    }

    pub async fn respect(&self, sleeper: &dyn Sleeper, resp: &HttpResponse) {
        if let Some(wait) = self.wait_for(resp) {
            debug!(wait_secs = wait.as_secs_f64(), "Request budget nearly spent, pausing");
            sleeper.sleep(wait).await;
        }
    }
}
