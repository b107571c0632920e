//! In-memory per-IP rate limiting (spec.md §6: global per-IP rate limiter
//! ahead of auth, independent of guest/quota bookkeeping).

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header::HeaderValue, HeaderName},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use tracing::warn;

use crate::config::LocalRateLimitConfig;
use crate::error::Error;

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Per-IP in-memory rate limiter, keyed by client address.
#[derive(Clone)]
pub struct GovernorRateLimit {
    config: LocalRateLimitConfig,
    limiters: Arc<DashMap<IpAddr, Arc<Limiter>>>,
}

impl GovernorRateLimit {
    pub fn new(config: LocalRateLimitConfig) -> Self {
        Self {
            config,
            limiters: Arc::new(DashMap::new()),
        }
    }

    fn limiter_for(&self, ip: IpAddr) -> Arc<Limiter> {
        self.limiters
            .entry(ip)
            .or_insert_with(|| Arc::new(Self::build_limiter(&self.config)))
            .clone()
    }

    fn build_limiter(config: &LocalRateLimitConfig) -> Limiter {
        let replenish_ms =
            (config.period_secs * 1000) / (config.requests_per_period as u64).max(1);
        let burst = NonZeroU32::new(config.burst_size.max(1)).unwrap();
        let quota = Quota::with_period(Duration::from_millis(replenish_ms.max(1)))
            .expect("replenish interval is non-zero")
            .allow_burst(burst);
        RateLimiter::direct(quota)
    }

    /// Drop entries once the table grows past `max_entries`; called by the
    /// background sweep worker.
    pub fn sweep(&self, max_entries: usize) {
        if self.limiters.len() <= max_entries {
            return;
        }
        let excess = self.limiters.len() - max_entries;
        let keys: Vec<IpAddr> = self.limiters.iter().take(excess).map(|e| *e.key()).collect();
        for key in keys {
            self.limiters.remove(&key);
        }
    }

    pub async fn middleware(
        State(limiter): State<Self>,
        ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
        request: Request<Body>,
        next: Next,
    ) -> Result<Response, Error> {
        let ip = addr.ip();
        let governed = limiter.limiter_for(ip);

        match governed.check() {
            Ok(_) => Ok(next.run(request).await),
            Err(not_until) => {
                let retry_after = not_until.wait_time_from(DefaultClock::default().now());
                warn!(%ip, retry_after_secs = retry_after.as_secs(), "rate limit exceeded");
                Err(Error::RateLimitExceeded)
            }
        }
    }
}

/// Attach standard rate-limit response headers once a request clears the
/// limiter (used outside the `middleware` fn when headers need request
/// context not available after the fact).
pub fn rate_limit_headers(response: &mut Response, limit: u32, remaining: u32, reset_secs: u64) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-limit"), v);
    }
    if let Ok(v) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-remaining"), v);
    }
    if let Ok(v) = HeaderValue::from_str(&reset_secs.to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-reset"), v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_throttle() {
        let config = LocalRateLimitConfig {
            requests_per_period: 60,
            period_secs: 60,
            burst_size: 3,
        };
        let limiter = GovernorRateLimit::build_limiter(&config);
        for _ in 0..3 {
            assert!(limiter.check().is_ok());
        }
        assert!(limiter.check().is_err());
    }

    #[test]
    fn sweep_caps_table_size() {
        let rl = GovernorRateLimit::new(LocalRateLimitConfig::default());
        for i in 0..10u8 {
            rl.limiter_for(IpAddr::from([10, 0, 0, i]));
        }
        rl.sweep(5);
        assert!(rl.limiters.len() <= 5);
    }
}
