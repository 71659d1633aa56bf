//! Per-caller request budgets.
//!
//! Requests that move money (deposit orders, contest joins, withdrawals)
//! draw from a small budget of their own, so a client hammering the join
//! button cannot also exhaust wallet reads. Gateway webhooks are counted
//! apart from player traffic coming from the same address.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 120;
pub const DEFAULT_MONEY_REQUESTS_PER_MINUTE: u32 = 20;
pub const DEFAULT_BURST: u32 = 30;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Reads, verification polls and admin calls.
    pub max_requests: u32,
    /// Deposit orders, joins and withdrawal requests. No burst on top.
    pub max_money_requests: u32,
    pub window: Duration,
    /// Tolerated above `max_requests` before rejecting.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_REQUESTS_PER_MINUTE,
            max_money_requests: DEFAULT_MONEY_REQUESTS_PER_MINUTE,
            window: Duration::from_secs(60),
            burst: DEFAULT_BURST,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Lane {
    General,
    Money,
    Webhook,
}

impl Lane {
    fn of(method: &Method, path: &str) -> Self {
        if path.starts_with("/api/webhooks/") {
            return Lane::Webhook;
        }
        let moves_money = path == "/api/deposits"
            || path == "/api/withdrawals"
            || (path.starts_with("/api/contests/") && path.ends_with("/join"));
        if *method == Method::POST && moves_money {
            Lane::Money
        } else {
            Lane::General
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Lane::General => "general",
            Lane::Money => "money",
            Lane::Webhook => "webhook",
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Arc<Mutex<HashMap<(IpAddr, Lane), Window>>>,
}

struct Window {
    count: u32,
    started: Instant,
}

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Allowed,
    Burst,
    Exceeded { retry_after: Duration },
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn budget(&self, lane: Lane) -> (u32, u32) {
        match lane {
            Lane::Money => (self.config.max_money_requests, 0),
            Lane::General | Lane::Webhook => (self.config.max_requests, self.config.burst),
        }
    }

    fn check_at(&self, ip: IpAddr, lane: Lane, now: Instant) -> Verdict {
        let (allowed, burst) = self.budget(lane);
        let mut state = self.state.lock();
        let window = state.entry((ip, lane)).or_insert(Window {
            count: 0,
            started: now,
        });

        if now.duration_since(window.started) >= self.config.window {
            window.count = 0;
            window.started = now;
        }
        window.count = window.count.saturating_add(1);

        if window.count > allowed.saturating_add(burst) {
            Verdict::Exceeded {
                retry_after: (window.started + self.config.window).saturating_duration_since(now),
            }
        } else if window.count > allowed {
            Verdict::Burst
        } else {
            Verdict::Allowed
        }
    }

    /// Drop idle windows; called from a background task.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let keep_for = self.config.window * 2;
        self.state
            .lock()
            .retain(|_, w| now.duration_since(w.started) < keep_for);
    }

    pub fn tracked(&self) -> usize {
        self.state.lock().len()
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    connect: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = connect
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let lane = Lane::of(request.method(), request.uri().path());

    match limiter.check_at(ip, lane, Instant::now()) {
        Verdict::Allowed => next.run(request).await,
        Verdict::Burst => {
            debug!(ip = %ip, lane = lane.as_str(), "Request served from burst allowance");
            next.run(request).await
        }
        Verdict::Exceeded { retry_after } => {
            warn!(
                ip = %ip,
                lane = lane.as_str(),
                retry_after_secs = retry_after.as_secs(),
                "Request budget exhausted"
            );
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after.as_secs().to_string())],
                Json(serde_json::json!({
                    "status": "RATE_LIMITED",
                    "message": "Too many requests. Please slow down.",
                    "retry": true,
                })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, max_money_requests: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_requests,
            max_money_requests,
            window: Duration::from_secs(60),
            burst,
        })
    }

    #[test]
    fn test_routes_map_to_lanes() {
        assert_eq!(Lane::of(&Method::POST, "/api/contests/c1/join"), Lane::Money);
        assert_eq!(Lane::of(&Method::POST, "/api/deposits"), Lane::Money);
        assert_eq!(Lane::of(&Method::POST, "/api/withdrawals"), Lane::Money);
        assert_eq!(Lane::of(&Method::POST, "/api/deposits/verify"), Lane::General);
        assert_eq!(Lane::of(&Method::GET, "/api/wallet"), Lane::General);
        assert_eq!(Lane::of(&Method::POST, "/api/webhooks/deposit"), Lane::Webhook);
    }

    #[test]
    fn test_reads_get_limit_then_burst_then_reject() {
        let limiter = limiter(5, 2, 3);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let now = Instant::now();

        for _ in 0..5 {
            assert_eq!(limiter.check_at(ip, Lane::General, now), Verdict::Allowed);
        }
        for _ in 0..3 {
            assert_eq!(limiter.check_at(ip, Lane::General, now), Verdict::Burst);
        }
        assert!(matches!(
            limiter.check_at(ip, Lane::General, now),
            Verdict::Exceeded { .. }
        ));

        // Other callers are unaffected.
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert_eq!(limiter.check_at(other, Lane::General, now), Verdict::Allowed);
    }

    #[test]
    fn test_join_spam_does_not_block_wallet_reads_or_webhooks() {
        let limiter = limiter(5, 2, 3);
        let ip: IpAddr = "10.0.0.4".parse().unwrap();
        let now = Instant::now();

        assert_eq!(limiter.check_at(ip, Lane::Money, now), Verdict::Allowed);
        assert_eq!(limiter.check_at(ip, Lane::Money, now), Verdict::Allowed);
        match limiter.check_at(ip, Lane::Money, now) {
            Verdict::Exceeded { retry_after } => assert_eq!(retry_after, Duration::from_secs(60)),
            other => panic!("money lane not limited: {other:?}"),
        }

        assert_eq!(limiter.check_at(ip, Lane::General, now), Verdict::Allowed);
        assert_eq!(limiter.check_at(ip, Lane::Webhook, now), Verdict::Allowed);
        assert_eq!(limiter.tracked(), 3);
    }

    #[test]
    fn test_window_resets() {
        let limiter = limiter(1, 1, 0);
        let ip: IpAddr = "10.0.0.3".parse().unwrap();
        let now = Instant::now();

        assert_eq!(limiter.check_at(ip, Lane::Money, now), Verdict::Allowed);
        assert!(matches!(
            limiter.check_at(ip, Lane::Money, now),
            Verdict::Exceeded { .. }
        ));
        assert_eq!(
            limiter.check_at(ip, Lane::Money, now + Duration::from_secs(61)),
            Verdict::Allowed
        );
        assert_eq!(limiter.tracked(), 1);
    }
}
