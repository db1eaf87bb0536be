use dashmap::DashMap;
use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

/// Per-IP budget for `/connect`. Every connect consumes an address for
/// good, so a single source must not be able to drain the space.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub connect_limit: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            connect_limit: 30,
            window_secs: 60,
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: u32,
    last_refill: Instant,
    limit: u32,
    window: Duration,
}

impl TokenBucket {
    fn new(limit: u32, window: Duration) -> Self {
        Self {
            tokens: limit,
            last_refill: Instant::now(),
            limit,
            window,
        }
    }

    fn check(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);

        if elapsed >= self.window {
            self.tokens = self.limit;
            self.last_refill = now;
        } else {
            // Only advance the refill clock once a whole token has accrued.
            let refill = (self.limit as f64 * elapsed.as_secs_f64() / self.window.as_secs_f64()) as u32;
            if refill > 0 {
                self.tokens = (self.tokens + refill).min(self.limit);
                self.last_refill = now;
            }
        }

        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    fn retry_after(&self) -> u64 {
        let elapsed = Instant::now().duration_since(self.last_refill);
        if elapsed >= self.window {
            0
        } else {
            self.window.as_secs().saturating_sub(elapsed.as_secs()).max(1)
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<DashMap<IpAddr, Mutex<TokenBucket>>>,
    config: RateLimitConfig,
    allowlist: Arc<DashMap<IpAddr, ()>>,
    blocklist: Arc<DashMap<IpAddr, ()>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            config,
            allowlist: Arc::new(DashMap::new()),
            blocklist: Arc::new(DashMap::new()),
        }
    }

    /// `Err(seconds)` carries the suggested `Retry-After`.
    pub async fn check_connect(&self, ip: IpAddr) -> Result<(), u64> {
        if self.blocklist.contains_key(&ip) {
            return Err(self.config.window_secs);
        }

        if self.allowlist.contains_key(&ip) {
            return Ok(());
        }

        let window = Duration::from_secs(self.config.window_secs);
        let bucket = self
            .buckets
            .entry(ip)
            .or_insert_with(|| Mutex::new(TokenBucket::new(self.config.connect_limit, window)));

        let mut bucket = bucket.lock().await;
        if bucket.check() {
            Ok(())
        } else {
            Err(bucket.retry_after())
        }
    }

    /// Drops buckets that have fully refilled, so one-off clients do not
    /// accumulate.
    pub fn prune(&self) {
        let window = Duration::from_secs(self.config.window_secs);
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.get_mut().last_refill) < window);
    }

    pub fn add_to_allowlist(&self, ip: IpAddr) {
        self.allowlist.insert(ip, ());
    }

    pub fn add_to_blocklist(&self, ip: IpAddr) {
        self.blocklist.insert(ip, ());
    }
}
