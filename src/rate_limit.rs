use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use dashmap::DashMap;

/// Sliding window in-memory rate limiter (process local).
#[derive(Clone)]
pub struct InMemoryRateLimiter {
    store: Arc<DashMap<String, VecDeque<Instant>>>,
    pub enabled: bool,
}

impl InMemoryRateLimiter {
    pub fn new(enabled: bool) -> Self {
        Self { store: Arc::new(DashMap::new()), enabled }
    }

    /// Returns true if allowed, false if limited.
    pub fn check(&self, key: &str, limit: usize, window: Duration) -> bool {
        if !self.enabled { return true; }
        let now = Instant::now();
        let mut entry = self.store.entry(key.to_string()).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) >= window { entry.pop_front(); } else { break; }
        }
        if entry.len() < limit {
            entry.push_back(now);
            true
        } else {
            false
        }
    }
}

/// Per-action limits, read from env.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub comment_limit: usize,
    pub comment_window: Duration,
    pub reply_limit: usize,
    pub reply_window: Duration,
    pub like_limit: usize,
    pub like_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            comment_limit: 5,
            comment_window: Duration::from_secs(60),
            reply_limit: 10,
            reply_window: Duration::from_secs(60),
            like_limit: 60,
            like_window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        fn usize_env(name: &str, default: usize) -> usize { std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default) }
        fn dur_env(name: &str, default: Duration) -> Duration { std::env::var(name).ok().and_then(|v| v.parse().ok()).map(Duration::from_secs).unwrap_or(default) }
        let d = Self::default();
        Self {
            comment_limit: usize_env("RL_COMMENT_LIMIT", d.comment_limit),
            comment_window: dur_env("RL_COMMENT_WINDOW", d.comment_window),
            reply_limit: usize_env("RL_REPLY_LIMIT", d.reply_limit),
            reply_window: dur_env("RL_REPLY_WINDOW", d.reply_window),
            like_limit: usize_env("RL_LIKE_LIMIT", d.like_limit),
            like_window: dur_env("RL_LIKE_WINDOW", d.like_window),
        }
    }
}

/// Guard used by handlers, keyed by guest id.
#[derive(Clone)]
pub struct RateLimiterFacade {
    pub limiter: InMemoryRateLimiter,
    pub cfg: RateLimitConfig,
}

impl RateLimiterFacade {
    pub fn new(limiter: InMemoryRateLimiter, cfg: RateLimitConfig) -> Self { Self { limiter, cfg } }
    pub fn allow_comment(&self, guest: &str) -> bool { self.limiter.check(&format!("comment:{guest}"), self.cfg.comment_limit, self.cfg.comment_window) }
    pub fn allow_reply(&self, guest: &str) -> bool { self.limiter.check(&format!("reply:{guest}"), self.cfg.reply_limit, self.cfg.reply_window) }
    pub fn allow_like(&self, guest: &str) -> bool { self.limiter.check(&format!("like:{guest}"), self.cfg.like_limit, self.cfg.like_window) }
}
