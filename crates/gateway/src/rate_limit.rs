//! Brute-force guard for `POST /login`.
//!
//! Failed attempts are counted per client address inside a sliding window.
//! Reaching `max_attempts` blocks the address for `block_duration`; while
//! blocked, further attempts are not counted. A successful login clears the
//! address entirely. A periodic sweep drops entries that are unblocked and
//! have been idle for at least twice the window.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, PoisonError, RwLock},
    time::{Duration, Instant},
};

use {
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
    wagate_config::RateLimitConfig,
};

#[derive(Debug, Clone, Copy)]
struct LoginAttempt {
    count: u32,
    last_attempt: Instant,
    blocked_until: Option<Instant>,
}

impl LoginAttempt {
    fn blocked_at(&self, now: Instant) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }
}

pub struct LoginRateLimiter {
    max_attempts: u32,
    window: Duration,
    block_duration: Duration,
    entries: RwLock<HashMap<IpAddr, LoginAttempt>>,
}

impl LoginRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            window: config.window(),
            block_duration: config.block_duration(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.is_blocked_at(ip, Instant::now())
    }

    pub fn is_blocked_at(&self, ip: IpAddr, now: Instant) -> bool {
        self.retry_after_at(ip, now).is_some()
    }

    /// Time left on an active block.
    pub fn retry_after(&self, ip: IpAddr) -> Option<Duration> {
        self.retry_after_at(ip, Instant::now())
    }

    pub fn retry_after_at(&self, ip: IpAddr, now: Instant) -> Option<Duration> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let until = entries.get(&ip)?.blocked_until?;
        (now < until).then(|| until - now)
    }

    pub fn record_attempt(&self, ip: IpAddr, success: bool) {
        self.record_attempt_at(ip, success, Instant::now());
    }

    pub fn record_attempt_at(&self, ip: IpAddr, success: bool, now: Instant) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        if success {
            if entries.remove(&ip).is_some() {
                debug!(%ip, "login succeeded, attempt counter cleared");
            }
            return;
        }

        let entry = entries.entry(ip).or_insert(LoginAttempt {
            count: 0,
            last_attempt: now,
            blocked_until: None,
        });

        if entry.blocked_at(now) {
            return;
        }

        let window_elapsed = now.saturating_duration_since(entry.last_attempt) > self.window;
        if entry.blocked_until.take().is_some() || window_elapsed {
            entry.count = 0;
        }
        entry.count += 1;
        entry.last_attempt = now;

        if entry.count >= self.max_attempts {
            entry.blocked_until = Some(now + self.block_duration);
            warn!(
                %ip,
                attempts = entry.count,
                block_secs = self.block_duration.as_secs(),
                "too many failed logins, address blocked"
            );
        }
    }

    /// Drop entries that are unblocked and idle for two windows. Returns the
    /// number removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let idle = self.window * 2;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, e| {
            e.blocked_at(now) || now.saturating_duration_since(e.last_attempt) < idle
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run [`sweep_at`](Self::sweep_at) every `interval` until cancelled.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.sweep_at(Instant::now());
                        if removed > 0 {
                            debug!(removed, remaining = self.len(), "swept stale login attempts");
                        }
                    },
                }
            }
        })
    }
}
