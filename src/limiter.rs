//! Token-bucket rate limiting for served request payload.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{interval, Duration};

/// Token bucket measured in KiB, refilled every 100 ms and capped at one
/// second's worth of tokens. Applies only to outbound request serving;
/// fetches on the pulling side are never limited.
pub struct RateLimiter {
    tokens: Mutex<u64>,
    cap: u64,
    refilled: Notify,
}

impl RateLimiter {
    /// Creates a limiter for `kbps` kilobytes per second and starts its
    /// refill task on the current runtime.
    pub fn new(kbps: u64) -> Arc<Self> {
        let cap = kbps.max(1);
        let limiter = Arc::new(Self {
            tokens: Mutex::new(cap),
            cap,
            refilled: Notify::new(),
        });

        let l = Arc::clone(&limiter);
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_millis(100));
            // Carry sub-token remainders so the refill rate is exact.
            let mut carry = 0u64;
            loop {
                tick.tick().await;
                carry += kbps;
                let add = carry / 10;
                carry %= 10;
                if add > 0 {
                    let mut tokens = l.tokens.lock();
                    *tokens = (*tokens + add).min(l.cap);
                }
                l.refilled.notify_waiters();
            }
        });

        limiter
    }

    /// Takes one token per started KiB of payload, waiting for refills as
    /// needed.
    pub async fn take(&self, bytes: usize) {
        let mut needed = (bytes as u64).div_ceil(1024);
        while needed > 0 {
            let got = {
                let mut tokens = self.tokens.lock();
                let got = (*tokens).min(needed);
                *tokens -= got;
                got
            };
            needed -= got;
            if needed > 0 {
                self.refilled.notified().await;
            }
        }
    }
}
