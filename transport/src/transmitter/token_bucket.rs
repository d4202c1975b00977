use crate::config::RateLimit;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Byte-based token bucket for the transmit rate limit. In [RateLimit::Dynamic] mode the rate
///  backs off multiplicatively under repair pressure and recovers additively towards the
///  configured ceiling.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    dynamic: bool,
    max_bytes_per_sec: u64,
    min_bytes_per_sec: u64,
    bytes_per_sec: u64,
    capacity: u64,
    available: u64,
    last_settled: Instant,
}

impl TokenBucket {
    const BURST: Duration = Duration::from_millis(20);
    /// fraction of the ceiling that is recovered per second, in percent
    const RECOVERY_PERCENT_PER_SEC: u64 = 10;

    /// `None` if rate limiting is disabled
    pub fn new(mode: RateLimit, limit_kbps: u32, min_kbps: u32, packet_size: usize, now: Instant) -> Option<TokenBucket> {
        let dynamic = match mode {
            RateLimit::Disabled => return None,
            RateLimit::Static => false,
            RateLimit::Dynamic => true,
        };

        let max_bytes_per_sec = u64::from(limit_kbps) * 1000 / 8;
        let capacity = (max_bytes_per_sec * Self::BURST.as_millis() as u64 / 1000)
            .max(2 * packet_size as u64);
        Some(TokenBucket {
            dynamic,
            max_bytes_per_sec,
            min_bytes_per_sec: (u64::from(min_kbps) * 1000 / 8).min(max_bytes_per_sec),
            bytes_per_sec: max_bytes_per_sec,
            capacity,
            available: capacity,
            last_settled: now,
        })
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    fn settle(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_settled);
        if elapsed.is_zero() {
            return;
        }
        self.last_settled = now;

        let refill = (self.bytes_per_sec as u128 * elapsed.as_nanos() / 1_000_000_000) as u64;
        self.available = self.available.saturating_add(refill).min(self.capacity);

        if self.dynamic && self.bytes_per_sec < self.max_bytes_per_sec {
            let recovery = (self.max_bytes_per_sec as u128 * Self::RECOVERY_PERCENT_PER_SEC as u128 * elapsed.as_nanos() / 100 / 1_000_000_000) as u64;
            self.bytes_per_sec = (self.bytes_per_sec + recovery.max(1)).min(self.max_bytes_per_sec);
        }
    }

    /// Takes tokens for a packet of `bytes` if they are available
    pub fn try_consume(&mut self, bytes: usize, now: Instant) -> bool {
        self.settle(now);
        let bytes = bytes as u64;
        if self.available < bytes {
            return false;
        }
        self.available -= bytes;
        true
    }

    pub fn on_repair_pressure(&mut self, now: Instant) {
        if !self.dynamic {
            return;
        }
        self.settle(now);
        let reduced = (self.bytes_per_sec * 3 / 4).max(self.min_bytes_per_sec);
        if reduced != self.bytes_per_sec {
            debug!("repair pressure: reducing transmit rate from {} to {} bytes/s", self.bytes_per_sec, reduced);
            self.bytes_per_sec = reduced;
        }
    }
}
