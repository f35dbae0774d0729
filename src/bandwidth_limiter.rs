use std::num::NonZeroU32;

use anyhow::{Result, anyhow};
use governor::{
    Quota, RateLimiter, clock::DefaultClock, state::InMemoryState, state::direct::NotKeyed,
};
use log::warn;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Byte-budget throttle for piece fetches. A piece is usually larger than
/// one second's budget, and the limiter rejects outright any single request
/// above its bucket capacity, so acquisition walks the budget in
/// bucket-sized steps instead.
pub struct DownloadThrottle {
    limiter: DirectRateLimiter,
    burst: NonZeroU32,
}

impl DownloadThrottle {
    pub fn new(bytes_per_sec: u64) -> Result<Self> {
        let burst = u32::try_from(bytes_per_sec)
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or_else(|| anyhow!("download rate of {} bytes/s is out of range", bytes_per_sec))?;
        Ok(Self {
            limiter: RateLimiter::direct(Quota::per_second(burst)),
            burst,
        })
    }

    /// Waits until `bytes` of budget are available.
    pub async fn acquire(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            let step = remaining.min(u64::from(self.burst.get())) as u32;
            let Some(cells) = NonZeroU32::new(step) else { break };
            if let Err(e) = self.limiter.until_n_ready(cells).await {
                // Steps are clamped to the bucket capacity, so the limiter
                // should never consider one unsatisfiable.
                warn!("download throttle gave up with {} bytes left: {}", remaining, e);
                break;
            }
            remaining -= u64::from(step);
        }
    }
}

/// Parses a throughput figure such as "65536", "500k" or "4m" into bytes/s.
pub fn parse_rate(input: &str) -> Result<u64> {
    let text = input.trim();
    let digits_end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(digits_end);

    let value: u64 = digits
        .parse()
        .map_err(|_| anyhow!("rate {:?} has no leading number", input))?;
    let scale: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1 << 10,
        "m" | "mb" => 1 << 20,
        "g" | "gb" => 1 << 30,
        _ => return Err(anyhow!("rate {:?} has an unknown unit", input)),
    };

    if value == 0 {
        return Err(anyhow!("rate {:?} must be positive", input));
    }
    value
        .checked_mul(scale)
        .ok_or_else(|| anyhow!("rate {:?} does not fit in 64 bits", input))
}
