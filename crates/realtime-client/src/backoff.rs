//! Reconnect backoff: `min(64 * attempts^2, 60_000)` ms, jittered by
//! `0.9 + 0.2 * rand()` so a cluster of clients dropped at once does not
//! all retry in lockstep.

use std::time::Duration;

use rand::Rng;

const CAP_MS: f64 = 60_000.0;

pub fn reconnect_delay(attempt: u32) -> Duration {
    reconnect_delay_with_rng(attempt, &mut rand::thread_rng())
}

fn reconnect_delay_with_rng(attempt: u32, rng: &mut impl Rng) -> Duration {
    let base = (64.0 * (attempt as f64).powi(2)).min(CAP_MS);
    let jitter = 0.9 + 0.2 * rng.gen::<f64>();
    Duration::from_millis((base * jitter) as u64)
}
