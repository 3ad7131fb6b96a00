use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// Token bucket refilled to `capacity` at every `period` boundary since creation.
///
/// Remaining tokens share one atomic word with the window they belong to, so a take is a
/// single compare-and-swap and never blocks.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    period: Duration,
    origin: Instant,
    // furthest window any caller has observed; only moves forward
    latest_window: AtomicU64,
    // high 32 bits: low bits of the tokens' window, low 32 bits: tokens left
    state: AtomicU64,
}

impl TokenBucket {
    pub fn new(capacity: u32, period: Duration) -> Self {
        Self {
            capacity,
            period,
            origin: Instant::now(),
            latest_window: AtomicU64::new(0),
            state: AtomicU64::new(pack(0, capacity)),
        }
    }

    pub fn try_take(&self) -> bool {
        self.try_take_at(Instant::now())
    }

    pub fn try_take_at(&self, now: Instant) -> bool {
        self.latest_window.fetch_max(self.window_at(now), Ordering::AcqRel);
        let mut current = self.state.load(Ordering::Acquire);

        loop {
            // Read after the state so the stored window is never ahead of it.
            let window = self.latest_window.load(Ordering::Acquire);
            let tokens = self.tokens_in(current, window);
            if tokens == 0 {
                return false;
            }

            match self.state.compare_exchange_weak(
                current,
                pack(window, tokens - 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Tokens a caller would see right now.
    pub fn available(&self) -> u32 {
        let observed = self.window_at(Instant::now());
        let state = self.state.load(Ordering::Acquire);
        let window = self.latest_window.load(Ordering::Acquire).max(observed);
        self.tokens_in(state, window)
    }

    fn window_at(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin).as_nanos();
        u64::try_from(elapsed / self.period.as_nanos().max(1)).unwrap_or(u64::MAX)
    }

    /// The stored window can only trail `window`, so any mismatch is an older window.
    fn tokens_in(&self, state: u64, window: u64) -> u32 {
        let (stored_window, tokens) = unpack(state);
        if stored_window == window as u32 {
            tokens
        } else {
            self.capacity
        }
    }
}

fn pack(window: u64, tokens: u32) -> u64 {
    ((window as u32 as u64) << 32) | tokens as u64
}

fn unpack(state: u64) -> (u32, u32) {
    ((state >> 32) as u32, state as u32)
}
