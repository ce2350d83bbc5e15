//! Bandwidth accounting
//!
//! [`RateMeter`] measures per-session throughput over a sliding window.
//! [`BandwidthPool`] is a per-swarm token budget for one direction, handed
//! out to sessions in proportion to their measured rate plus a floor.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::trace;

/// Averaging window for measured rates
pub const RATE_WINDOW: Duration = Duration::from_secs(20);

/// Sliding-window throughput meter
#[derive(Debug, Clone)]
pub struct RateMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    in_window: u64,
    total: u64,
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(RATE_WINDOW)
    }
}

impl RateMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            in_window: 0,
            total: 0,
        }
    }

    /// Record `bytes` transferred at `now`
    pub fn record(&mut self, bytes: u64, now: Instant) {
        self.expire(now);
        self.total += bytes;
        self.in_window += bytes;
        match self.samples.back_mut() {
            Some((at, n)) if now.saturating_duration_since(*at) < Duration::from_secs(1) => *n += bytes,
            _ => self.samples.push_back((now, bytes)),
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(at, n)) = self.samples.front() {
            if now.saturating_duration_since(at) <= self.window {
                break;
            }
            self.samples.pop_front();
            self.in_window -= n;
        }
    }

    /// Bytes per second over the window ending at `now`
    pub fn rate(&mut self, now: Instant) -> f64 {
        self.expire(now);
        self.in_window as f64 / self.window.as_secs_f64()
    }

    /// Bytes recorded since creation
    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Tokens held by one session for one direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Allowance {
    tokens: Option<u64>,
}

impl Allowance {
    /// An allowance that never runs out
    pub fn unlimited() -> Self {
        Self { tokens: None }
    }

    pub fn limited(tokens: u64) -> Self {
        Self { tokens: Some(tokens) }
    }

    /// Whether `bytes` could be spent now
    pub fn can_spend(&self, bytes: u64) -> bool {
        self.tokens.map_or(true, |t| t >= bytes)
    }

    /// Spend `bytes` if available
    pub fn try_spend(&mut self, bytes: u64) -> bool {
        match &mut self.tokens {
            None => true,
            Some(t) if *t >= bytes => {
                *t -= bytes;
                true
            }
            Some(_) => false,
        }
    }

    /// Remaining tokens, `None` when unlimited
    pub fn remaining(&self) -> Option<u64> {
        self.tokens
    }

    fn grant(&mut self, bytes: u64) {
        if let Some(t) = &mut self.tokens {
            *t += bytes;
        }
    }

    fn take_all(&mut self) -> u64 {
        self.tokens.replace(0).unwrap_or(0)
    }
}

/// Shared per-swarm token budget for one direction
#[derive(Debug, Clone)]
pub struct BandwidthPool {
    /// Bytes per second, `None` for unlimited
    limit: Option<u64>,
    pool: u64,
    floor: f64,
    last_refill: Option<Instant>,
}

impl BandwidthPool {
    /// Create a pool; a limit of zero means unlimited
    pub fn new(bytes_per_sec: u64, floor: f64) -> Self {
        let limit = (bytes_per_sec > 0).then_some(bytes_per_sec);
        Self {
            limit,
            pool: 0,
            floor,
            last_refill: None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit.is_none()
    }

    /// Initial allowance for a newly established session
    pub fn new_allowance(&self) -> Allowance {
        if self.is_unlimited() {
            Allowance::unlimited()
        } else {
            Allowance::limited(0)
        }
    }

    /// Tokens not yet handed to any session
    pub fn available(&self) -> u64 {
        self.pool
    }

    /// Refill for the time elapsed since the last call and apportion the pool.
    ///
    /// Each session receives a share weighted by `rate + floor`.
    pub fn distribute<'a, I>(&mut self, now: Instant, sessions: I)
    where
        I: IntoIterator<Item = (f64, &'a mut Allowance)>,
    {
        let Some(limit) = self.limit else {
            return;
        };

        let elapsed = self
            .last_refill
            .map_or(Duration::from_secs(1), |at| now.saturating_duration_since(at));
        self.last_refill = Some(now);
        let added = (limit as f64 * elapsed.as_secs_f64()) as u64;
        self.pool = (self.pool + added).min(limit * 2);

        let sessions: Vec<(f64, &mut Allowance)> = sessions
            .into_iter()
            .map(|(rate, allowance)| (rate.max(0.0) + self.floor, allowance))
            .collect();
        let total_weight: f64 = sessions.iter().map(|(w, _)| *w).sum();
        if total_weight <= 0.0 {
            return;
        }

        let budget = self.pool;
        let mut handed = 0;
        for (weight, allowance) in sessions {
            let share = ((budget as f64) * weight / total_weight) as u64;
            allowance.grant(share);
            handed += share;
        }
        self.pool -= handed.min(self.pool);
        trace!("Distributed {} of {} tokens", handed, budget);
    }

    /// Return a departing session's unused allowance to the pool
    pub fn release(&mut self, allowance: &mut Allowance) {
        if self.limit.is_some() {
            self.pool += allowance.take_all();
        }
    }
}
