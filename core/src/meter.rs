//! Rate metering for active calls.
//!
//! The meter is a pure function of elapsed time and the agreed rate, so a
//! session's accrual can be replayed from an audit log. The only state it
//! carries is the last elapsed value, used to keep accrual monotonic when
//! tick observations arrive out of order.
//!
//! Charge policy: the flat bid amount covers the call; when a per-minute
//! rate is configured, every started minute adds `rate_per_minute_cents`.
//! The final amount is never below the bid amount.

use serde::{Deserialize, Serialize};

/// Accrues charge for one call from elapsed seconds and the agreed rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateMeter {
    bid_amount_cents: i64,
    rate_per_minute_cents: Option<i64>,
    last_elapsed_secs: u64,
}

impl RateMeter {
    /// Create a meter for a call with the given flat amount and optional
    /// per-minute rate.
    #[must_use]
    pub const fn new(bid_amount_cents: i64, rate_per_minute_cents: Option<i64>) -> Self {
        Self {
            bid_amount_cents,
            rate_per_minute_cents,
            last_elapsed_secs: 0,
        }
    }

    /// Accrued charge at `elapsed_secs`, in cents.
    ///
    /// Elapsed time is clamped to the largest value seen so far, so the
    /// returned amount never decreases across successive ticks.
    pub fn tick(&mut self, elapsed_secs: u64) -> i64 {
        self.last_elapsed_secs = self.last_elapsed_secs.max(elapsed_secs);
        Self::accrued_at(
            self.bid_amount_cents,
            self.rate_per_minute_cents,
            self.last_elapsed_secs,
        )
    }

    /// Final charge for a call of `duration_secs`, in cents.
    ///
    /// Monotonic against the ticks already observed: the duration is
    /// clamped to the last elapsed value, and the result is never below
    /// the flat bid amount.
    #[must_use]
    pub fn finalize(&self, duration_secs: u64) -> i64 {
        let elapsed = duration_secs.max(self.last_elapsed_secs);
        Self::accrued_at(self.bid_amount_cents, self.rate_per_minute_cents, elapsed)
            .max(self.bid_amount_cents)
    }

    /// The last elapsed value observed, in seconds.
    #[must_use]
    pub const fn last_elapsed_secs(&self) -> u64 {
        self.last_elapsed_secs
    }

    /// Pure accrual: `bid + rate * started_minutes(elapsed)`.
    ///
    /// Saturates at `i64::MAX` so absurd amounts or durations cap out
    /// rather than wrapping.
    #[must_use]
    pub const fn accrued_at(
        bid_amount_cents: i64,
        rate_per_minute_cents: Option<i64>,
        elapsed_secs: u64,
    ) -> i64 {
        match rate_per_minute_cents {
            Some(rate) => {
                bid_amount_cents.saturating_add(rate.saturating_mul(started_minutes(elapsed_secs)))
            }
            None => bid_amount_cents,
        }
    }
}

/// Whole minutes started at `elapsed_secs`: `ceil(elapsed / 60)`.
#[allow(clippy::cast_possible_wrap)]
const fn started_minutes(elapsed_secs: u64) -> i64 {
    (elapsed_secs.div_ceil(60)) as i64
}
