// Logmet -- extract metrics from log streams
// Copyright (C) 2025  The logmet authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime};

/// Granularity of interruptible sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Seconds since the Unix epoch.
///
/// The system clock may be before the epoch on badly configured hosts. Metric
/// timestamps saturate at zero in that case.
pub fn now_epoch() -> i64 {
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(_) => 0,
    }
}

/// Ticker that expires at constant cadence.
///
/// The reference is the last expiry, not the current time, so late ticks do
/// not accumulate drift.
pub struct Ticker {
    period: Duration,
    last_tick: Instant,
}

impl Ticker {
    /// Create a new ticker. An expired ticker fires on the first check.
    pub fn new(period: Duration, expired: bool) -> Ticker {
        let now = Instant::now();
        Ticker {
            period,
            last_tick: if expired {
                now.checked_sub(period).unwrap_or(now)
            } else {
                now
            },
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Remaining time before the next tick, or None if it is due.
    pub fn remaining(&self) -> Option<Duration> {
        self.period.checked_sub(self.last_tick.elapsed())
    }

    /// Check if the tick is due and rearm from the theoretical expiry.
    pub fn expired(&mut self) -> bool {
        match self.remaining() {
            Some(_) => false,
            None => {
                self.last_tick = Instant::now()
                    .checked_sub(self.last_tick.elapsed() - self.period)
                    .unwrap_or_else(Instant::now);
                true
            }
        }
    }

    /// Sleep until the next tick or until the predicate becomes true.
    ///
    /// Returns false if the wait was interrupted by the predicate.
    pub fn sleep_unless<F>(&mut self, interrupted: F) -> bool
    where
        F: Fn() -> bool,
    {
        while let Some(remaining) = self.remaining() {
            if interrupted() {
                return false;
            }
            sleep(remaining.min(SLEEP_SLICE));
        }
        !interrupted()
    }
}

#[cfg(test)]
mod tests {

    use std::time::Duration;

    use super::Ticker;

    #[test]
    fn expired_on_creation() {
        let mut ticker1 = Ticker::new(Duration::from_secs(60), true);
        assert!(ticker1.expired());
        assert!(!ticker1.expired());
        let mut ticker2 = Ticker::new(Duration::from_secs(60), false);
        assert!(!ticker2.expired());
    }

    #[test]
    fn remaining_decreases() {
        let ticker = Ticker::new(Duration::from_secs(60), false);
        let first = ticker.remaining().unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let second = ticker.remaining().unwrap();
        assert!(second < first);
    }

    #[test]
    fn sleep_interrupted() {
        let mut ticker = Ticker::new(Duration::from_secs(60), false);
        assert!(!ticker.sleep_unless(|| true));
    }

    #[test]
    fn sleep_completes() {
        let mut ticker = Ticker::new(Duration::from_millis(5), false);
        assert!(ticker.sleep_unless(|| false));
        assert!(ticker.expired());
    }
}
