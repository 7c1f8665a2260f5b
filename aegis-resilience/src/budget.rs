//! Spend-cap envelope with atomic reservations.
//!
//! An invocation that would exceed the window cap never starts: callers
//! must hold a [`Reservation`] before spending, and a reservation dropped
//! without commit rolls its cost back, so downstream failures do not leak
//! budget.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::ResilienceError;

/// Cost caps per accounting window, in abstract cost units.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub hourly_cap: f64,
    pub daily_cap: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            hourly_cap: 100.0,
            daily_cap: 1500.0,
        }
    }
}

#[derive(Debug)]
struct Window {
    started: DateTime<Utc>,
    length: Duration,
    cap: f64,
    spent: f64,
    reserved: f64,
}

impl Window {
    fn roll_if_elapsed(&mut self, now: DateTime<Utc>) {
        if now - self.started >= self.length {
            self.started = now;
            self.spent = 0.0;
            // Reservations in flight carry across the roll; they were
            // admitted under the old window and settle under the new one.
            debug!(cap = self.cap, "budget window rolled over");
        }
    }

    fn available(&self) -> f64 {
        self.cap - self.spent - self.reserved
    }
}

/// Point-in-time budget accounting for the health monitor and tests.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub hourly_cap: f64,
    pub hourly_spent: f64,
    pub hourly_reserved: f64,
    pub daily_cap: f64,
    pub daily_spent: f64,
    pub daily_reserved: f64,
}

/// Process-wide spend envelope over hourly and daily windows.
pub struct BudgetEnvelope {
    hour: Mutex<Window>,
    day: Mutex<Window>,
}

impl BudgetEnvelope {
    pub fn new(config: BudgetConfig) -> Self {
        let now = Utc::now();
        Self {
            hour: Mutex::new(Window {
                started: now,
                length: Duration::hours(1),
                cap: config.hourly_cap,
                spent: 0.0,
                reserved: 0.0,
            }),
            day: Mutex::new(Window {
                started: now,
                length: Duration::days(1),
                cap: config.daily_cap,
                spent: 0.0,
                reserved: 0.0,
            }),
        }
    }

    /// Reserve `cost` against both windows, or refuse. The reservation is
    /// released on drop unless committed.
    pub fn try_reserve(
        self: &Arc<Self>,
        tier: &str,
        cost: f64,
    ) -> Result<Reservation, ResilienceError> {
        let now = Utc::now();
        let mut hour = self.hour.lock();
        let mut day = self.day.lock();
        hour.roll_if_elapsed(now);
        day.roll_if_elapsed(now);

        if hour.available() < cost || day.available() < cost {
            warn!(
                tier,
                cost,
                hourly_available = hour.available(),
                daily_available = day.available(),
                "budget reservation denied"
            );
            return Err(ResilienceError::BudgetDenied {
                tier: tier.to_string(),
                estimated_cost: cost,
            });
        }

        hour.reserved += cost;
        day.reserved += cost;
        Ok(Reservation {
            envelope: self.clone(),
            cost,
            settled: false,
        })
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let hour = self.hour.lock();
        let day = self.day.lock();
        BudgetSnapshot {
            hourly_cap: hour.cap,
            hourly_spent: hour.spent,
            hourly_reserved: hour.reserved,
            daily_cap: day.cap,
            daily_spent: day.spent,
            daily_reserved: day.reserved,
        }
    }

    fn settle(&self, cost: f64, spend: bool) {
        let mut hour = self.hour.lock();
        let mut day = self.day.lock();
        hour.reserved = (hour.reserved - cost).max(0.0);
        day.reserved = (day.reserved - cost).max(0.0);
        if spend {
            hour.spent += cost;
            day.spent += cost;
        }
    }

    #[cfg(test)]
    fn backdate_hour(&self, hours: i64) {
        self.hour.lock().started = Utc::now() - Duration::hours(hours);
    }
}

/// An admitted, not-yet-settled spend. Commit when the paid work
/// succeeded; dropping without commit rolls the reservation back.
pub struct Reservation {
    envelope: Arc<BudgetEnvelope>,
    cost: f64,
    settled: bool,
}

impl Reservation {
    pub fn cost(&self) -> f64 {
        self.cost
    }

    /// Convert the reservation into spend.
    pub fn commit(mut self) {
        self.settled = true;
        self.envelope.settle(self.cost, true);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            self.envelope.settle(self.cost, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(hourly: f64, daily: f64) -> Arc<BudgetEnvelope> {
        Arc::new(BudgetEnvelope::new(BudgetConfig {
            hourly_cap: hourly,
            daily_cap: daily,
        }))
    }

    #[test]
    fn committed_spend_counts_against_the_cap() {
        let budget = envelope(10.0, 100.0);
        budget.try_reserve("accurate", 6.0).unwrap().commit();

        // 6 spent: a 5-unit reservation no longer fits the hourly cap.
        assert!(matches!(
            budget.try_reserve("accurate", 5.0),
            Err(ResilienceError::BudgetDenied { .. })
        ));
        budget.try_reserve("balanced", 4.0).unwrap().commit();
        assert_eq!(budget.snapshot().hourly_spent, 10.0);
    }

    #[test]
    fn dropped_reservation_rolls_back() {
        let budget = envelope(10.0, 100.0);
        {
            let _reservation = budget.try_reserve("accurate", 10.0).unwrap();
            assert!(budget.try_reserve("fast", 1.0).is_err());
        }
        // Downstream failed; the budget is whole again.
        assert!(budget.try_reserve("fast", 1.0).is_ok());
    }

    #[test]
    fn reservations_plus_spend_never_exceed_the_cap() {
        let budget = envelope(10.0, 100.0);
        let r1 = budget.try_reserve("fast", 4.0).unwrap();
        let r2 = budget.try_reserve("fast", 4.0).unwrap();
        assert!(budget.try_reserve("fast", 4.0).is_err());
        r1.commit();
        r2.commit();

        let snapshot = budget.snapshot();
        assert!(snapshot.hourly_spent + snapshot.hourly_reserved <= snapshot.hourly_cap);
    }

    #[test]
    fn daily_cap_binds_even_when_hourly_would_admit() {
        let budget = envelope(10.0, 12.0);
        budget.try_reserve("accurate", 8.0).unwrap().commit();
        budget.backdate_hour(2);

        // Fresh hour, but the day has only 4 units left.
        assert!(budget.try_reserve("accurate", 5.0).is_err());
        assert!(budget.try_reserve("accurate", 4.0).is_ok());
    }

    #[test]
    fn hourly_window_rolls_over() {
        let budget = envelope(10.0, 100.0);
        budget.try_reserve("accurate", 10.0).unwrap().commit();
        assert!(budget.try_reserve("fast", 1.0).is_err());

        budget.backdate_hour(2);
        assert!(budget.try_reserve("fast", 1.0).is_ok());
    }
}
