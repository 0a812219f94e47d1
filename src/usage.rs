use crate::error::EngineError;
use crate::store::Store;
use chrono::NaiveDate;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Proof that one quota unit was set aside for a marketplace call.
/// Must be given back via [`UsageTracker::commit`] once the call is
/// issued, or [`UsageTracker::release`] if it never was.
#[must_use]
#[derive(Debug)]
pub struct Reservation {
    date: NaiveDate,
}

#[derive(Debug)]
struct DayState {
    date: NaiveDate,
    /// Durably counted calls.
    used: u32,
    /// Reserved but not yet committed.
    reserved: u32,
}

/// Process-wide tracker of marketplace calls against the daily quota.
///
/// The check-and-reserve step is serialized behind one mutex, so
/// concurrent workers can never collectively over-issue: `remaining()`
/// accounts for both committed calls and outstanding reservations, and
/// a commit persists the counter before the caller may trust the
/// call's result.
pub struct UsageTracker<S> {
    store: Arc<S>,
    daily_limit: u32,
    state: Mutex<DayState>,
}

impl<S: Store> UsageTracker<S> {
    pub fn new(store: Arc<S>, daily_limit: u32) -> Self {
        Self {
            store,
            daily_limit,
            state: Mutex::new(DayState {
                date: NaiveDate::MIN,
                used: 0,
                reserved: 0,
            }),
        }
    }

    /// Calls still permitted today. Never negative.
    pub async fn remaining(&self, today: NaiveDate) -> Result<u32, EngineError> {
        let mut state = self.state.lock().await;
        self.roll_over(&mut state, today).await?;
        Ok(self.daily_limit.saturating_sub(state.used + state.reserved))
    }

    /// Atomically checks the quota and sets one unit aside.
    pub async fn try_reserve(&self, today: NaiveDate) -> Result<Reservation, EngineError> {
        let mut state = self.state.lock().await;
        self.roll_over(&mut state, today).await?;
        if state.used + state.reserved >= self.daily_limit {
            return Err(EngineError::QuotaExhausted { date: today });
        }
        state.reserved += 1;
        Ok(Reservation { date: today })
    }

    /// Converts a reservation into a durable count. The persisted
    /// increment happens before this returns; only then may the
    /// marketplace call's result be used.
    pub async fn commit(&self, reservation: Reservation) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        self.store.increment_usage(reservation.date).await?;
        if state.date == reservation.date {
            state.reserved = state.reserved.saturating_sub(1);
            state.used += 1;
        }
        Ok(())
    }

    /// Returns an unused reservation (the call was never issued).
    pub async fn release(&self, reservation: Reservation) {
        let mut state = self.state.lock().await;
        if state.date == reservation.date {
            state.reserved = state.reserved.saturating_sub(1);
        }
    }

    /// Reloads the persisted counter when the tracked day is not
    /// `today`. Caller holds the state lock.
    async fn roll_over(&self, state: &mut DayState, today: NaiveDate) -> Result<(), EngineError> {
        if state.date != today {
            state.used = self.store.load_usage(today).await?;
            state.reserved = 0;
            state.date = today;
        }
        Ok(())
    }
}
