// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Daily budget ledger.
//!
//! [`BudgetLedger`] tracks two integer totals, in cents:
//!
//! * `reserved`: estimates held by leases that are still in flight
//! * `consumed`: actual costs posted by released leases this period
//!
//! The accounting period is the UTC calendar day.  When the ledger first
//! observes a new day, `consumed` resets to zero; `reserved` carries over
//! because the leases holding it are still in flight.  Release never lowers
//! `consumed`.

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time view of the ledger, for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSnapshot {
    pub period: NaiveDate,
    pub reserved_cents: u64,
    pub consumed_cents: u64,
}

/// Reserved-plus-consumed accounting for one UTC day.
///
/// # Examples
///
/// ```rust
/// use chrono::{TimeZone, Utc};
/// use model_governor_core::budget::BudgetLedger;
///
/// let now = Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap();
/// let mut ledger = BudgetLedger::new(now);
///
/// // A reservation that exactly fills the budget is admitted.
/// assert!(ledger.can_reserve(100, 100));
/// ledger.reserve(100);
/// assert!(!ledger.can_reserve(1, 100));
///
/// // Settling posts the actual cost instead of the estimate.
/// ledger.settle(100, 60);
/// assert_eq!(ledger.remaining(100), 40);
/// ```
#[derive(Debug, Clone)]
pub struct BudgetLedger {
    period: NaiveDate,
    reserved_cents: u64,
    consumed_cents: u64,
}

impl BudgetLedger {
    /// Open a ledger for the UTC day containing `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            period: now.date_naive(),
            reserved_cents: 0,
            consumed_cents: 0,
        }
    }

    /// Reset `consumed` if `now` falls on a later UTC day.
    ///
    /// Returns `true` when a rollover happened.
    pub fn roll_over(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if today <= self.period {
            return false;
        }
        self.period = today;
        self.consumed_cents = 0;
        true
    }

    /// Whether `amount` fits under `limit` alongside everything already
    /// reserved or consumed.  The comparison is inclusive.
    pub fn can_reserve(&self, amount: u64, limit: u64) -> bool {
        self.committed()
            .checked_add(amount)
            .is_some_and(|total| total <= limit)
    }

    /// Hold `amount` for an in-flight lease.
    pub fn reserve(&mut self, amount: u64) {
        self.reserved_cents = self.reserved_cents.saturating_add(amount);
    }

    /// Drop a reservation without posting any cost (expiry).
    pub fn release_reservation(&mut self, amount: u64) {
        self.reserved_cents = self.reserved_cents.saturating_sub(amount);
    }

    /// Drop a reservation and post the actual cost in its place (release).
    pub fn settle(&mut self, reserved: u64, actual: u64) {
        self.release_reservation(reserved);
        self.consumed_cents = self.consumed_cents.saturating_add(actual);
    }

    /// Reserved plus consumed.
    pub fn committed(&self) -> u64 {
        self.reserved_cents.saturating_add(self.consumed_cents)
    }

    /// Budget left under `limit`, never negative.
    pub fn remaining(&self, limit: u64) -> u64 {
        limit.saturating_sub(self.committed())
    }

    pub fn reserved_cents(&self) -> u64 {
        self.reserved_cents
    }

    pub fn consumed_cents(&self) -> u64 {
        self.consumed_cents
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            period: self.period,
            reserved_cents: self.reserved_cents,
            consumed_cents: self.consumed_cents,
        }
    }

    /// Start of the next accounting period.
    pub fn next_rollover(&self) -> DateTime<Utc> {
        self.period
            .checked_add_days(Days::new(1))
            .and_then(|day| day.and_hms_opt(0, 0, 0))
            .map(|midnight| midnight.and_utc())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
