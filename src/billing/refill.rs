//! Monthly refill policy.
//!
//! A refill is due once `now` leaves the rolling 30-day window that starts at
//! the account's `last_refill_at`. Calendar months play no part.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::account::{Account, Balance};
use super::entitlement::tier_entitlement;

/// Length of one refill period, in days.
pub const REFILL_PERIOD_DAYS: i64 = 30;

/// Length of one refill period.
pub fn refill_period() -> Duration {
    Duration::days(REFILL_PERIOD_DAYS)
}

/// Whether `now` falls outside the period anchored at `last_refill_at`.
///
/// A clock that reads earlier than the anchor never makes a refill due.
pub fn is_due(last_refill_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now >= last_refill_at + refill_period()
}

/// Balance a refill would set for this account, or `None` for unlimited tiers.
pub fn refill_amount(account: &Account) -> Option<u64> {
    let entitlement = tier_entitlement(account.tier);
    if entitlement.unlimited {
        return None;
    }
    entitlement
        .monthly_allowance
        .checked_add(account.purchased_balance)
}

/// Apply a due refill in place. Returns `true` when the record changed.
pub(crate) fn apply_if_due(account: &mut Account, now: DateTime<Utc>) -> bool {
    if !is_due(account.last_refill_at, now) {
        return false;
    }
    let Some(amount) = refill_amount(account) else {
        return false;
    };
    account.balance = amount;
    account.last_refill_at = now;
    true
}

/// Read-only report on where an account sits in its refill cycle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefillStatus {
    pub current_tokens: Balance,
    pub purchased_tokens: u64,
    pub last_refresh_date: DateTime<Utc>,
    pub days_since_last_refresh: i64,
    pub days_until_next_refresh: i64,
    pub refill_due: bool,
    pub next_refresh_amount: Balance,
}

impl RefillStatus {
    pub fn for_account(account: &Account, now: DateTime<Utc>) -> Self {
        let days_since = (now - account.last_refill_at).num_days().max(0);
        let next_amount = match refill_amount(account) {
            Some(n) => Balance::Limited(n),
            None => Balance::Unlimited,
        };
        Self {
            current_tokens: account.available(),
            purchased_tokens: account.purchased_balance,
            last_refresh_date: account.last_refill_at,
            days_since_last_refresh: days_since,
            days_until_next_refresh: (REFILL_PERIOD_DAYS - days_since).max(0),
            refill_due: is_due(account.last_refill_at, now),
            next_refresh_amount: next_amount,
        }
    }
}
