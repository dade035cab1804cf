//! Token ledger and entitlement engine.
//!
//! Accounts hold a consumable token balance that gates feature usage. The
//! balance is reset monthly according to the account's tier and topped up
//! through one-time purchases.
//!
//! ## Design
//! - Entitlement table: pure tier/package lookups
//! - Rolling 30-day refill window anchored at the last refill
//! - Purchased tokens tracked separately so refills never erase them
//! - Optimistic concurrency on every write, retried with jittered backoff

pub mod account;
pub mod entitlement;
pub mod error;
pub mod ledger;
pub mod refill;
pub mod retry;
pub mod secret;

pub use account::{
    normalize_email, Account, AccountRef, Balance, BalanceView, ConsumeOutcome, RefillOutcome,
    Tier,
};
pub use entitlement::{
    find_package, find_package_by_price, find_package_by_price_id, tier_entitlement,
    tier_entitlement_by_name, Package, TierEntitlement, TokenCredit, PACKAGES,
};
pub use error::LedgerError;
pub use ledger::{
    validate_email, LedgerService, PurchaseOutcome, Registration, VerifiedAccount,
};
pub use refill::{RefillStatus, REFILL_PERIOD_DAYS};
pub use retry::RetryPolicy;
