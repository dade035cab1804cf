//! Token ledger and entitlement engine for the Professor Rater extension.
//!
//! The [`billing::LedgerService`] owns every balance mutation. The
//! [`webhook::WebhookProcessor`] turns signed payment events into ledger
//! credits exactly once, and [`gateway`] exposes both over HTTP.

pub mod billing;
pub mod config;
pub mod gateway;
pub mod metrics;
pub mod notify;
pub mod store;
pub mod webhook;

pub use billing::{LedgerError, LedgerService};
pub use config::Config;
