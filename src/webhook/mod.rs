//! Payment webhook processing.
//!
//! Each delivery moves through `Received -> Verified -> Resolved` and ends in
//! one of `Applied`, `Duplicate`, `Ignored`, or `Rejected`. The idempotency
//! record for an event is written only after its credit has been applied, so
//! a crash in between costs at most one re-attempted delivery.

pub mod event;
pub mod signature;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::billing::{
    find_package, find_package_by_price, find_package_by_price_id, Balance, LedgerError,
    LedgerService, Package, Tier, TokenCredit,
};
use crate::metrics::LedgerMetrics;
use crate::notify::{self, Notifier, Template};
use crate::store::{ProcessedEventStore, StoreError};

pub use event::{CheckoutSession, ProviderEvent, CHECKOUT_COMPLETED};
pub use signature::SignatureError;

/// Default allowed clock skew between the provider and us.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Where a delivery stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookStage {
    Received,
    Verified,
    Resolved,
    Applied,
    Duplicate,
    Ignored,
    Rejected,
}

impl WebhookStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Verified => "verified",
            Self::Resolved => "resolved",
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::Ignored => "ignored",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for WebhookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successful terminal states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied {
        event_id: String,
        account_id: String,
        package_id: &'static str,
        created: bool,
        tier: Tier,
        balance: Balance,
    },
    /// Already processed; nothing changed.
    Duplicate { event_id: String },
    /// Verified but not an event type the ledger acts on.
    Ignored { event_id: String, kind: String },
}

impl WebhookOutcome {
    pub fn stage(&self) -> WebhookStage {
        match self {
            Self::Applied { .. } => WebhookStage::Applied,
            Self::Duplicate { .. } => WebhookStage::Duplicate,
            Self::Ignored { .. } => WebhookStage::Ignored,
        }
    }

    pub fn event_id(&self) -> &str {
        match self {
            Self::Applied { event_id, .. }
            | Self::Duplicate { event_id }
            | Self::Ignored { event_id, .. } => event_id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("signature rejected: {0}")]
    SignatureInvalid(#[from] SignatureError),

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WebhookError {
    /// Whether provider redelivery could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SignatureInvalid(_) | Self::MalformedEvent(_) => false,
            Self::Ledger(e) => e.is_retryable(),
            Self::Store(e) => e.is_transient(),
        }
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::SignatureInvalid(_) => "signature_invalid",
            Self::MalformedEvent(_) => "malformed",
            Self::Ledger(LedgerError::UnknownEntitlement(_)) => "unresolved",
            Self::Ledger(_) | Self::Store(_) => "failed",
        }
    }
}

/// Verification and package-mapping settings.
#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub secret: String,
    pub tolerance_secs: i64,
    /// Provider price id -> package id.
    pub price_map: HashMap<String, String>,
    /// Base URL for the verification link mailed to unverified buyers.
    pub public_url: String,
}

/// What a verified checkout resolved to.
struct Resolved {
    event_id: String,
    email: String,
    package: &'static Package,
}

pub struct WebhookProcessor {
    ledger: Arc<LedgerService>,
    events: Arc<dyn ProcessedEventStore>,
    notifier: Arc<dyn Notifier>,
    settings: WebhookSettings,
    metrics: Arc<LedgerMetrics>,
}

impl WebhookProcessor {
    pub fn new(
        ledger: Arc<LedgerService>,
        events: Arc<dyn ProcessedEventStore>,
        notifier: Arc<dyn Notifier>,
        settings: WebhookSettings,
        metrics: Arc<LedgerMetrics>,
    ) -> Self {
        Self {
            ledger,
            events,
            notifier,
            settings,
            metrics,
        }
    }

    /// Run one delivery to a terminal state.
    pub async fn process(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, WebhookError> {
        let result = self.run(payload, signature_header, now).await;
        match &result {
            Ok(outcome) => {
                self.metrics.record_webhook(outcome.stage().as_str());
                tracing::info!(event_id = outcome.event_id(), stage = %outcome.stage(), "webhook handled");
            }
            Err(e) => {
                self.metrics.record_webhook(e.label());
                if matches!(e, WebhookError::Ledger(LedgerError::UnknownEntitlement(_))) {
                    tracing::error!(error = %e, "webhook needs manual reconciliation");
                } else {
                    tracing::warn!(error = %e, stage = %WebhookStage::Rejected, "webhook rejected");
                }
            }
        }
        result
    }

    async fn run(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, WebhookError> {
        // Received -> Verified
        signature::verify(
            &self.settings.secret,
            payload,
            signature_header,
            now.timestamp(),
            self.settings.tolerance_secs,
        )?;
        let event = ProviderEvent::parse(payload)
            .map_err(|e| WebhookError::MalformedEvent(e.to_string()))?;
        if !event.is_checkout_completed() {
            return Ok(WebhookOutcome::Ignored {
                event_id: event.id,
                kind: event.kind,
            });
        }

        // Verified -> Resolved
        let resolved = self.resolve(event)?;
        tracing::debug!(
            event_id = %resolved.event_id,
            package = resolved.package.id,
            stage = %WebhookStage::Resolved,
            "checkout resolved"
        );

        if self.events.exists(&resolved.event_id).await? {
            return Ok(WebhookOutcome::Duplicate {
                event_id: resolved.event_id,
            });
        }

        // Resolved -> Applied. Record only after the credit lands.
        let purchase = self
            .ledger
            .apply_purchase(&resolved.email, resolved.package, now)
            .await?;
        self.record(&resolved.event_id, now).await;

        let activation_link = purchase
            .verification_token
            .as_deref()
            .map(|token| notify::verification_link(&self.settings.public_url, &purchase.email, token));
        let template = match resolved.package.credit {
            TokenCredit::Tokens(tokens) => Template::TokenPurchase {
                tokens,
                balance: purchase.balance,
                activation_link,
            },
            TokenCredit::Unlimited => Template::ProUpgrade { activation_link },
        };
        notify::dispatch(self.notifier.clone(), purchase.email.clone(), template);

        Ok(WebhookOutcome::Applied {
            event_id: resolved.event_id,
            account_id: purchase.account_id,
            package_id: resolved.package.id,
            created: purchase.created,
            tier: purchase.tier,
            balance: purchase.balance,
        })
    }

    fn resolve(&self, event: ProviderEvent) -> Result<Resolved, WebhookError> {
        let session = CheckoutSession::from_object(&event.data.object)
            .map_err(|e| WebhookError::MalformedEvent(format!("checkout session: {e}")))?;
        let email = session
            .email()
            .ok_or_else(|| WebhookError::MalformedEvent("no customer email".into()))?
            .to_string();
        let package = self.resolve_package(&session)?;
        Ok(Resolved {
            event_id: event.id,
            email,
            package,
        })
    }

    /// Package by explicit id, then by mapped price id, then by amount. An
    /// unmapped price id falls through to the amount when one is present.
    fn resolve_package(&self, session: &CheckoutSession) -> Result<&'static Package, LedgerError> {
        if let Some(package_id) = session.package_id() {
            return find_package(package_id);
        }
        if let Some(price_id) = session.price_id() {
            match find_package_by_price_id(&self.settings.price_map, price_id) {
                Ok(package) => return Ok(package),
                Err(e) if session.amount_total.is_none() => return Err(e),
                Err(_) => {
                    tracing::debug!(price_id, "price id not mapped, resolving by amount");
                }
            }
        }
        match session.amount_total {
            Some(amount) => find_package_by_price(amount),
            None => Err(LedgerError::UnknownEntitlement(format!(
                "checkout {} names no package, price, or amount",
                session.id
            ))),
        }
    }

    /// Write the idempotency record. The credit is already committed, so a
    /// failure here is logged rather than surfaced.
    async fn record(&self, event_id: &str, now: DateTime<Utc>) {
        match self.events.conditional_create(event_id, now).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => {
                tracing::warn!(event_id, "concurrent delivery recorded this event first");
            }
            Err(e) => {
                tracing::error!(event_id, error = %e, "failed to record processed event");
            }
        }
    }
}
