//! Outbound notifications: purchase confirmations and email verification.
//!
//! Sending is always a side effect of an already-committed ledger change.
//! [`dispatch`] runs the send on its own task; failures are logged and
//! dropped, never reported back to the caller.

pub mod smtp;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::billing::Balance;

pub use smtp::SmtpNotifier;

/// Notification failures. Only ever logged.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("invalid address: {0}")]
    Address(String),

    #[error("failed to build message: {0}")]
    Build(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Message kinds the service sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Template {
    /// Tokens were added by a purchase.
    TokenPurchase {
        tokens: u64,
        balance: Balance,
        /// Verification link for buyers who have not confirmed their email.
        activation_link: Option<String>,
    },
    /// Account moved to the unlimited tier.
    ProUpgrade { activation_link: Option<String> },
    /// Confirm ownership of the address.
    EmailVerification { link: String },
}

impl Template {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TokenPurchase { .. } => "token_purchase",
            Self::ProUpgrade { .. } => "pro_upgrade",
            Self::EmailVerification { .. } => "email_verification",
        }
    }

    pub fn subject(&self) -> String {
        match self {
            Self::TokenPurchase { tokens, .. } => format!("{tokens} tokens added to your account"),
            Self::ProUpgrade { .. } => "Welcome to Pro".to_string(),
            Self::EmailVerification { .. } => "Verify your email address".to_string(),
        }
    }

    /// Plain-text body.
    pub fn body(&self) -> String {
        match self {
            Self::TokenPurchase {
                tokens,
                balance,
                activation_link,
            } => {
                let mut body = format!(
                    "Thank you for your purchase!\n\n\
                     {tokens} tokens have been added to your account.\n\
                     Current balance: {balance} tokens.\n"
                );
                push_activation(&mut body, activation_link.as_deref());
                body
            }
            Self::ProUpgrade { activation_link } => {
                let mut body = String::from(
                    "Your account is now on the Pro plan.\n\
                     Scans are unlimited and no longer draw from your token balance.\n",
                );
                push_activation(&mut body, activation_link.as_deref());
                body
            }
            Self::EmailVerification { link } => format!(
                "Please confirm your email address by opening the link below:\n\n{link}\n\n\
                 If you did not sign up, you can ignore this message.\n"
            ),
        }
    }
}

fn push_activation(body: &mut String, link: Option<&str>) {
    if let Some(link) = link {
        body.push_str(&format!(
            "\nConfirm your email address to receive the API key for the extension:\n\n{link}\n"
        ));
    }
}

/// `{base_url}/api/verify-email?email=..&token=..`
pub fn verification_link(base_url: &str, email: &str, token: &str) -> String {
    format!(
        "{}/api/verify-email?email={}&token={}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(email),
        urlencoding::encode(token),
    )
}

/// Delivery backend.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Deliver one message.
    async fn send(&self, to: &str, template: &Template) -> Result<(), NotifyError>;

    /// Release any held transport. Default: nothing to release.
    async fn shutdown(&self) {}
}

/// Send in the background. The returned handle is only useful to tests;
/// production callers drop it.
pub fn dispatch(
    notifier: Arc<dyn Notifier>,
    to: String,
    template: Template,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match notifier.send(&to, &template).await {
            Ok(()) => tracing::debug!(
                notifier = notifier.name(),
                template = template.name(),
                "notification sent"
            ),
            Err(e) => tracing::warn!(
                notifier = notifier.name(),
                template = template.name(),
                error = %e,
                "notification failed"
            ),
        }
    })
}

// ── Built-in notifiers ──────────────────────────────────────────

/// Writes messages to the log instead of delivering them.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, to: &str, template: &Template) -> Result<(), NotifyError> {
        tracing::info!(
            to,
            template = template.name(),
            subject = %template.subject(),
            "notification (not delivered)"
        );
        Ok(())
    }
}

/// Keeps sent messages in memory.
#[derive(Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<(String, Template)>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything sent so far.
    pub fn sent(&self) -> Vec<(String, Template)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, to: &str, template: &Template) -> Result<(), NotifyError> {
        self.sent.lock().push((to.to_string(), template.clone()));
        Ok(())
    }
}

#[cfg(test)]
pub(crate) struct FailingNotifier;

#[cfg(test)]
#[async_trait]
impl Notifier for FailingNotifier {
    fn name(&self) -> &str {
        "failing"
    }

    async fn send(&self, _to: &str, _template: &Template) -> Result<(), NotifyError> {
        Err(NotifyError::Transport("connection refused".into()))
    }
}
