//! Error taxonomy for ledger operations.

use crate::store::StoreError;

/// Failures surfaced by [`LedgerService`](super::LedgerService).
///
/// Business-rule failures are returned unmodified for user-visible handling;
/// only [`LedgerError::ConcurrentUpdateExceeded`] and transient store errors
/// are worth retrying.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("unknown entitlement: {0}")]
    UnknownEntitlement(String),

    #[error("invalid amount: {0} (must be greater than zero)")]
    InvalidAmount(u64),

    #[error("insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: u64, need: u64 },

    #[error("concurrent update retries exhausted after {attempts} attempts")]
    ConcurrentUpdateExceeded { attempts: u32 },

    #[error("an account already exists for {0}")]
    AccountExists(String),

    #[error("invalid email address: {0}")]
    InvalidEmail(String),

    #[error("invalid or expired verification token")]
    InvalidVerificationToken,

    #[error("balance arithmetic overflow")]
    Overflow,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// Whether a caller may retry the same call unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConcurrentUpdateExceeded { .. } => true,
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Stable short code for API responses and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AccountNotFound(_) => "account_not_found",
            Self::UnknownEntitlement(_) => "unknown_entitlement",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::ConcurrentUpdateExceeded { .. } => "concurrent_update_exceeded",
            Self::AccountExists(_) => "account_exists",
            Self::InvalidEmail(_) => "invalid_email",
            Self::InvalidVerificationToken => "invalid_verification_token",
            Self::Overflow => "overflow",
            Self::Store(_) => "store_error",
        }
    }
}
