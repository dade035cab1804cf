//! Account record and the value types the ledger hands back to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use super::error::LedgerError;

// ── Tier ─────────────────────────────────────────────────────────

/// Subscription tier of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Default tier, small monthly allowance.
    Free,
    /// Larger monthly allowance.
    Premium,
    /// Unlimited usage, balance is never decremented.
    Pro,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Premium => "premium",
            Self::Pro => "pro",
        }
    }

    pub fn is_unlimited(self) -> bool {
        matches!(self, Self::Pro)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "premium" => Ok(Self::Premium),
            "pro" => Ok(Self::Pro),
            other => Err(LedgerError::UnknownEntitlement(format!("tier '{other}'"))),
        }
    }
}

// ── Balance ──────────────────────────────────────────────────────

/// Spendable balance as reported to callers.
///
/// Serializes as a plain number, or the string `"unlimited"` for pro
/// accounts. There is no negative sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Balance {
    Limited(u64),
    Unlimited,
}

impl Balance {
    pub fn is_unlimited(self) -> bool {
        matches!(self, Self::Unlimited)
    }

    /// Numeric value for limited balances.
    pub fn tokens(self) -> Option<u64> {
        match self {
            Self::Limited(n) => Some(n),
            Self::Unlimited => None,
        }
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(n) => write!(f, "{n}"),
            Self::Unlimited => f.write_str("unlimited"),
        }
    }
}

impl Serialize for Balance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Limited(n) => serializer.serialize_u64(*n),
            Self::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

// ── Account reference ────────────────────────────────────────────

/// Any of the unique keys an account can be addressed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AccountRef {
    Id(String),
    Email(String),
    ApiKey(String),
}

impl AccountRef {
    pub fn id(id: impl Into<String>) -> Self {
        Self::Id(id.into())
    }

    /// Email references are case-normalized on construction.
    pub fn email(email: &str) -> Self {
        Self::Email(normalize_email(email))
    }

    pub fn api_key(key: impl Into<String>) -> Self {
        Self::ApiKey(key.into())
    }

    /// Parse a CLI-style reference: `id:<id>`, `email:<addr>`, `key:<api key>`,
    /// or a bare value (treated as an email if it contains `@`, else an id).
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("id:") {
            return Self::id(rest);
        }
        if let Some(rest) = raw.strip_prefix("email:") {
            return Self::email(rest);
        }
        if let Some(rest) = raw.strip_prefix("key:") {
            return Self::api_key(rest);
        }
        if raw.contains('@') {
            Self::email(raw)
        } else {
            Self::id(raw)
        }
    }

    /// Log-safe rendering: API keys are never written out in full.
    pub fn redacted(&self) -> String {
        match self {
            Self::Id(id) => format!("id:{id}"),
            Self::Email(email) => format!("email:{email}"),
            Self::ApiKey(key) => {
                let prefix: String = key.chars().take(6).collect();
                format!("key:{prefix}…")
            }
        }
    }
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Trim and lowercase an email address.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

// ── Account ──────────────────────────────────────────────────────

/// One account per end user / extension installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Stable identifier, immutable after creation.
    pub id: String,
    /// Unique, case-normalized.
    pub email: String,
    /// Secret used by the extension to authenticate.
    pub api_key: String,
    pub tier: Tier,
    /// Spendable tokens. Frozen (kept but not consulted) while on `pro`.
    pub balance: u64,
    /// Portion of `balance` that came from one-time purchases.
    pub purchased_balance: u64,
    /// Lifetime usage, reporting only.
    pub total_consumed: u64,
    pub last_refill_at: DateTime<Utc>,
    pub email_verified: bool,
    /// Outstanding email verification token, cleared once verified.
    #[serde(skip_serializing)]
    pub verification_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency version, bumped on every write.
    pub version: u64,
}

impl Account {
    /// Balance as seen by callers.
    pub fn available(&self) -> Balance {
        if self.tier.is_unlimited() {
            Balance::Unlimited
        } else {
            Balance::Limited(self.balance)
        }
    }

    /// Tokens that came from the monthly allowance rather than purchases.
    pub fn free_portion(&self) -> u64 {
        self.balance.saturating_sub(self.purchased_balance)
    }

    pub fn view(&self) -> BalanceView {
        BalanceView {
            balance: self.available(),
            tier: self.tier,
        }
    }

    /// Check the record-level invariants. Pro accounts carry frozen
    /// bookkeeping, which must still be internally consistent.
    pub fn check_invariants(&self) -> bool {
        self.purchased_balance <= self.balance
    }
}

// ── Views ────────────────────────────────────────────────────────

/// Result of a balance query or tier change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BalanceView {
    pub balance: Balance,
    pub tier: Tier,
}

/// Result of `refill_if_due`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefillOutcome {
    pub refilled: bool,
    pub balance: Balance,
}

/// Result of a successful `consume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumeOutcome {
    pub remaining: Balance,
    pub tier: Tier,
}
