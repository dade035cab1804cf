//! Ledger service: balance queries and atomic consume/refill/credit/tier
//! changes against the account store.
//!
//! Every mutation is a read-modify-write guarded by the store's conditional
//! put. On a version conflict the whole cycle is retried under the
//! [`RetryPolicy`]; business-rule failures are never retried.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::account::{
    normalize_email, Account, AccountRef, Balance, BalanceView, ConsumeOutcome, RefillOutcome,
    Tier,
};
use super::entitlement::{tier_entitlement, Package, TokenCredit};
use super::error::LedgerError;
use super::refill::{self, RefillStatus};
use super::retry::RetryPolicy;
use super::secret::{constant_time_eq, generate_secret};
use crate::metrics::LedgerMetrics;
use crate::store::{AccountStore, StoreError};

/// What a mutation closure decided to do with the record it was handed.
enum Mutation<T> {
    /// Persist the modified record, then return the value.
    Write(T),
    /// Leave the store untouched and return the value.
    Skip(T),
}

/// Returned by [`LedgerService::register`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub account_id: String,
    pub email: String,
    pub api_key: String,
    #[serde(skip)]
    pub verification_token: String,
    pub tier: Tier,
    pub balance: Balance,
}

/// Returned by [`LedgerService::verify_email`]. Carries the API key, so it
/// is only ever built after the verification token matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedAccount {
    pub account_id: String,
    pub email: String,
    pub api_key: String,
}

/// Returned by [`LedgerService::apply_purchase`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurchaseOutcome {
    pub account_id: String,
    pub email: String,
    /// The purchase created the account.
    pub created: bool,
    pub tier: Tier,
    pub balance: Balance,
    /// Outstanding verification token while the email is unverified. The
    /// buyer redeems it for the API key.
    #[serde(skip)]
    pub verification_token: Option<String>,
}

/// Token ledger over a shared account store.
pub struct LedgerService {
    accounts: Arc<dyn AccountStore>,
    policy: RetryPolicy,
    metrics: Arc<LedgerMetrics>,
}

impl LedgerService {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        policy: RetryPolicy,
        metrics: Arc<LedgerMetrics>,
    ) -> Self {
        Self {
            accounts,
            policy,
            metrics,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Current balance and tier. No refill side effect.
    pub async fn get_balance(&self, key: &AccountRef) -> Result<BalanceView, LedgerError> {
        let result = self.load(key).await.map(|acct| acct.view());
        self.observe("get_balance", result)
    }

    /// Where the account sits in its refill cycle. Read-only.
    pub async fn refill_status(
        &self,
        key: &AccountRef,
        now: DateTime<Utc>,
    ) -> Result<RefillStatus, LedgerError> {
        let result = self
            .load(key)
            .await
            .map(|acct| RefillStatus::for_account(&acct, now));
        self.observe("refill_status", result)
    }

    pub async fn is_email_verified(&self, email: &str) -> Result<bool, LedgerError> {
        let result = self
            .load(&AccountRef::email(email))
            .await
            .map(|acct| acct.email_verified);
        self.observe("is_email_verified", result)
    }

    // ── Mutations ───────────────────────────────────────────────────

    /// Apply the monthly refill when the rolling window has elapsed.
    pub async fn refill_if_due(
        &self,
        key: &AccountRef,
        now: DateTime<Utc>,
    ) -> Result<RefillOutcome, LedgerError> {
        let result = self
            .mutate("refill", key, now, |acct| {
                let refilled = refill::apply_if_due(acct, now);
                let outcome = RefillOutcome {
                    refilled,
                    balance: acct.available(),
                };
                if refilled {
                    tracing::info!(account = %acct.id, balance = acct.balance, "monthly refill applied");
                    Ok(Mutation::Write(outcome))
                } else {
                    Ok(Mutation::Skip(outcome))
                }
            })
            .await;
        self.observe("refill", result)
    }

    /// Debit `amount` tokens. Free allowance is spent before purchased tokens.
    pub async fn consume(
        &self,
        key: &AccountRef,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, LedgerError> {
        let result = self.consume_inner(key, amount, now).await;
        self.observe("consume", result)
    }

    async fn consume_inner(
        &self,
        key: &AccountRef,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        self.refill_if_due(key, now).await?;

        self.mutate("consume", key, now, |acct| {
            // A refill can become due between the two writes.
            refill::apply_if_due(acct, now);

            if acct.tier.is_unlimited() {
                acct.total_consumed = acct.total_consumed.saturating_add(amount);
                return Ok(Mutation::Write(ConsumeOutcome {
                    remaining: Balance::Unlimited,
                    tier: acct.tier,
                }));
            }

            if acct.balance < amount {
                return Err(LedgerError::InsufficientBalance {
                    have: acct.balance,
                    need: amount,
                });
            }

            let purchased_debit = amount
                .saturating_sub(acct.free_portion())
                .min(acct.purchased_balance);
            acct.balance -= amount;
            acct.purchased_balance -= purchased_debit;
            acct.total_consumed = acct.total_consumed.saturating_add(amount);

            tracing::debug!(
                account = %acct.id,
                amount,
                purchased_debit,
                remaining = acct.balance,
                "tokens consumed"
            );
            Ok(Mutation::Write(ConsumeOutcome {
                remaining: Balance::Limited(acct.balance),
                tier: acct.tier,
            }))
        })
        .await
    }

    /// Add tokens; purchased credit is also tracked in `purchased_balance`.
    pub async fn credit(
        &self,
        key: &AccountRef,
        amount: u64,
        as_purchased: bool,
        now: DateTime<Utc>,
    ) -> Result<BalanceView, LedgerError> {
        let result = self.credit_inner(key, amount, as_purchased, now).await;
        self.observe("credit", result)
    }

    async fn credit_inner(
        &self,
        key: &AccountRef,
        amount: u64,
        as_purchased: bool,
        now: DateTime<Utc>,
    ) -> Result<BalanceView, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        self.mutate("credit", key, now, |acct| {
            acct.balance = acct
                .balance
                .checked_add(amount)
                .ok_or(LedgerError::Overflow)?;
            if as_purchased {
                acct.purchased_balance = acct
                    .purchased_balance
                    .checked_add(amount)
                    .ok_or(LedgerError::Overflow)?;
            }
            tracing::info!(account = %acct.id, amount, as_purchased, "tokens credited");
            Ok(Mutation::Write(acct.view()))
        })
        .await
    }

    /// Change tier. Balances are kept as-is, so leaving `pro` restores the
    /// bookkeeping that was frozen on the way in.
    pub async fn upgrade_tier(
        &self,
        key: &AccountRef,
        new_tier: Tier,
        now: DateTime<Utc>,
    ) -> Result<BalanceView, LedgerError> {
        let result = self
            .mutate("upgrade_tier", key, now, |acct| {
                if acct.tier == new_tier {
                    return Ok(Mutation::Skip(acct.view()));
                }
                tracing::info!(account = %acct.id, from = %acct.tier, to = %new_tier, "tier changed");
                acct.tier = new_tier;
                Ok(Mutation::Write(acct.view()))
            })
            .await;
        self.observe("upgrade_tier", result)
    }

    // ── Registration ────────────────────────────────────────────────

    /// Create a free account for `email` with a fresh API key and an
    /// outstanding verification token.
    pub async fn register(
        &self,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<Registration, LedgerError> {
        let result = self.register_inner(email, now).await;
        self.observe("register", result)
    }

    async fn register_inner(
        &self,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<Registration, LedgerError> {
        let email = validate_email(email)?;
        let account = new_account(email, now);
        let token = account.verification_token.clone().unwrap_or_default();

        match self.accounts.create(&account).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => {
                return Err(LedgerError::AccountExists(account.email));
            }
            Err(e) => return Err(e.into()),
        }
        tracing::info!(account = %account.id, "account registered");

        Ok(Registration {
            balance: account.available(),
            tier: account.tier,
            account_id: account.id,
            email: account.email,
            api_key: account.api_key,
            verification_token: token,
        })
    }

    /// Mark the account's email verified if `token` matches and hand back
    /// its API key. The token stays valid afterwards, so the emailed link
    /// keeps working as a key-recovery link; re-verifying skips the write.
    pub async fn verify_email(
        &self,
        email: &str,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifiedAccount, LedgerError> {
        let result = self
            .mutate("verify_email", &AccountRef::email(email), now, |acct| {
                let matches = acct
                    .verification_token
                    .as_deref()
                    .is_some_and(|expected| constant_time_eq(expected.as_bytes(), token.as_bytes()));
                if !matches {
                    return Err(LedgerError::InvalidVerificationToken);
                }
                let verified = VerifiedAccount {
                    account_id: acct.id.clone(),
                    email: acct.email.clone(),
                    api_key: acct.api_key.clone(),
                };
                if acct.email_verified {
                    return Ok(Mutation::Skip(verified));
                }
                acct.email_verified = true;
                tracing::info!(account = %acct.id, "email verified");
                Ok(Mutation::Write(verified))
            })
            .await;
        self.observe("verify_email", result)
    }

    // ── Purchases ───────────────────────────────────────────────────

    /// Grant a purchased package to the account for `email`, creating the
    /// account if none exists yet.
    pub async fn apply_purchase(
        &self,
        email: &str,
        package: &Package,
        now: DateTime<Utc>,
    ) -> Result<PurchaseOutcome, LedgerError> {
        let result = self.apply_purchase_inner(email, package, now).await;
        self.observe("apply_purchase", result)
    }

    async fn apply_purchase_inner(
        &self,
        email: &str,
        package: &Package,
        now: DateTime<Utc>,
    ) -> Result<PurchaseOutcome, LedgerError> {
        let email = validate_email(email)?;
        let key = AccountRef::Email(email.clone());

        if self.accounts.get(&key).await?.is_none() {
            let account = purchased_account(email.clone(), package, now)?;
            match self.accounts.create(&account).await {
                Ok(()) => {
                    tracing::info!(
                        account = %account.id,
                        package = package.id,
                        "account created by purchase"
                    );
                    return Ok(PurchaseOutcome {
                        balance: account.available(),
                        tier: account.tier,
                        created: true,
                        account_id: account.id,
                        email: account.email,
                        verification_token: account.verification_token,
                    });
                }
                // Lost a creation race: fall through and credit the winner.
                Err(StoreError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let view = match package.credit {
            TokenCredit::Tokens(n) => self.credit_inner(&key, n, true, now).await?,
            TokenCredit::Unlimited => self.upgrade_tier(&key, package.resulting_tier, now).await?,
        };
        let account = self.load(&key).await?;
        let verification_token = if account.email_verified {
            None
        } else {
            account.verification_token
        };
        Ok(PurchaseOutcome {
            account_id: account.id,
            email: account.email,
            created: false,
            tier: view.tier,
            balance: view.balance,
            verification_token,
        })
    }

    // ── Internals ───────────────────────────────────────────────────

    async fn load(&self, key: &AccountRef) -> Result<Account, LedgerError> {
        self.accounts
            .get(key)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(key.redacted()))
    }

    /// Optimistic read-modify-write with bounded, jittered retries.
    async fn mutate<T, F>(
        &self,
        op: &'static str,
        key: &AccountRef,
        now: DateTime<Utc>,
        mut apply: F,
    ) -> Result<T, LedgerError>
    where
        T: Send,
        F: FnMut(&mut Account) -> Result<Mutation<T>, LedgerError> + Send,
    {
        let attempts = self.policy.max_attempts;
        for attempt in 0..attempts {
            let current = self.load(key).await?;
            let expected = current.version;
            let mut next = current;

            let value = match apply(&mut next)? {
                Mutation::Skip(value) => return Ok(value),
                Mutation::Write(value) => value,
            };
            next.version = expected + 1;
            next.updated_at = now;

            match self.accounts.conditional_put(&next, expected).await {
                Ok(()) => return Ok(value),
                Err(StoreError::VersionConflict) => {
                    self.metrics.record_conflict(op);
                    tracing::debug!(op, account = %key, attempt, "version conflict, retrying");
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.policy.delay(attempt)).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::warn!(op, account = %key, attempts, "concurrent update retries exhausted");
        Err(LedgerError::ConcurrentUpdateExceeded { attempts })
    }

    fn observe<T>(
        &self,
        op: &'static str,
        result: Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let label = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        self.metrics.record_operation(op, label);
        result
    }
}

// ── Account construction ────────────────────────────────────────

/// Normalize and sanity-check an email address.
pub fn validate_email(email: &str) -> Result<String, LedgerError> {
    let normalized = normalize_email(email);
    let valid = match normalized.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !domain.contains('@')
                && !normalized.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(normalized)
    } else {
        Err(LedgerError::InvalidEmail(email.trim().to_string()))
    }
}

/// Fresh free-tier account with the tier's allowance and an outstanding
/// verification token.
fn new_account(email: String, now: DateTime<Utc>) -> Account {
    Account {
        id: uuid::Uuid::new_v4().to_string(),
        email,
        api_key: generate_secret(),
        tier: Tier::Free,
        balance: tier_entitlement(Tier::Free).monthly_allowance,
        purchased_balance: 0,
        total_consumed: 0,
        last_refill_at: now,
        email_verified: false,
        verification_token: Some(generate_secret()),
        created_at: now,
        updated_at: now,
        version: 0,
    }
}

/// Account created directly by a purchase: free allowance plus the package.
fn purchased_account(
    email: String,
    package: &Package,
    now: DateTime<Utc>,
) -> Result<Account, LedgerError> {
    let mut account = new_account(email, now);
    account.tier = package.resulting_tier;
    if let TokenCredit::Tokens(n) = package.credit {
        account.balance = account
            .balance
            .checked_add(n)
            .ok_or(LedgerError::Overflow)?;
        account.purchased_balance = n;
    }
    Ok(account)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::entitlement::find_package;
    use crate::store::InMemoryAccountStore;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap()
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(5, std::time::Duration::ZERO, std::time::Duration::ZERO)
    }

    fn service_with(store: Arc<dyn AccountStore>) -> (LedgerService, Arc<LedgerMetrics>) {
        let metrics = Arc::new(LedgerMetrics::new().unwrap());
        (
            LedgerService::new(store, fast_policy(), metrics.clone()),
            metrics,
        )
    }

    fn service() -> LedgerService {
        service_with(Arc::new(InMemoryAccountStore::new())).0
    }

    async fn registered(ledger: &LedgerService, email: &str) -> AccountRef {
        let reg = ledger.register(email, t0()).await.unwrap();
        AccountRef::id(reg.account_id)
    }

    async fn raw(ledger: &LedgerService, key: &AccountRef) -> Account {
        ledger.load(key).await.unwrap()
    }

    #[tokio::test]
    async fn new_account_starts_with_free_allowance() {
        let ledger = service();
        let reg = ledger.register("New@Example.com", t0()).await.unwrap();
        assert_eq!(reg.email, "new@example.com");
        assert_eq!(reg.balance, Balance::Limited(20));
        assert_eq!(reg.tier, Tier::Free);
        assert_eq!(reg.api_key.len(), 64);

        let by_key = ledger
            .get_balance(&AccountRef::api_key(&reg.api_key))
            .await
            .unwrap();
        assert_eq!(by_key.balance, Balance::Limited(20));
    }

    #[tokio::test]
    async fn register_rejects_duplicates_and_bad_emails() {
        let ledger = service();
        ledger.register("a@b.co", t0()).await.unwrap();
        assert!(matches!(
            ledger.register("A@B.co", t0()).await,
            Err(LedgerError::AccountExists(_))
        ));
        for bad in ["", "nobody", "@b.co", "a@b", "a b@c.de"] {
            assert!(matches!(
                ledger.register(bad, t0()).await,
                Err(LedgerError::InvalidEmail(_))
            ));
        }
    }

    #[tokio::test]
    async fn unknown_account_is_not_found() {
        let ledger = service();
        let err = ledger
            .get_balance(&AccountRef::email("ghost@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotFound(_)));
        let err = ledger
            .consume(&AccountRef::id("nope"), 2, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn purchase_and_refill_lifecycle() {
        let ledger = service();
        let key = registered(&ledger, "student@uni.edu").await;

        let out = ledger.consume(&key, 2, t0()).await.unwrap();
        assert_eq!(out.remaining, Balance::Limited(18));

        let view = ledger.credit(&key, 30, true, t0()).await.unwrap();
        assert_eq!(view.balance, Balance::Limited(48));
        assert_eq!(raw(&ledger, &key).await.purchased_balance, 30);

        let day29 = ledger
            .refill_if_due(&key, t0() + Duration::days(29))
            .await
            .unwrap();
        assert!(!day29.refilled);
        assert_eq!(day29.balance, Balance::Limited(48));

        let day30 = ledger
            .refill_if_due(&key, t0() + Duration::days(30))
            .await
            .unwrap();
        assert!(day30.refilled);
        assert_eq!(day30.balance, Balance::Limited(50));

        let again = ledger
            .refill_if_due(&key, t0() + Duration::days(31))
            .await
            .unwrap();
        assert!(!again.refilled);
    }

    #[tokio::test]
    async fn free_allowance_is_spent_before_purchased_tokens() {
        let ledger = service();
        let key = registered(&ledger, "a@b.co").await;
        ledger.credit(&key, 30, true, t0()).await.unwrap();

        // 20 free + 30 purchased; spend 25 -> 5 purchased spent.
        ledger.consume(&key, 25, t0()).await.unwrap();
        let acct = raw(&ledger, &key).await;
        assert_eq!(acct.balance, 25);
        assert_eq!(acct.purchased_balance, 25);
        assert_eq!(acct.total_consumed, 25);
    }

    #[tokio::test]
    async fn insufficient_balance_leaves_record_untouched() {
        let ledger = service();
        let key = registered(&ledger, "a@b.co").await;
        ledger.credit(&key, 3, true, t0()).await.unwrap();
        let before = raw(&ledger, &key).await;

        let err = ledger.consume(&key, 24, t0()).await.unwrap_err();
        match err {
            LedgerError::InsufficientBalance { have, need } => {
                assert_eq!(have, 23);
                assert_eq!(need, 24);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(raw(&ledger, &key).await, before);
    }

    #[tokio::test]
    async fn zero_amounts_are_rejected() {
        let ledger = service();
        let key = registered(&ledger, "a@b.co").await;
        assert!(matches!(
            ledger.consume(&key, 0, t0()).await,
            Err(LedgerError::InvalidAmount(0))
        ));
        assert!(matches!(
            ledger.credit(&key, 0, false, t0()).await,
            Err(LedgerError::InvalidAmount(0))
        ));
    }

    #[tokio::test]
    async fn pro_consume_is_unlimited_and_counted() {
        let ledger = service();
        let key = registered(&ledger, "pro@b.co").await;
        ledger.upgrade_tier(&key, Tier::Pro, t0()).await.unwrap();

        let out = ledger.consume(&key, 1_000_000, t0()).await.unwrap();
        assert_eq!(out.remaining, Balance::Unlimited);
        let acct = raw(&ledger, &key).await;
        assert_eq!(acct.total_consumed, 1_000_000);
        assert_eq!(acct.balance, 20);
    }

    #[tokio::test]
    async fn leaving_pro_restores_frozen_balance() {
        let ledger = service();
        let key = registered(&ledger, "a@b.co").await;
        ledger.credit(&key, 30, true, t0()).await.unwrap();
        ledger.upgrade_tier(&key, Tier::Pro, t0()).await.unwrap();

        let view = ledger.get_balance(&key).await.unwrap();
        assert_eq!(view.balance, Balance::Unlimited);

        let back = ledger.upgrade_tier(&key, Tier::Free, t0()).await.unwrap();
        assert_eq!(back.balance, Balance::Limited(50));
        assert_eq!(raw(&ledger, &key).await.purchased_balance, 30);
    }

    #[tokio::test]
    async fn pro_refill_is_noop() {
        let ledger = service();
        let key = registered(&ledger, "a@b.co").await;
        ledger.upgrade_tier(&key, Tier::Pro, t0()).await.unwrap();
        let out = ledger
            .refill_if_due(&key, t0() + Duration::days(90))
            .await
            .unwrap();
        assert!(!out.refilled);
        assert_eq!(out.balance, Balance::Unlimited);
    }

    #[tokio::test]
    async fn consume_applies_due_refill_first() {
        let ledger = service();
        let key = registered(&ledger, "a@b.co").await;
        ledger.consume(&key, 20, t0()).await.unwrap();

        let out = ledger
            .consume(&key, 2, t0() + Duration::days(30))
            .await
            .unwrap();
        assert_eq!(out.remaining, Balance::Limited(18));
    }

    #[tokio::test]
    async fn verify_email_requires_matching_token() {
        let ledger = service();
        let reg = ledger.register("v@b.co", t0()).await.unwrap();

        assert!(matches!(
            ledger.verify_email("v@b.co", "wrong", t0()).await,
            Err(LedgerError::InvalidVerificationToken)
        ));
        assert!(!ledger.is_email_verified("v@b.co").await.unwrap());

        let verified = ledger
            .verify_email("V@B.CO", &reg.verification_token, t0())
            .await
            .unwrap();
        assert_eq!(verified.api_key, reg.api_key);
        assert_eq!(verified.account_id, reg.account_id);
        assert!(ledger.is_email_verified("v@b.co").await.unwrap());
        let version = raw(&ledger, &AccountRef::email("v@b.co")).await.version;

        // The link keeps working without another write; a wrong token never does.
        let again = ledger
            .verify_email("v@b.co", &reg.verification_token, t0())
            .await
            .unwrap();
        assert_eq!(again.api_key, reg.api_key);
        assert_eq!(raw(&ledger, &AccountRef::email("v@b.co")).await.version, version);
        assert!(matches!(
            ledger.verify_email("v@b.co", "anything", t0()).await,
            Err(LedgerError::InvalidVerificationToken)
        ));
    }

    #[tokio::test]
    async fn purchase_created_account_is_reachable_after_verification() {
        let ledger = service();
        let pack = find_package("tokens_30").unwrap();

        let purchase = ledger.apply_purchase("new@b.co", pack, t0()).await.unwrap();
        assert!(purchase.created);
        let token = purchase.verification_token.expect("unverified buyer gets a token");

        let verified = ledger.verify_email("new@b.co", &token, t0()).await.unwrap();
        assert_eq!(verified.account_id, purchase.account_id);

        let out = ledger
            .consume(&AccountRef::api_key(verified.api_key), 2, t0())
            .await
            .unwrap();
        assert_eq!(out.remaining, Balance::Limited(48));

        // Once verified, later purchases no longer carry a token.
        let repeat = ledger.apply_purchase("new@b.co", pack, t0()).await.unwrap();
        assert!(repeat.verification_token.is_none());
    }

    #[tokio::test]
    async fn purchase_creates_or_credits() {
        let ledger = service();
        let pack = find_package("tokens_30").unwrap();

        let first = ledger.apply_purchase("buyer@b.co", pack, t0()).await.unwrap();
        assert!(first.created);
        assert_eq!(first.balance, Balance::Limited(50));
        let acct = raw(&ledger, &AccountRef::email("buyer@b.co")).await;
        assert_eq!(acct.purchased_balance, 30);
        assert!(!acct.email_verified);

        let second = ledger.apply_purchase("buyer@b.co", pack, t0()).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.balance, Balance::Limited(80));

        let pro = find_package("pro_unlimited").unwrap();
        let upgraded = ledger.apply_purchase("buyer@b.co", pro, t0()).await.unwrap();
        assert_eq!(upgraded.tier, Tier::Pro);
        assert_eq!(upgraded.balance, Balance::Unlimited);
    }

    #[tokio::test]
    async fn pro_purchase_creates_pro_account() {
        let ledger = service();
        let pro = find_package("pro_unlimited").unwrap();
        let out = ledger.apply_purchase("new@b.co", pro, t0()).await.unwrap();
        assert!(out.created);
        assert_eq!(out.tier, Tier::Pro);
        assert_eq!(out.balance, Balance::Unlimited);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_consumes_never_double_spend() {
        let ledger = Arc::new(service());
        let key = registered(&ledger, "race@b.co").await;
        ledger.consume(&key, 18, t0()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let ledger = ledger.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                ledger.consume(&key, 2, t0()).await
            }));
        }

        let mut ok = 0;
        let mut insufficient = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(LedgerError::InsufficientBalance { .. }) => insufficient += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(insufficient, 1);
        assert_eq!(raw(&ledger, &key).await.balance, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_credits_are_all_applied() {
        let ledger = Arc::new(service());
        let key = registered(&ledger, "many@b.co").await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let ledger = ledger.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                ledger.credit(&key, 1, true, t0()).await
            }));
        }
        let mut applied = 0;
        for handle in handles {
            // A loser may exhaust its budget under heavy contention.
            if handle.await.unwrap().is_ok() {
                applied += 1;
            }
        }
        assert_eq!(raw(&ledger, &key).await.balance, 20 + applied);
    }

    /// Store whose conditional writes fail a configurable number of times.
    struct ConflictingStore {
        inner: InMemoryAccountStore,
        conflicts_left: AtomicU32,
    }

    #[async_trait]
    impl AccountStore for ConflictingStore {
        async fn get(&self, key: &AccountRef) -> Result<Option<Account>, StoreError> {
            self.inner.get(key).await
        }

        async fn conditional_put(
            &self,
            account: &Account,
            expected_version: u64,
        ) -> Result<(), StoreError> {
            let left = self.conflicts_left.load(Ordering::SeqCst);
            if left > 0 {
                self.conflicts_left.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::VersionConflict);
            }
            self.inner.conditional_put(account, expected_version).await
        }

        async fn create(&self, account: &Account) -> Result<(), StoreError> {
            self.inner.create(account).await
        }
    }

    #[tokio::test]
    async fn conflicts_are_retried_within_budget() {
        let store = Arc::new(ConflictingStore {
            inner: InMemoryAccountStore::new(),
            conflicts_left: AtomicU32::new(2),
        });
        let (ledger, metrics) = service_with(store);
        let key = registered(&ledger, "a@b.co").await;

        let view = ledger.credit(&key, 5, false, t0()).await.unwrap();
        assert_eq!(view.balance, Balance::Limited(25));
        assert_eq!(metrics.conflict_count("credit"), 2);
        assert_eq!(metrics.operation_count("credit", "ok"), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_is_concurrent_update_exceeded() {
        let store = Arc::new(ConflictingStore {
            inner: InMemoryAccountStore::new(),
            conflicts_left: AtomicU32::new(u32::MAX),
        });
        let (ledger, metrics) = service_with(store);
        let key = registered(&ledger, "a@b.co").await;

        let err = ledger.credit(&key, 5, false, t0()).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::ConcurrentUpdateExceeded { attempts: 5 }
        ));
        assert!(err.is_retryable());
        assert_eq!(
            metrics.operation_count("credit", "concurrent_update_exceeded"),
            1
        );
        assert_eq!(ledger.get_balance(&key).await.unwrap().balance, Balance::Limited(20));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Consume(u64),
        Credit(u64, bool),
        Advance(i64),
        Upgrade(Tier),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u64..40).prop_map(Op::Consume),
            (1u64..40, any::<bool>()).prop_map(|(n, p)| Op::Credit(n, p)),
            (0i64..45).prop_map(Op::Advance),
            prop_oneof![Just(Tier::Free), Just(Tier::Premium), Just(Tier::Pro)]
                .prop_map(Op::Upgrade),
        ]
    }

    proptest! {
        #[test]
        fn balance_invariants_hold_for_any_sequence(ops in prop::collection::vec(op_strategy(), 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            rt.block_on(async {
                let ledger = service();
                let key = registered(&ledger, "prop@b.co").await;
                let mut now = t0();

                for op in ops {
                    let before = raw(&ledger, &key).await;
                    match op {
                        Op::Consume(n) => {
                            if let Err(LedgerError::InsufficientBalance { .. }) =
                                ledger.consume(&key, n, now).await
                            {
                                let after = raw(&ledger, &key).await;
                                // A due refill may still have landed first.
                                if !refill::is_due(before.last_refill_at, now) {
                                    assert_eq!(after.balance, before.balance);
                                    assert_eq!(after.purchased_balance, before.purchased_balance);
                                }
                            }
                        }
                        Op::Credit(n, purchased) => {
                            ledger.credit(&key, n, purchased, now).await.unwrap();
                        }
                        Op::Advance(days) => {
                            now += Duration::days(days);
                            ledger.refill_if_due(&key, now).await.unwrap();
                        }
                        Op::Upgrade(tier) => {
                            ledger.upgrade_tier(&key, tier, now).await.unwrap();
                        }
                    }
                    let acct = raw(&ledger, &key).await;
                    assert!(acct.check_invariants(), "purchased exceeds balance: {acct:?}");
                    assert!(acct.last_refill_at <= now);
                    assert!(acct.total_consumed >= before.total_consumed);
                }
            });
        }
    }
}
