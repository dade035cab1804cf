//! Entitlement table: what each tier grants per period, and what each
//! purchasable package credits.
//!
//! Pure lookups with no side effects. Unknown identifiers fail with
//! [`LedgerError::UnknownEntitlement`]; callers surface that instead of
//! falling back to a default.

use serde::Serialize;
use std::collections::HashMap;

use super::account::Tier;
use super::error::LedgerError;

// ── Tier entitlements ────────────────────────────────────────────

/// Monthly allowance and unlimited flag for a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierEntitlement {
    pub monthly_allowance: u64,
    pub unlimited: bool,
}

/// Entitlement for a tier.
pub fn tier_entitlement(tier: Tier) -> TierEntitlement {
    match tier {
        Tier::Free => TierEntitlement {
            monthly_allowance: 20,
            unlimited: false,
        },
        Tier::Premium => TierEntitlement {
            monthly_allowance: 100,
            unlimited: false,
        },
        Tier::Pro => TierEntitlement {
            monthly_allowance: 0,
            unlimited: true,
        },
    }
}

/// Entitlement for a tier given by name.
pub fn tier_entitlement_by_name(name: &str) -> Result<TierEntitlement, LedgerError> {
    Ok(tier_entitlement(name.parse()?))
}

// ── Purchase packages ────────────────────────────────────────────

/// What a package adds to an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenCredit {
    Tokens(u64),
    Unlimited,
}

/// A one-time purchasable package.
#[derive(Debug, Clone, Serialize)]
pub struct Package {
    /// Package identifier.
    pub id: &'static str,
    /// Display name.
    pub name: &'static str,
    /// Price in US cents.
    pub price_cents: u64,
    pub credit: TokenCredit,
    /// Tier the account ends up on after purchase.
    pub resulting_tier: Tier,
}

/// Available packages.
pub const PACKAGES: &[Package] = &[
    Package {
        id: "tokens_30",
        name: "30 Tokens",
        price_cents: 99,
        credit: TokenCredit::Tokens(30),
        resulting_tier: Tier::Free,
    },
    Package {
        id: "tokens_90",
        name: "90 Tokens",
        price_cents: 199,
        credit: TokenCredit::Tokens(90),
        resulting_tier: Tier::Free,
    },
    Package {
        id: "pro_unlimited",
        name: "Pro",
        price_cents: 799,
        credit: TokenCredit::Unlimited,
        resulting_tier: Tier::Pro,
    },
];

/// Look up a package by ID.
pub fn find_package(package_id: &str) -> Result<&'static Package, LedgerError> {
    PACKAGES
        .iter()
        .find(|p| p.id == package_id)
        .ok_or_else(|| LedgerError::UnknownEntitlement(format!("package '{package_id}'")))
}

/// Look up a package by price in cents.
pub fn find_package_by_price(price_cents: u64) -> Result<&'static Package, LedgerError> {
    PACKAGES
        .iter()
        .find(|p| p.price_cents == price_cents)
        .ok_or_else(|| {
            LedgerError::UnknownEntitlement(format!("no package priced at {price_cents} cents"))
        })
}

/// Look up a package through a provider price-id mapping.
pub fn find_package_by_price_id(
    price_map: &HashMap<String, String>,
    price_id: &str,
) -> Result<&'static Package, LedgerError> {
    let package_id = price_map
        .get(price_id)
        .ok_or_else(|| LedgerError::UnknownEntitlement(format!("price '{price_id}'")))?;
    find_package(package_id)
}
