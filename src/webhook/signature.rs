//! Payment provider webhook signatures.
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac>[,v1=<hex hmac>...]`. The
//! HMAC-SHA256 is computed with the shared secret over `"<t>." + raw body`.
//! Several `v1` entries may be present while the provider rotates secrets;
//! any one matching is enough.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Why a signature header was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("no signing secret configured")]
    NotConfigured,

    #[error("missing signature header")]
    Missing,

    #[error("malformed signature header: {0}")]
    Malformed(String),

    #[error("timestamp outside tolerance ({age_secs}s old)")]
    Expired { age_secs: i64 },

    #[error("no signature matched")]
    Mismatch,
}

/// Parsed `t=`/`v1=` fields.
#[derive(Debug)]
struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

fn parse_header(header: &str) -> Result<SignatureHeader, SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            return Err(SignatureError::Malformed(format!("segment '{part}'")));
        };
        match key {
            "t" => {
                let ts = value
                    .parse::<i64>()
                    .map_err(|_| SignatureError::Malformed("timestamp".into()))?;
                timestamp = Some(ts);
            }
            // Non-hex entries are skipped rather than failing the header.
            "v1" => {
                if let Ok(sig) = hex::decode(value) {
                    signatures.push(sig);
                }
            }
            // Other schemes (e.g. v0) are ignored.
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| SignatureError::Malformed("no timestamp".into()))?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed("no v1 signature".into()));
    }
    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

fn mac_for(secret: &str, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::Malformed("signing secret".into()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// Verify `header` against `payload`. `now` and the header timestamp are unix
/// seconds; the difference either way must be within `tolerance_secs`.
pub fn verify(
    secret: &str,
    payload: &[u8],
    header: Option<&str>,
    now: i64,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::NotConfigured);
    }
    let header = header
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or(SignatureError::Missing)?;
    let parsed = parse_header(header)?;

    // The timestamp is attacker-controlled: compare without overflowing.
    let tolerance = u64::try_from(tolerance_secs).unwrap_or(0);
    if now.abs_diff(parsed.timestamp) > tolerance {
        return Err(SignatureError::Expired {
            age_secs: now.saturating_sub(parsed.timestamp),
        });
    }

    let mac = mac_for(secret, parsed.timestamp, payload)?;
    let matched = parsed
        .signatures
        .iter()
        .any(|sig| mac.clone().verify_slice(sig).is_ok());
    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Build a header value the way the provider does. Used by tests and the
/// `sign` CLI helper for local replays.
pub fn sign(secret: &str, payload: &[u8], timestamp: i64) -> Result<String, SignatureError> {
    let digest = mac_for(secret, timestamp, payload)?.finalize().into_bytes();
    Ok(format!("t={timestamp},v1={}", hex::encode(digest)))
}
