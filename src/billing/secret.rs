//! API keys, verification tokens, and comparing them.

/// Secret byte length before hex encoding (32 bytes = 64 hex chars).
const SECRET_BYTES: usize = 32;

/// Fresh random hex secret.
pub fn generate_secret() -> String {
    let bytes: [u8; SECRET_BYTES] = rand::random();
    hex::encode(bytes)
}

/// Compare two byte strings without early exit on the first mismatch.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
