//! RFC 6238 TOTP: HMAC-SHA1, 30-second step, 6 digits (§4.5). Secret input
//! is Base32 (RFC 4648) with whitespace and `=` padding tolerated and case
//! normalized; anything else in the alphabet fails closed as `Validation`.

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{VaultError, VaultResult};

type HmacSha1 = Hmac<Sha1>;

const STEP_SECS: u64 = 30;
const DIGITS: u32 = 6;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TotpToken {
    pub code: String,
    pub seconds_remaining: u64,
}

/// Strip whitespace, drop `=` padding, uppercase, then reject anything
/// outside `[A-Z2-7]` before handing the rest to the Base32 decoder.
fn normalize_base32(secret: &str) -> VaultResult<Vec<u8>> {
    let cleaned: String = secret.chars().filter(|c| !c.is_whitespace()).collect();
    let trimmed = cleaned.trim_end_matches('=');
    if trimmed.is_empty() {
        return Err(VaultError::validation("secret", "must not be empty"));
    }
    let upper = trimmed.to_uppercase();
    if !upper.bytes().all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b)) {
        return Err(VaultError::validation("secret", "not valid Base32"));
    }
    data_encoding::BASE32_NOPAD
        .decode(upper.as_bytes())
        .map_err(|_| VaultError::validation("secret", "not valid Base32"))
}

fn hotp(key: &[u8], counter: u64, digits: u32) -> String {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);
    let code = binary % 10u32.pow(digits);
    format!("{code:0width$}", width = digits as usize)
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Generate the TOTP code for `secret` at a specific unix time — the entry
/// point the session layer uses so tests can pin the clock.
pub fn generate_at(secret: &str, unix_secs: u64) -> VaultResult<TotpToken> {
    let key = normalize_base32(secret)?;
    let counter = unix_secs / STEP_SECS;
    let code = hotp(&key, counter, DIGITS);
    let seconds_remaining = STEP_SECS - (unix_secs % STEP_SECS);
    Ok(TotpToken { code, seconds_remaining })
}

/// Generate the current TOTP code for `secret` using the system clock.
pub fn generate(secret: &str) -> VaultResult<TotpToken> {
    generate_at(secret, unix_seconds())
}
