//! Signed, self-describing credit-bearer token (spec §4.A).
//!
//! A voucher is a canonical JSON payload plus an HMAC-SHA256 tag over that
//! payload, base64url-encoded without padding as `payload.tag`. Vouchers are
//! not themselves time-limited; each enclosed line carries its own expiry.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum VoucherError {
    #[error("voucher is malformed")]
    Malformed,
    #[error("voucher signature is invalid")]
    BadSignature,
}

/// One (amount, expiry) line carried by a voucher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoucherLine {
    pub amount: i64,
    pub expiry: i64,
}

impl VoucherLine {
    pub fn expiry_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.expiry, 0).single().unwrap_or(Utc::now())
    }
}

/// Canonical voucher payload. Field order here is the wire order; new fields
/// must only ever be appended, never inserted, to keep old vouchers
/// verifiable (spec §9 "Voucher forward-compatibility").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoucherPayload {
    pub giver_id: String,
    pub giver_name: String,
    pub giver_phone: Option<String>,
    pub giver_github: Option<String>,
    pub giver_starred_projects: String,
    pub receiver_id: String,
    pub lines: Vec<VoucherLine>,
    pub issued_at: i64,
}

/// Encodes a payload as `base64url(json).hex(hmac)`.
pub fn encode(payload: &VoucherPayload, signing_key: &[u8]) -> Result<String, VoucherError> {
    let json = serde_json::to_vec(payload).map_err(|_| VoucherError::Malformed)?;
    let tag = sign(&json, signing_key);
    let body = URL_SAFE_NO_PAD.encode(&json);
    Ok(format!("{body}.{tag}"))
}

/// Decodes and verifies a voucher code, failing with [`VoucherError`] on any
/// structural or signature error.
pub fn decode(code: &str, signing_key: &[u8]) -> Result<VoucherPayload, VoucherError> {
    let (body, tag_hex) = code.rsplit_once('.').ok_or(VoucherError::Malformed)?;
    let json = URL_SAFE_NO_PAD
        .decode(body)
        .map_err(|_| VoucherError::Malformed)?;
    let expected = sign(&json, signing_key);
    if !bool::from(
        expected
            .as_bytes()
            .ct_eq(tag_hex.as_bytes()),
    ) {
        return Err(VoucherError::BadSignature);
    }
    serde_json::from_slice(&json).map_err(|_| VoucherError::Malformed)
}

fn sign(payload: &[u8], signing_key: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(signing_key).expect("HMAC accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VoucherPayload {
        VoucherPayload {
            giver_id: "u1".into(),
            giver_name: "Ada".into(),
            giver_phone: Some("555-0100".into()),
            giver_github: Some("ada".into()),
            giver_starred_projects: "anthropics/claude-code".into(),
            receiver_id: "u2".into(),
            lines: vec![VoucherLine {
                amount: 20,
                expiry: 1_900_000_000,
            }],
            issued_at: 1_800_000_000,
        }
    }

    #[test]
    fn roundtrip_preserves_payload() {
        let key = b"0123456789abcdef0123456789abcdef";
        let payload = sample();
        let code = encode(&payload, key).expect("encode");
        let decoded = decode(&code, key).expect("decode");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn single_byte_mutation_fails_verification() {
        let key = b"0123456789abcdef0123456789abcdef";
        let code = encode(&sample(), key).expect("encode");
        let mut mutated = code.into_bytes();
        let last = mutated.len() - 1;
        mutated[last] ^= 0x01;
        let mutated = String::from_utf8(mutated).expect("still utf8");
        assert!(matches!(
            decode(&mutated, key),
            Err(VoucherError::BadSignature) | Err(VoucherError::Malformed)
        ));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let payload = sample();
        let code = encode(&payload, b"key-a-key-a-key-a-key-a-key-a-key").expect("encode");
        let result = decode(&code, b"key-b-key-b-key-b-key-b-key-b-key");
        assert!(matches!(result, Err(VoucherError::BadSignature)));
    }
}
