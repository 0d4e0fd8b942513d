//! AES-256-ECB + PKCS7 decoding for the HR feed payloads (spec §4.G), which
//! arrive base64-encoded, optionally XML-wrapped, and always ECB-encrypted
//! with a shared key.

use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine};
use cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyInit};
use thiserror::Error;

type Aes256EcbDec = ecb::Decryptor<Aes256>;

#[derive(Debug, Error)]
pub enum FeedDecodeError {
    #[error("payload is not valid base64")]
    BadBase64,
    #[error("key must be exactly 32 bytes for AES-256")]
    BadKeyLength,
    #[error("ciphertext could not be decrypted or unpadded")]
    BadCiphertext,
    #[error("decrypted payload was not valid UTF-8")]
    BadUtf8,
}

/// Strips a single XML wrapper (`<tag>...</tag>`, possibly with a CDATA
/// section) around a base64 payload, if present.
pub fn strip_xml_wrapper(raw: &str) -> &str {
    let trimmed = raw.trim();
    if !trimmed.starts_with('<') {
        return trimmed;
    }
    let Some(after_open) = trimmed.find('>') else {
        return trimmed;
    };
    let Some(before_close) = trimmed.rfind('<') else {
        return trimmed;
    };
    if before_close <= after_open {
        return trimmed;
    }
    let inner = trimmed[after_open + 1..before_close].trim();
    inner
        .strip_prefix("<![CDATA[")
        .and_then(|s| s.strip_suffix("]]>"))
        .unwrap_or(inner)
        .trim()
}

/// Decodes a base64 (optionally XML-wrapped), AES-256-ECB-encrypted,
/// PKCS7-padded HR feed payload into its plaintext JSON bytes.
pub fn decrypt_feed(raw: &str, key: &[u8]) -> Result<Vec<u8>, FeedDecodeError> {
    if key.len() != 32 {
        return Err(FeedDecodeError::BadKeyLength);
    }
    let unwrapped = strip_xml_wrapper(raw);
    let mut ciphertext = STANDARD
        .decode(unwrapped)
        .map_err(|_| FeedDecodeError::BadBase64)?;

    let decryptor =
        Aes256EcbDec::new_from_slice(key).map_err(|_| FeedDecodeError::BadKeyLength)?;
    let plaintext = decryptor
        .decrypt_padded_mut::<Pkcs7>(&mut ciphertext)
        .map_err(|_| FeedDecodeError::BadCiphertext)?;
    Ok(plaintext.to_vec())
}

/// Decrypts and parses an HR feed payload as JSON.
pub fn decrypt_feed_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    key: &[u8],
) -> Result<T, FeedDecodeError> {
    let plaintext = decrypt_feed(raw, key)?;
    serde_json::from_slice(&plaintext).map_err(|_| FeedDecodeError::BadUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::Aes256;
    use cipher::{BlockEncryptMut, KeyInit as _};

    fn encrypt(plaintext: &[u8], key: &[u8; 32]) -> String {
        let encryptor = ecb::Encryptor::<Aes256>::new_from_slice(key).unwrap();
        let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        STANDARD.encode(ciphertext)
    }

    #[test]
    fn decrypts_plain_base64_payload() {
        let key = [7u8; 32];
        let encoded = encrypt(br#"{"ok":true}"#, &key);
        let decoded = decrypt_feed(&encoded, &key).unwrap();
        assert_eq!(decoded, br#"{"ok":true}"#);
    }

    #[test]
    fn strips_xml_wrapper_and_cdata() {
        let key = [9u8; 32];
        let encoded = encrypt(br#"{"employees":[]}"#, &key);
        let wrapped = format!("<payload><![CDATA[{encoded}]]></payload>");
        let decoded = decrypt_feed(&wrapped, &key).unwrap();
        assert_eq!(decoded, br#"{"employees":[]}"#);
    }

    #[test]
    fn rejects_wrong_key_length() {
        let err = decrypt_feed("irrelevant", &[0u8; 16]).unwrap_err();
        assert!(matches!(err, FeedDecodeError::BadKeyLength));
    }
}
