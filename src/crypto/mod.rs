//! Payload codec: JSON request <-> Fernet envelope.
//!
//! Fernet (AES-128-CBC with an HMAC-SHA256 tag) keeps envelopes compatible
//! with the `cryptography` package used by older clients. Any tampering or a
//! wrong key fails the HMAC check before decryption, so a failed `decrypt`
//! never yields partial plaintext.

use base64::engine::general_purpose::{ URL_SAFE, URL_SAFE_NO_PAD };
use base64::Engine;
use fernet::Fernet;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{ Digest, Sha256 };

use crate::error::RelayError;

const KEY_LEN: usize = 32;
/// version (1) + timestamp (8) + IV (16) + one cipher block (16) + HMAC (32)
const MIN_TOKEN_LEN: usize = 73;

pub struct PayloadCodec {
    fernet: Fernet,
    fingerprint: String,
}

impl std::fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCodec").field("fingerprint", &self.fingerprint).finish()
    }
}

impl PayloadCodec {
    /// Builds a codec from the shared key. A missing or malformed key is a
    /// `Security` error; binaries treat it as fatal at startup.
    pub fn from_key(key: Option<&str>) -> Result<Self, RelayError> {
        let key = key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| RelayError::security("ENCRYPTION_KEY not set."))?;

        let raw = URL_SAFE.decode(key)
            .or_else(|_| URL_SAFE_NO_PAD.decode(key))
            .map_err(|_| RelayError::security("ENCRYPTION_KEY is not valid url-safe base64."))?;
        if raw.len() != KEY_LEN {
            return Err(
                RelayError::security(
                    format!("ENCRYPTION_KEY must decode to {} bytes, got {}.", KEY_LEN, raw.len())
                )
            );
        }

        let canonical = URL_SAFE.encode(&raw);
        let fernet = Fernet::new(&canonical).ok_or_else(||
            RelayError::security("ENCRYPTION_KEY rejected by cipher.")
        )?;

        let digest = Sha256::digest(&raw);
        let fingerprint = hex::encode(&digest[..6]);

        Ok(Self { fernet, fingerprint })
    }

    pub fn generate_key() -> String {
        Fernet::generate_key()
    }

    /// Short SHA-256 fingerprint of the key, safe to log.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn encrypt<T: Serialize>(&self, request: &T) -> Result<String, RelayError> {
        let bytes = serde_json
            ::to_vec(request)
            .map_err(|e| RelayError::validation(format!("Request is not serializable: {}", e)))?;
        Ok(self.encrypt_bytes(&bytes))
    }

    pub fn encrypt_bytes(&self, bytes: &[u8]) -> String {
        self.fernet.encrypt(bytes)
    }

    pub fn decrypt(&self, envelope: &str) -> Result<JsonValue, RelayError> {
        let envelope = envelope.trim();
        let well_formed = URL_SAFE.decode(envelope)
            .map(|raw| raw.len() >= MIN_TOKEN_LEN)
            .unwrap_or(false);
        if !well_formed {
            return Err(RelayError::security("Decryption failed or invalid key."));
        }

        let plaintext = self.fernet
            .decrypt(envelope)
            .map_err(|_| RelayError::security("Decryption failed or invalid key."))?;

        serde_json
            ::from_slice(&plaintext)
            .map_err(|_| RelayError::security("Decrypted payload is not valid JSON."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ ChatMessage, InferenceRequest, SamplingParams };

    fn codec() -> PayloadCodec {
        PayloadCodec::from_key(Some(&PayloadCodec::generate_key())).unwrap()
    }

    fn sample_request() -> InferenceRequest {
        InferenceRequest::chat(
            vec![ChatMessage::system("You are terse."), ChatMessage::user("Explain TLS.")],
            SamplingParams {
                temperature: Some(0.2),
                max_tokens: Some(64),
                stop: Some(vec!["</s>".into()]),
                ..Default::default()
            }
        )
    }

    #[test]
    fn test_round_trip() {
        let codec = codec();
        let request = sample_request();
        let envelope = codec.encrypt(&request).unwrap();
        let value = codec.decrypt(&envelope).unwrap();
        assert_eq!(InferenceRequest::from_value(value).unwrap(), request);
    }

    #[test]
    fn test_round_trip_for_every_request_shape() {
        let codec = codec();
        let requests = vec![
            InferenceRequest::legacy_prompt("Summarize this.", SamplingParams::default()),
            InferenceRequest::chat(
                vec![ChatMessage::user("Grüße aus Zürich, 東京から 👋")],
                SamplingParams { stop: Some(Vec::new()), top_p: Some(0.9), ..Default::default() }
            ),
            InferenceRequest::chat(
                vec![
                    ChatMessage::system("sys"),
                    ChatMessage::user("a"),
                    ChatMessage::assistant("b"),
                    ChatMessage::user("c")
                ],
                SamplingParams {
                    temperature: Some(0.0),
                    max_tokens: Some(1),
                    presence_penalty: Some(-1.5),
                    frequency_penalty: Some(2.0),
                    stop: Some(vec!["\n\n".into(), "###".into()]),
                    ..Default::default()
                }
            ),
            sample_request()
        ];

        for request in requests {
            let value = codec.decrypt(&codec.encrypt(&request).unwrap()).unwrap();
            assert_eq!(InferenceRequest::from_value(value).unwrap(), request);
        }
    }

    #[test]
    fn test_json_value_round_trip() {
        let codec = codec();
        let value = serde_json::json!({"prompt": "hi", "sampling_params": {"temperature": 0.2}});
        assert_eq!(codec.decrypt(&codec.encrypt(&value).unwrap()).unwrap(), value);
    }

    #[test]
    fn test_envelope_hides_plaintext() {
        let codec = codec();
        let envelope = codec.encrypt(&sample_request()).unwrap();
        assert!(!envelope.contains("Explain"));
    }

    #[test]
    fn test_flipping_any_byte_fails() {
        let codec = codec();
        let envelope = codec.encrypt(&InferenceRequest::legacy_prompt("hi", SamplingParams::default())).unwrap();
        let raw = URL_SAFE.decode(&envelope).unwrap();

        for i in 0..raw.len() {
            let mut tampered = raw.clone();
            tampered[i] ^= 0x01;
            let result = codec.decrypt(&URL_SAFE.encode(&tampered));
            assert!(
                matches!(result, Err(RelayError::Security(_))),
                "tampering byte {} was not detected",
                i
            );
        }
    }

    #[test]
    fn test_truncated_envelope_fails() {
        let codec = codec();
        let envelope = codec.encrypt(&sample_request()).unwrap();
        let truncated = &envelope[..envelope.len() / 2];
        assert!(matches!(codec.decrypt(truncated), Err(RelayError::Security(_))));
        assert!(matches!(codec.decrypt(""), Err(RelayError::Security(_))));
    }

    #[test]
    fn test_wrong_key_fails() {
        let envelope = codec().encrypt(&sample_request()).unwrap();
        assert!(matches!(codec().decrypt(&envelope), Err(RelayError::Security(_))));
    }

    #[test]
    fn test_non_json_plaintext_is_security_error() {
        let codec = codec();
        let envelope = codec.encrypt_bytes(b"not json at all");
        match codec.decrypt(&envelope) {
            Err(RelayError::Security(msg)) => assert!(!msg.contains("not json")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_missing_or_malformed_key() {
        assert!(matches!(PayloadCodec::from_key(None), Err(RelayError::Security(_))));
        assert!(matches!(PayloadCodec::from_key(Some("  ")), Err(RelayError::Security(_))));
        assert!(matches!(PayloadCodec::from_key(Some("not a key!")), Err(RelayError::Security(_))));
        let short = URL_SAFE.encode([7u8; 16]);
        assert!(matches!(PayloadCodec::from_key(Some(&short)), Err(RelayError::Security(_))));
    }

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        let key = PayloadCodec::generate_key();
        let a = PayloadCodec::from_key(Some(&key)).unwrap();
        let b = PayloadCodec::from_key(Some(&key)).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 12);
    }
}
