//! Stateless proof-of-work challenges gating self-service signup.
//!
//! A challenge is a signed, self-describing token; the server keeps no
//! per-challenge state. Validity is reconstructed entirely from the token
//! plus the signing secret, and replay is bounded by the embedded expiry.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const CHALLENGE_VERSION: u64 = 1;
pub const MIN_DIFFICULTY: u32 = 1;
pub const MAX_DIFFICULTY: u32 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("malformed challenge token")]
    BadToken,
    #[error("challenge signature mismatch")]
    BadSignature,
    #[error("challenge payload undecodable")]
    BadPayload,
    #[error("unsupported challenge version")]
    BadVersion,
    #[error("challenge expired")]
    Expired,
    #[error("nonce does not satisfy the challenge difficulty")]
    BadSolution,
    #[error("challenge signing key rejected")]
    Key,
    #[error("challenge randomness unavailable")]
    Randomness,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ChallengePayload {
    v: u64,
    id: String,
    exp: i64,
    difficulty: u32,
}

/// A freshly issued challenge, ready to hand to a client.
#[derive(Clone, Debug, Serialize)]
pub struct Challenge {
    pub token: String,
    pub id: String,
    pub expires_at_ms: i64,
    pub difficulty: u32,
}

/// The payload of a token that passed verification. `difficulty` is already
/// clamped server-side, whatever the token claimed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedChallenge {
    pub id: String,
    pub expires_at_ms: i64,
    pub difficulty: u32,
}

#[derive(Clone)]
pub struct ChallengeIssuer {
    secret: Vec<u8>,
}

impl std::fmt::Debug for ChallengeIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeIssuer")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl ChallengeIssuer {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Issue a signed challenge expiring `ttl_ms` from `now_ms`.
    pub fn issue(
        &self,
        difficulty: u32,
        ttl_ms: i64,
        now_ms: i64,
    ) -> Result<Challenge, ChallengeError> {
        let mut id_bytes = [0u8; 16];
        getrandom::fill(&mut id_bytes).map_err(|_| ChallengeError::Randomness)?;
        let id = URL_SAFE_NO_PAD.encode(id_bytes);

        let payload = ChallengePayload {
            v: CHALLENGE_VERSION,
            id: id.clone(),
            exp: now_ms.saturating_add(ttl_ms),
            difficulty: clamp_difficulty(difficulty),
        };
        let body =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).map_err(|_| ChallengeError::BadPayload)?);
        let sig = self.sign(body.as_bytes())?;

        Ok(Challenge {
            token: format!("{body}.{}", URL_SAFE_NO_PAD.encode(sig)),
            id,
            expires_at_ms: payload.exp,
            difficulty: payload.difficulty,
        })
    }

    /// Verify a presented token: structure, signature (constant time),
    /// payload shape, version, then expiry, in that order.
    pub fn verify(&self, token: &str, now_ms: i64) -> Result<VerifiedChallenge, ChallengeError> {
        let mut parts = token.split('.');
        let (Some(body), Some(sig), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ChallengeError::BadToken);
        };
        if body.is_empty() || sig.is_empty() {
            return Err(ChallengeError::BadToken);
        }

        let sig_bytes = URL_SAFE_NO_PAD
            .decode(sig)
            .map_err(|_| ChallengeError::BadSignature)?;
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| ChallengeError::Key)?;
        mac.update(body.as_bytes());
        mac.verify_slice(&sig_bytes)
            .map_err(|_| ChallengeError::BadSignature)?;

        let raw = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| ChallengeError::BadPayload)?;
        let payload: ChallengePayload =
            serde_json::from_slice(&raw).map_err(|_| ChallengeError::BadPayload)?;

        if payload.v != CHALLENGE_VERSION {
            return Err(ChallengeError::BadVersion);
        }
        if payload.id.is_empty() || payload.exp <= 0 {
            return Err(ChallengeError::BadPayload);
        }
        if now_ms > payload.exp {
            return Err(ChallengeError::Expired);
        }

        Ok(VerifiedChallenge {
            id: payload.id,
            expires_at_ms: payload.exp,
            difficulty: clamp_difficulty(payload.difficulty),
        })
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, ChallengeError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| ChallengeError::Key)?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// A nonce solves a challenge iff sha256("{id}.{nonce}") starts with
/// `difficulty` zero hex digits.
pub fn check_solution(id: &str, nonce: &str, difficulty: u32) -> bool {
    let digest = Sha256::digest(format!("{id}.{nonce}").as_bytes());
    leading_zero_hex_digits(&digest) >= clamp_difficulty(difficulty)
}

fn clamp_difficulty(difficulty: u32) -> u32 {
    difficulty.clamp(MIN_DIFFICULTY, MAX_DIFFICULTY)
}

fn leading_zero_hex_digits(digest: &[u8]) -> u32 {
    let mut count = 0;
    for byte in digest {
        if byte >> 4 != 0 {
            return count;
        }
        count += 1;
        if byte & 0x0f != 0 {
            return count;
        }
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> ChallengeIssuer {
        ChallengeIssuer::new(b"test-secret".to_vec())
    }

    #[test]
    fn issue_then_verify_round_trip() {
        let challenge = issuer().issue(4, 120_000, 1_000).expect("issue");
        let verified = issuer().verify(&challenge.token, 2_000).expect("verify");
        assert_eq!(verified.id, challenge.id);
        assert_eq!(verified.difficulty, 4);
        assert_eq!(verified.expires_at_ms, 121_000);
    }

    #[test]
    fn expired_token_is_rejected() {
        let challenge = issuer().issue(4, 1_000, 1_000).expect("issue");
        assert_eq!(
            issuer().verify(&challenge.token, 2_001),
            Err(ChallengeError::Expired)
        );
        // Boundary: now == exp is still valid.
        assert!(issuer().verify(&challenge.token, 2_000).is_ok());
    }

    #[test]
    fn foreign_secret_is_rejected() {
        let challenge = issuer().issue(4, 120_000, 0).expect("issue");
        let other = ChallengeIssuer::new(b"other-secret".to_vec());
        assert_eq!(
            other.verify(&challenge.token, 0),
            Err(ChallengeError::BadSignature)
        );
    }

    #[test]
    fn any_payload_mutation_is_rejected() {
        let challenge = issuer().issue(4, 120_000, 0).expect("issue");
        let (body, sig) = challenge.token.split_once('.').expect("two parts");
        let mut raw = URL_SAFE_NO_PAD.decode(body).expect("decode");
        for i in 0..raw.len() {
            raw[i] ^= 0x01;
            let forged = format!("{}.{sig}", URL_SAFE_NO_PAD.encode(&raw));
            assert_eq!(
                issuer().verify(&forged, 0),
                Err(ChallengeError::BadSignature),
                "flipped byte {i} must invalidate the signature"
            );
            raw[i] ^= 0x01;
        }
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert_eq!(issuer().verify("", 0), Err(ChallengeError::BadToken));
        assert_eq!(
            issuer().verify("one-part-only", 0),
            Err(ChallengeError::BadToken)
        );
        assert_eq!(issuer().verify("a.b.c", 0), Err(ChallengeError::BadToken));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let body = URL_SAFE_NO_PAD
            .encode(br#"{"v":2,"id":"x","exp":9999999999999,"difficulty":4}"#);
        let issuer = issuer();
        let sig = issuer.sign(body.as_bytes()).expect("sign");
        let token = format!("{body}.{}", URL_SAFE_NO_PAD.encode(sig));
        assert_eq!(issuer.verify(&token, 0), Err(ChallengeError::BadVersion));
    }

    #[test]
    fn difficulty_is_clamped_on_verify() {
        let body = URL_SAFE_NO_PAD
            .encode(br#"{"v":1,"id":"x","exp":9999999999999,"difficulty":64}"#);
        let issuer = issuer();
        let sig = issuer.sign(body.as_bytes()).expect("sign");
        let token = format!("{body}.{}", URL_SAFE_NO_PAD.encode(sig));
        let verified = issuer.verify(&token, 0).expect("verify");
        assert_eq!(verified.difficulty, MAX_DIFFICULTY);
    }

    #[test]
    fn check_solution_counts_leading_zero_hex_digits() {
        // sha256("abc.48") starts with 0006.
        let mut solved = None;
        for nonce in 0..100_000u32 {
            let nonce = nonce.to_string();
            if check_solution("abc", &nonce, 2) {
                solved = Some(nonce);
                break;
            }
        }
        let nonce = solved.expect("a difficulty-2 nonce exists below 100k");
        assert!(check_solution("abc", &nonce, 1));
        assert!(!check_solution("abc", "not-the-nonce", 6));
    }
}
