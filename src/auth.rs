//! Stream token issuance and verification.
//!
//! Tokens are self-contained: an encoded claims payload plus an HMAC-SHA256
//! signature over it. Correctness depends only on the signature and the
//! embedded expiry, never on a server-side lookup, so any stateless instance
//! behind a load balancer can verify a token issued by any other instance.
//! There is no revocation list, only expiry.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::TokenError;

type HmacSha256 = Hmac<Sha256>;

/// Claims carried inside a stream token. No raw identity data, only a hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub identity_fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct StreamAuth {
    secret: Vec<u8>,
    ttl: Duration,
}

pub fn identity_fingerprint(identity_material: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity_material.as_bytes());
    hex::encode(hasher.finalize())
}

impl StreamAuth {
    pub fn new(secret: &str, ttl_secs: u64) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    fn mac(&self) -> HmacSha256 {
        // new_from_slice only fails on zero-length keys in pathological HMAC
        // configurations; the config layer guarantees a non-empty secret.
        HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length")
    }

    /// Issue a token bound to the sha256 fingerprint of the caller's
    /// identity material. The token is never persisted server-side.
    pub fn issue(&self, identity_material: &str, now: DateTime<Utc>) -> IssuedToken {
        let claims = TokenClaims {
            issued_at: now,
            expires_at: now + self.ttl,
            identity_fingerprint: identity_fingerprint(identity_material),
        };
        let payload = serde_json::to_vec(&claims).expect("claims serialize");
        let encoded = URL_SAFE_NO_PAD.encode(payload);

        let mut mac = self.mac();
        mac.update(encoded.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        IssuedToken {
            token: format!("{encoded}.{signature}"),
            expires_at: claims.expires_at,
        }
    }

    /// Verify a token. Fails closed: bad format, bad signature, expiry, and
    /// malformed claims are all rejections, never "trust by default".
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<TokenClaims, TokenError> {
        let mut segments = token.split('.');
        let (Some(encoded), Some(signature), None) =
            (segments.next(), segments.next(), segments.next())
        else {
            return Err(TokenError::BadFormat);
        };
        if encoded.is_empty() || signature.is_empty() {
            return Err(TokenError::BadFormat);
        }

        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::BadFormat)?;

        // Constant-time comparison; a timing side channel would let a caller
        // forge signatures byte by byte.
        let mut mac = self.mac();
        mac.update(encoded.as_bytes());
        mac.verify_slice(&signature_bytes)
            .map_err(|_| TokenError::BadSignature)?;

        let payload = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| TokenError::BadFormat)?;
        let claims: TokenClaims =
            serde_json::from_slice(&payload).map_err(|_| TokenError::BadClaims)?;

        if claims.identity_fingerprint.is_empty() || claims.expires_at < claims.issued_at {
            return Err(TokenError::BadClaims);
        }
        if now > claims.expires_at {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }
}
