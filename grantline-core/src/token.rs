//! License token signing and verification.
//!
//! Tokens use the format `base64(payload).base64(signature)`, standard
//! alphabet with padding. The payload is the token serialized as JSON with
//! ordered maps. The signature is RSA-PSS over the SHA-256 digest of the
//! base64 payload text (not the decoded JSON).
//!
//! Verification never looks at the validity window; callers check
//! [`LicenseToken::is_valid_at`] separately.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use rsa::{Pss, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{LicensingError, LicensingResult};
use crate::keys;

/// A signed, time-bounded bundle of grantable capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseToken {
    pub id: String,
    pub licensee: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// `"<entitlement>/<unit>"` → amount
    #[serde(default)]
    pub grants: BTreeMap<String, u64>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl LicenseToken {
    /// `now ∈ [not_before, not_after)`
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now < self.not_after
    }

    /// Amount granted for `entitlement/unit`, if any.
    #[must_use]
    pub fn amount_for(&self, entitlement: &str, unit: &str) -> Option<u64> {
        self.grants.get(&format!("{entitlement}/{unit}")).copied()
    }

    /// Parses every grant key. Malformed keys are returned as errors in place.
    pub fn grant_entries(&self) -> Vec<LicensingResult<(GrantKey, u64)>> {
        self.grants
            .iter()
            .map(|(key, amount)| GrantKey::parse(key).map(|k| (k, *amount)))
            .collect()
    }
}

/// A parsed `"<entitlement>/<unit>"` grant key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GrantKey {
    pub entitlement: String,
    pub unit: String,
}

impl GrantKey {
    pub fn parse(raw: &str) -> LicensingResult<Self> {
        match raw.split_once('/') {
            Some((entitlement, unit))
                if !entitlement.is_empty() && !unit.is_empty() && !unit.contains('/') =>
            {
                Ok(Self {
                    entitlement: entitlement.to_string(),
                    unit: unit.to_string(),
                })
            }
            _ => Err(LicensingError::InvalidToken(format!(
                "grant key '{raw}' is not of the form <entitlement>/<unit>"
            ))),
        }
    }
}

impl std::fmt::Display for GrantKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entitlement, self.unit)
    }
}

/// Signs `token` with `key`, producing the wire string.
pub fn sign(token: &LicenseToken, key: &RsaPrivateKey) -> LicensingResult<String> {
    let payload = serde_json::to_vec(token)
        .map_err(|e| LicensingError::InvalidToken(format!("cannot encode payload: {e}")))?;
    let payload_b64 = STANDARD.encode(payload);

    let digest = Sha256::digest(payload_b64.as_bytes());
    let signature = key
        .sign_with_rng(&mut rand::thread_rng(), Pss::new::<Sha256>(), &digest)
        .map_err(|e| LicensingError::Key(format!("signing failed: {e}")))?;

    Ok(format!("{payload_b64}.{}", STANDARD.encode(signature)))
}

/// The public keys accepted for token verification.
///
/// Loaded once at startup and shared by reference. Any one anchor verifying
/// is enough, so a retired signing key can stay trusted while a new one is
/// rolled out.
#[derive(Debug, Clone, Default)]
pub struct TrustAnchors {
    keys: Vec<RsaPublicKey>,
}

impl TrustAnchors {
    pub fn new(keys: Vec<RsaPublicKey>) -> Self {
        Self { keys }
    }

    /// Parses one PKCS#1 PEM public key per entry.
    pub fn from_pems<I, S>(pems: I) -> LicensingResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = pems
            .into_iter()
            .map(|pem| keys::decode_public_key(pem.as_ref()))
            .collect::<LicensingResult<Vec<_>>>()?;
        Ok(Self { keys })
    }

    pub fn from_pem_files<P: AsRef<Path>>(paths: &[P]) -> LicensingResult<Self> {
        let keys = paths
            .iter()
            .map(|path| keys::load_public_key(path))
            .collect::<LicensingResult<Vec<_>>>()?;
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Checks the signature against every anchor and decodes the payload.
    pub fn verify(&self, raw: &[u8]) -> LicensingResult<LicenseToken> {
        let raw = std::str::from_utf8(raw)
            .map_err(|_| LicensingError::InvalidToken("token is not ASCII".to_string()))?
            .trim();
        if raw.is_empty() {
            return Err(LicensingError::InvalidToken("token is empty".to_string()));
        }

        let parts: Vec<&str> = raw.split('.').collect();
        if parts.len() != 2 {
            return Err(LicensingError::InvalidToken(
                "token must have exactly two parts separated by a dot".to_string(),
            ));
        }
        let (payload_b64, signature_b64) = (parts[0], parts[1]);

        let signature = STANDARD.decode(signature_b64).map_err(|e| {
            LicensingError::InvalidToken(format!("invalid signature base64: {e}"))
        })?;
        let payload_json = STANDARD
            .decode(payload_b64)
            .map_err(|e| LicensingError::InvalidToken(format!("invalid payload base64: {e}")))?;

        let digest = Sha256::digest(payload_b64.as_bytes());
        let trusted = self
            .keys
            .iter()
            .any(|key| key.verify(Pss::new::<Sha256>(), &digest, &signature).is_ok());
        if !trusted {
            return Err(LicensingError::InvalidToken(
                "signature does not verify against any trust anchor".to_string(),
            ));
        }

        Ok(serde_json::from_slice(&payload_json)?)
    }
}
