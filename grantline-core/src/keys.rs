//! RSA key material: generation and PKCS#1 PEM encoding.

use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding,
};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::path::Path;

use crate::error::{LicensingError, LicensingResult};

/// Modulus size used by the key generator unless told otherwise.
pub const DEFAULT_KEY_BITS: usize = 2048;

pub fn generate_private_key(bits: usize) -> LicensingResult<RsaPrivateKey> {
    RsaPrivateKey::new(&mut rand::thread_rng(), bits)
        .map_err(|e| LicensingError::Key(format!("key generation failed: {e}")))
}

pub fn encode_private_key(key: &RsaPrivateKey) -> LicensingResult<String> {
    key.to_pkcs1_pem(LineEnding::LF)
        .map(|pem| pem.to_string())
        .map_err(|e| LicensingError::Key(format!("cannot encode private key: {e}")))
}

pub fn encode_public_key(key: &RsaPublicKey) -> LicensingResult<String> {
    key.to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| LicensingError::Key(format!("cannot encode public key: {e}")))
}

pub fn decode_private_key(pem: &str) -> LicensingResult<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs1_pem(pem.trim())
        .map_err(|e| LicensingError::Key(format!("invalid RSA private key: {e}")))
}

pub fn decode_public_key(pem: &str) -> LicensingResult<RsaPublicKey> {
    RsaPublicKey::from_pkcs1_pem(pem.trim())
        .map_err(|e| LicensingError::Key(format!("invalid RSA public key: {e}")))
}

pub fn load_private_key<P: AsRef<Path>>(path: P) -> LicensingResult<RsaPrivateKey> {
    decode_private_key(&read(path.as_ref())?)
}

pub fn load_public_key<P: AsRef<Path>>(path: P) -> LicensingResult<RsaPublicKey> {
    decode_public_key(&read(path.as_ref())?)
}

fn read(path: &Path) -> LicensingResult<String> {
    std::fs::read_to_string(path)
        .map_err(|e| LicensingError::Key(format!("cannot read {}: {e}", path.display())))
}
