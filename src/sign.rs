//! Request signing with RSA PKCS#1 v1.5 over SHA-256 (the provider's
//! "RSA2" scheme).
//!
//! The signature covers the canonicalized parameter set: keys sorted
//! ascending, joined as `key=value` pairs with `&`, empty values and the
//! `sign` field itself excluded. Canonicalization makes signing stable:
//! identical maps always yield identical signatures regardless of insertion
//! order. A signing-backend fault is fatal to the enclosing call and is
//! never retried.

use std::{collections::BTreeMap, path::Path};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use rsa::{
    RsaPrivateKey,
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::DecodePrivateKey,
    pkcs1v15::SigningKey,
    sha2::Sha256,
    signature::{SignatureEncoding, Signer},
};
use tracing::instrument;

use crate::error::{GatewayError, Result};

/// Wire name of the signature parameter, always excluded from the signed
/// message.
pub const SIGN_FIELD: &str = "sign";

/// Signs canonicalized request parameters with the application private key.
#[derive(Debug)]
pub struct RequestSigner {
    key: SigningKey<Sha256>,
}

impl RequestSigner {
    /// Creates a signer from an already-loaded private key.
    #[must_use]
    pub fn new(private_key: RsaPrivateKey) -> Self {
        Self { key: SigningKey::new(private_key) }
    }

    /// Loads the private key from a PEM file, accepting PKCS#8 or PKCS#1
    /// encoding.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`]: key material problems are a fatal
    /// startup error.
    pub fn from_pem_file(path: &Path) -> Result<Self> {
        let key = RsaPrivateKey::read_pkcs8_pem_file(path)
            .or_else(|_| RsaPrivateKey::read_pkcs1_pem_file(path))
            .map_err(|e| {
                GatewayError::Config(format!("cannot load private key {}: {e}", path.display()))
            })?;
        Ok(Self::new(key))
    }

    /// Builds the canonical message for a parameter set.
    ///
    /// Keys come out sorted because the map is a [`BTreeMap`]. Empty values
    /// and the `sign` field are skipped.
    #[must_use]
    pub fn canonicalize(params: &BTreeMap<String, String>) -> String {
        let mut message = String::new();
        for (key, value) in params {
            if key == SIGN_FIELD || value.is_empty() {
                continue;
            }
            if !message.is_empty() {
                message.push('&');
            }
            message.push_str(key);
            message.push('=');
            message.push_str(value);
        }
        message
    }

    /// Signs a parameter set and returns the base64 signature for the
    /// `sign` wire field.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Signing`] when the RSA backend fails.
    #[instrument(skip(self, params), fields(param_count = params.len()))]
    pub fn sign(&self, params: &BTreeMap<String, String>) -> Result<String> {
        let message = Self::canonicalize(params);
        let signature = self
            .key
            .try_sign(message.as_bytes())
            .map_err(|e| GatewayError::Signing(e.to_string()))?;
        Ok(STANDARD.encode(signature.to_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_signer() -> RequestSigner {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
            .expect("test key generation should succeed");
        RequestSigner::new(key)
    }

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect()
    }

    #[test]
    fn test_canonicalize_sorts_keys() {
        let message = RequestSigner::canonicalize(&params(&[
            ("method", "alipay.trade.pay"),
            ("app_id", "2021"),
            ("version", "1.0"),
        ]));
        assert_eq!(message, "app_id=2021&method=alipay.trade.pay&version=1.0");
    }

    #[test]
    fn test_canonicalize_skips_empty_values_and_sign() {
        let message = RequestSigner::canonicalize(&params(&[
            ("app_id", "2021"),
            ("return_url", ""),
            ("sign", "already-present"),
        ]));
        assert_eq!(message, "app_id=2021");
    }

    #[test]
    fn test_signature_is_stable_across_insertion_order() {
        let signer = test_signer();
        let forward = params(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let mut reversed = BTreeMap::new();
        reversed.insert("c".to_owned(), "3".to_owned());
        reversed.insert("b".to_owned(), "2".to_owned());
        reversed.insert("a".to_owned(), "1".to_owned());
        assert_eq!(signer.sign(&forward).unwrap(), signer.sign(&reversed).unwrap());
    }

    #[test]
    fn test_signature_changes_with_content() {
        let signer = test_signer();
        let one = signer.sign(&params(&[("a", "1")])).unwrap();
        let two = signer.sign(&params(&[("a", "2")])).unwrap();
        assert_ne!(one, two);
    }

    #[test]
    fn test_missing_key_file_is_config_error() {
        let result = RequestSigner::from_pem_file(Path::new("/nonexistent/key.pem"));
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }
}
