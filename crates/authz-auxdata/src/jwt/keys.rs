//! Verification key material
//!
//! [`KeyMaterial`] is the immutable result of parsing a JWK, a JWK set or a
//! PEM bundle. It is cheap to clone (one `Arc`) and shared freely between
//! concurrent verifications.
//!
//! Supported key types:
//!
//! | Key | Algorithms |
//! |-----|------------|
//! | RSA | RS256, RS384, RS512, PS256, PS384, PS512 |
//! | EC P-256 / P-384 | ES256 / ES384 |
//! | OKP Ed25519 | EdDSA |
//! | oct | HS256, HS384, HS512 |
//!
//! A JWK carrying an `alg` member is restricted to that algorithm. P-521
//! (ES512) keys are not supported and are skipped.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use tracing::warn;

use crate::error::KeyError;

const RSA_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
];
const HMAC_ALGORITHMS: &[Algorithm] = &[Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
// A PEM EC key does not reveal its curve to us; verification fails on a mismatch.
const PEM_EC_ALGORITHMS: &[Algorithm] = &[Algorithm::ES256, Algorithm::ES384];

/// One key usable to verify a signature
#[derive(Clone)]
pub struct VerificationKey {
    kid: Option<String>,
    algorithms: Vec<Algorithm>,
    key: DecodingKey,
}

// DecodingKey holds key bytes; keep them out of logs
impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .field("algorithms", &self.algorithms)
            .finish_non_exhaustive()
    }
}

impl VerificationKey {
    /// Key id, when the JWK carried one
    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    pub fn algorithms(&self) -> &[Algorithm] {
        &self.algorithms
    }

    pub fn allows(&self, alg: Algorithm) -> bool {
        self.algorithms.contains(&alg)
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }

    /// Build a key from a single JWK
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Parse`] for encryption keys, unsupported key types
    /// or curves, and malformed key parameters.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self, KeyError> {
        if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
            return Err(KeyError::Parse("key is intended for encryption".to_string()));
        }

        let family: Vec<Algorithm> = match &jwk.algorithm {
            AlgorithmParameters::RSA(_) => RSA_ALGORITHMS.to_vec(),
            AlgorithmParameters::OctetKey(_) => HMAC_ALGORITHMS.to_vec(),
            AlgorithmParameters::EllipticCurve(params) => match params.curve {
                EllipticCurve::P256 => vec![Algorithm::ES256],
                EllipticCurve::P384 => vec![Algorithm::ES384],
                ref other => {
                    return Err(KeyError::Parse(format!("unsupported curve {other:?}")));
                }
            },
            AlgorithmParameters::OctetKeyPair(params) => match params.curve {
                EllipticCurve::Ed25519 => vec![Algorithm::EdDSA],
                ref other => {
                    return Err(KeyError::Parse(format!("unsupported curve {other:?}")));
                }
            },
            #[allow(unreachable_patterns)]
            _ => return Err(KeyError::Parse("unsupported key type".to_string())),
        };

        let algorithms = match &jwk.common.key_algorithm {
            None => family,
            Some(declared) => {
                let alg = declared_algorithm(declared)?;
                if !family.contains(&alg) {
                    return Err(KeyError::Parse(format!(
                        "algorithm {alg:?} does not match the key type"
                    )));
                }
                vec![alg]
            }
        };

        let key = DecodingKey::from_jwk(jwk).map_err(|e| KeyError::Parse(e.to_string()))?;

        Ok(Self {
            kid: jwk.common.key_id.clone(),
            algorithms,
            key,
        })
    }

    /// Build a key from one `PUBLIC KEY` or `RSA PUBLIC KEY` block
    fn from_pem(block: &::pem::Pem) -> Result<Self, KeyError> {
        let parse_err = |e: jsonwebtoken::errors::Error| KeyError::Parse(e.to_string());
        let encoded = ::pem::encode(block);
        let encoded = encoded.as_bytes();

        let (algorithms, key) = match block.tag() {
            "RSA PUBLIC KEY" => (
                RSA_ALGORITHMS.to_vec(),
                DecodingKey::from_rsa_pem(encoded).map_err(parse_err)?,
            ),
            _ => {
                if let Ok(key) = DecodingKey::from_rsa_pem(encoded) {
                    (RSA_ALGORITHMS.to_vec(), key)
                } else if let Ok(key) = DecodingKey::from_ec_pem(encoded) {
                    (PEM_EC_ALGORITHMS.to_vec(), key)
                } else {
                    (
                        vec![Algorithm::EdDSA],
                        DecodingKey::from_ed_pem(encoded).map_err(parse_err)?,
                    )
                }
            }
        };

        Ok(Self {
            kid: None,
            algorithms,
            key,
        })
    }
}

/// `KeyAlgorithm` and `Algorithm` share their JOSE names
fn declared_algorithm(declared: &jsonwebtoken::jwk::KeyAlgorithm) -> Result<Algorithm, KeyError> {
    let name = serde_json::to_value(declared)
        .ok()
        .and_then(|v| v.as_str().map(str::to_owned))
        .ok_or_else(|| KeyError::Parse("unreadable key algorithm".to_string()))?;
    Algorithm::from_str(&name)
        .map_err(|_| KeyError::Parse(format!("algorithm {name} is not a signature algorithm")))
}

/// An immutable set of verification keys
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    keys: Arc<[VerificationKey]>,
}

impl KeyMaterial {
    /// Wrap already-built keys
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Empty`] when `keys` is empty.
    pub fn new(keys: Vec<VerificationKey>) -> Result<Self, KeyError> {
        if keys.is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(Self { keys: keys.into() })
    }

    /// Parse key bytes as PEM or as JWK JSON
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Parse`] for malformed input and [`KeyError::Empty`]
    /// when no usable key remains.
    pub fn parse(bytes: &[u8], pem: bool) -> Result<Self, KeyError> {
        if pem {
            Self::parse_pem(bytes)
        } else {
            Self::parse_json(bytes)
        }
    }

    /// Parse a JWK set (`{"keys": [...]}`) or a single JWK
    ///
    /// Individual keys that cannot be used for signature verification are
    /// skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Parse`] when the bytes are not JSON, a single JWK is
    /// invalid, and [`KeyError::Empty`] when a set yields no usable key.
    pub fn parse_json(bytes: &[u8]) -> Result<Self, KeyError> {
        let doc: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| KeyError::Parse(e.to_string()))?;

        let Some(entries) = doc.get("keys") else {
            let jwk: Jwk = serde_json::from_value(doc).map_err(|e| KeyError::Parse(e.to_string()))?;
            return Self::new(vec![VerificationKey::from_jwk(&jwk)?]);
        };

        let entries = entries
            .as_array()
            .ok_or_else(|| KeyError::Parse("'keys' must be an array".to_string()))?;

        let mut keys = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let parsed = serde_json::from_value::<Jwk>(entry.clone())
                .map_err(|e| KeyError::Parse(e.to_string()))
                .and_then(|jwk| VerificationKey::from_jwk(&jwk));
            match parsed {
                Ok(key) => keys.push(key),
                Err(e) => warn!(index, error = %e, "Skipping unusable key in JWK set"),
            }
        }

        Self::new(keys)
    }

    /// Parse one or more PEM-encoded public keys
    ///
    /// Blocks other than `PUBLIC KEY` and `RSA PUBLIC KEY` (certificates,
    /// private keys) are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Parse`] when the input holds no PEM block or a
    /// public key block fails to decode, and [`KeyError::Empty`] when no
    /// public key block remains.
    pub fn parse_pem(bytes: &[u8]) -> Result<Self, KeyError> {
        let blocks = ::pem::parse_many(bytes).map_err(|e| KeyError::Parse(e.to_string()))?;
        if blocks.is_empty() {
            return Err(KeyError::Parse("no PEM blocks found".to_string()));
        }

        let mut keys = Vec::with_capacity(blocks.len());
        for block in &blocks {
            match block.tag() {
                "PUBLIC KEY" | "RSA PUBLIC KEY" => keys.push(VerificationKey::from_pem(block)?),
                other => warn!(tag = other, "Skipping non-public-key PEM block"),
            }
        }

        Self::new(keys)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// All keys, in source order
    pub fn keys(&self) -> &[VerificationKey] {
        &self.keys
    }

    /// Keys eligible to verify a token with the given header `kid` and `alg`
    ///
    /// A token `kid` selects the keys carrying that id, falling back to keys
    /// without an id when none match. A token without `kid` considers every key.
    pub(crate) fn candidates(&self, kid: Option<&str>, alg: Algorithm) -> Vec<&VerificationKey> {
        let by_kid = |want: Option<&str>| {
            self.keys
                .iter()
                .filter(move |k| k.kid.as_deref() == want && k.allows(alg))
                .collect::<Vec<_>>()
        };

        match kid {
            Some(kid) => {
                let matched = by_kid(Some(kid));
                if matched.is_empty() { by_kid(None) } else { matched }
            }
            None => self.keys.iter().filter(|k| k.allows(alg)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const EC_PUBLIC_PEM: &str = "-----BEGIN PUBLIC KEY-----
MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAEqetFUOjTQCasnjGRtREe4iKtulUX
p+fCW7QWX45Sfc/po8IEbUO6s9fKhE+vM7LlLcgCWnnJk6LRgdTAV6ynbw==
-----END PUBLIC KEY-----
";

    fn oct_jwk(kid: &str) -> serde_json::Value {
        json!({"kty": "oct", "kid": kid, "k": "c2VjcmV0LWtleS1mb3ItdGVzdGluZy0xMjM0NTY3ODkw"})
    }

    #[test]
    fn test_parse_jwk_set() {
        let set = json!({"keys": [oct_jwk("a"), oct_jwk("b")]});
        let material = KeyMaterial::parse(set.to_string().as_bytes(), false).unwrap();
        assert_eq!(material.len(), 2);
        assert_eq!(material.keys()[0].kid(), Some("a"));
        assert!(material.keys()[0].allows(Algorithm::HS256));
        assert!(!material.keys()[0].allows(Algorithm::RS256));
    }

    #[test]
    fn test_parse_single_jwk() {
        let material = KeyMaterial::parse(oct_jwk("solo").to_string().as_bytes(), false).unwrap();
        assert_eq!(material.len(), 1);
    }

    #[test]
    fn test_declared_alg_narrows_key() {
        let mut jwk = oct_jwk("hs384");
        jwk["alg"] = json!("HS384");
        let material = KeyMaterial::parse_json(jwk.to_string().as_bytes()).unwrap();
        assert_eq!(material.keys()[0].algorithms(), &[Algorithm::HS384]);
    }

    #[test]
    fn test_unusable_keys_skipped() {
        let mut enc = oct_jwk("enc");
        enc["use"] = json!("enc");
        let set = json!({"keys": [enc, {"kty": "bogus"}, oct_jwk("ok")]});
        let material = KeyMaterial::parse_json(set.to_string().as_bytes()).unwrap();
        assert_eq!(material.len(), 1);
        assert_eq!(material.keys()[0].kid(), Some("ok"));
    }

    #[test]
    fn test_empty_set_rejected() {
        let err = KeyMaterial::parse_json(br#"{"keys": []}"#).unwrap_err();
        assert_eq!(err, KeyError::Empty);
        assert!(matches!(KeyMaterial::parse_json(b"not json"), Err(KeyError::Parse(_))));
    }

    #[test]
    fn test_parse_ec_pem() {
        let material = KeyMaterial::parse(EC_PUBLIC_PEM.as_bytes(), true).unwrap();
        assert_eq!(material.len(), 1);
        assert!(material.keys()[0].allows(Algorithm::ES256));
        assert_eq!(material.keys()[0].kid(), None);
    }

    #[test]
    fn test_parse_multiple_pem_blocks() {
        let bundle = format!("{EC_PUBLIC_PEM}\n{EC_PUBLIC_PEM}");
        let material = KeyMaterial::parse_pem(bundle.as_bytes()).unwrap();
        assert_eq!(material.len(), 2);
    }

    #[test]
    fn test_pem_errors() {
        assert!(matches!(KeyMaterial::parse_pem(b"garbage"), Err(KeyError::Parse(_))));
        assert!(matches!(
            KeyMaterial::parse_pem(b"-----BEGIN PUBLIC KEY-----\nabc\n"),
            Err(KeyError::Parse(_))
        ));
        assert!(matches!(
            KeyMaterial::parse_pem(b"-----BEGIN CERTIFICATE-----\nYWJj\n-----END CERTIFICATE-----\n"),
            Err(KeyError::Empty)
        ));
    }

    #[test]
    fn test_pem_bundle_skips_other_blocks() {
        let bundle = format!(
            "-----BEGIN CERTIFICATE-----\nYWJj\n-----END CERTIFICATE-----\n{EC_PUBLIC_PEM}"
        );
        let material = KeyMaterial::parse_pem(bundle.as_bytes()).unwrap();
        assert_eq!(material.len(), 1);
        assert!(material.keys()[0].allows(Algorithm::ES256));
    }

    #[test]
    fn test_candidates_by_kid() {
        let mut anonymous = oct_jwk("x");
        anonymous.as_object_mut().unwrap().remove("kid");
        let set = json!({"keys": [oct_jwk("a"), oct_jwk("b"), anonymous]});
        let material = KeyMaterial::parse_json(set.to_string().as_bytes()).unwrap();

        let picked = material.candidates(Some("b"), Algorithm::HS256);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].kid(), Some("b"));

        let fallback = material.candidates(Some("zzz"), Algorithm::HS256);
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback[0].kid(), None);

        assert_eq!(material.candidates(None, Algorithm::HS256).len(), 3);
        assert!(material.candidates(None, Algorithm::ES256).is_empty());
    }
}
