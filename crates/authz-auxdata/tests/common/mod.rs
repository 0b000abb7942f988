//! Common test utilities for integration tests
//!
//! Token minting (HS256 and ES256), JWK fixtures, a mock JWKS endpoint and a
//! keyset that counts its resolutions.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use authz_auxdata::config::KeySetConfig;
use authz_auxdata::context::RequestContext;
use authz_auxdata::error::Result;
use authz_auxdata::jwt::{KeyMaterial, KeySet};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const HMAC_SECRET: &[u8] = b"secret-key-for-testing-1234567890";
/// `HMAC_SECRET` as base64url, the JWK `k` member
pub const HMAC_K: &str = "c2VjcmV0LWtleS1mb3ItdGVzdGluZy0xMjM0NTY3ODkw";

pub const EC_PRIVATE_PEM: &str = include_str!("../testdata/ec_private.pem");
pub const EC_PUBLIC_PEM: &str = include_str!("../testdata/ec_public.pem");
const EC_X: &str = "qetFUOjTQCasnjGRtREe4iKtulUXp-fCW7QWX45Sfc8";
const EC_Y: &str = "6aPCBG1DurPXyoRPrzOy5S3IAlp5yZOi0YHUwFesp28";

/// Current time as seconds since the epoch
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

pub fn hmac_jwk(kid: &str) -> Value {
    json!({"kty": "oct", "kid": kid, "alg": "HS256", "k": HMAC_K})
}

/// A different HMAC key, for rotation and wrong-key scenarios
pub fn other_hmac_jwk(kid: &str) -> Value {
    json!({"kty": "oct", "kid": kid, "alg": "HS256", "k": "b3RoZXItc2VjcmV0LWtleS0xMjM0NTY3ODkwYWJj"})
}

pub const OTHER_HMAC_SECRET: &[u8] = b"other-secret-key-1234567890abc";

pub fn ec_jwk(kid: &str) -> Value {
    json!({
        "kty": "EC",
        "crv": "P-256",
        "kid": kid,
        "use": "sig",
        "alg": "ES256",
        "x": EC_X,
        "y": EC_Y
    })
}

pub fn jwks(keys: &[Value]) -> Value {
    json!({ "keys": keys })
}

/// Sign `claims` with HS256 and [`HMAC_SECRET`]
pub fn sign_hs256(kid: Option<&str>, claims: &Value) -> String {
    sign_hs256_with(kid, claims, HMAC_SECRET)
}

pub fn sign_hs256_with(kid: Option<&str>, claims: &Value, secret: &[u8]) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = kid.map(str::to_string);
    jsonwebtoken::encode(&header, claims, &EncodingKey::from_secret(secret)).unwrap()
}

/// Sign `claims` with ES256 and the fixture EC key
pub fn sign_es256(kid: Option<&str>, claims: &Value) -> String {
    let mut header = Header::new(Algorithm::ES256);
    header.kid = kid.map(str::to_string);
    let key = EncodingKey::from_ec_pem(EC_PRIVATE_PEM.as_bytes()).unwrap();
    jsonwebtoken::encode(&header, claims, &key).unwrap()
}

/// An unsigned (`alg: none`) token with an empty signature segment
pub fn unsigned_token(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.")
}

/// Local keyset config holding `keys` as inline JWKS data
pub fn local_jwks(id: &str, keys: &[Value]) -> KeySetConfig {
    KeySetConfig::local_data(id, STANDARD.encode(jwks(keys).to_string()), false)
}

pub fn hmac_material() -> KeyMaterial {
    KeyMaterial::parse_json(jwks(&[hmac_jwk("k1")]).to_string().as_bytes()).unwrap()
}

/// Keyset that counts how often it is resolved
#[derive(Debug)]
pub struct CountingKeySet {
    material: KeyMaterial,
    calls: AtomicUsize,
}

impl CountingKeySet {
    pub fn new(material: KeyMaterial) -> Arc<Self> {
        Arc::new(Self {
            material,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySet for CountingKeySet {
    async fn resolve(&self, _cx: &RequestContext) -> Result<KeyMaterial> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.material.clone())
    }
}

/// Mock JWKS endpoint
pub struct MockJwksServer {
    pub server: MockServer,
    pub url: String,
}

impl MockJwksServer {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let url = format!("{}/jwks", server.uri());
        Self { server, url }
    }

    /// Serve `keys` for every request
    pub async fn mock_jwks(&self, keys: &[Value]) {
        self.mock(ResponseTemplate::new(200).set_body_json(jwks(keys)), None)
            .await;
    }

    /// Serve `keys` for the next `times` requests only
    pub async fn mock_jwks_times(&self, keys: &[Value], times: u64) {
        self.mock(
            ResponseTemplate::new(200).set_body_json(jwks(keys)),
            Some(times),
        )
        .await;
    }

    /// Respond with `status` for the next `times` requests (or always)
    pub async fn mock_status(&self, status: u16, times: Option<u64>) {
        self.mock(ResponseTemplate::new(status), times).await;
    }

    /// Serve `keys` after `delay`
    pub async fn mock_jwks_delayed(&self, keys: &[Value], delay: Duration) {
        self.mock(
            ResponseTemplate::new(200)
                .set_body_json(jwks(keys))
                .set_delay(delay),
            None,
        )
        .await;
    }

    async fn mock(&self, response: ResponseTemplate, times: Option<u64>) {
        let mut mock = Mock::given(method("GET")).and(path("/jwks")).respond_with(response);
        if let Some(times) = times {
            mock = mock.up_to_n_times(times);
        }
        mock.mount(&self.server).await;
    }

    pub async fn request_count(&self) -> usize {
        self.server
            .received_requests()
            .await
            .map(|r| r.len())
            .unwrap_or(0)
    }
}
