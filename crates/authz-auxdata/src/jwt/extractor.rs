//! JWT claim extraction
//!
//! [`JwtExtractor::extract`] turns a bearer token into claims for the policy
//! evaluator:
//!
//! 1. An empty token yields `None`: no auxiliary credential was supplied.
//! 2. With verification disabled the signature is not checked and no keyset
//!    is consulted.
//! 3. Otherwise a verification cache hit skips the signature check; a miss
//!    resolves the keyset and verifies the signature.
//! 4. Time claims (`exp`, `nbf`, `iat`) are checked on every call, cached or
//!    not.
//! 5. A verified token is recorded in the cache until its own expiry.
//! 6. Claims are converted to [`Value`](crate::value::Value)s; a claim that
//!    cannot be converted is dropped with a warning.
//!
//! # Example
//!
//! ```no_run
//! use authz_auxdata::config::{JwtConfig, KeySetConfig};
//! use authz_auxdata::context::RequestContext;
//! use authz_auxdata::jwt::JwtExtractor;
//!
//! # async fn example(token: &str) -> Result<(), Box<dyn std::error::Error>> {
//! let config = JwtConfig {
//!     key_sets: vec![KeySetConfig::remote("idp", "https://idp.example.com/jwks")],
//!     ..JwtConfig::default()
//! };
//! let extractor = JwtExtractor::new(&config)?;
//!
//! if let Some(claims) = extractor.extract(&RequestContext::new(), token, "").await? {
//!     println!("subject: {:?}", claims.get("sub"));
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, instrument, warn};

use super::cache::{CacheKey, DEFAULT_CACHE_EXPIRY, VerificationCache};
use super::keys::KeyMaterial;
use super::keyset::KeySetRegistry;
use super::refresh::JwksRefresher;
use super::token::ParsedToken;
use crate::config::{ConfigError, JwtConfig};
use crate::context::RequestContext;
use crate::error::Result;
use crate::value::{Claims, JsonValueConverter, ValueConverter};

/// Extracts verified claims from JWTs
pub struct JwtExtractor {
    key_sets: KeySetRegistry,
    cache: Option<VerificationCache>,
    verify: bool,
    clock_skew: Duration,
    converter: Arc<dyn ValueConverter>,
}

impl std::fmt::Debug for JwtExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtExtractor")
            .field("key_sets", &self.key_sets)
            .field("cache", &self.cache)
            .field("verify", &self.verify)
            .field("clock_skew", &self.clock_skew)
            .finish_non_exhaustive()
    }
}

impl JwtExtractor {
    /// Build an extractor from configuration
    ///
    /// With verification disabled no keyset and no cache are built.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the configuration is invalid or the
    /// keyset registry cannot be built.
    pub fn new(config: &JwtConfig) -> std::result::Result<Self, ConfigError> {
        Self::from_config(config, None)
    }

    /// Like [`new`](Self::new), registering remote keysets with `refresher`
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_refresher(
        config: &JwtConfig,
        refresher: Arc<JwksRefresher>,
    ) -> std::result::Result<Self, ConfigError> {
        Self::from_config(config, Some(refresher))
    }

    fn from_config(
        config: &JwtConfig,
        refresher: Option<Arc<JwksRefresher>>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let mut builder = JwtExtractorBuilder::default()
            .cache_size(config.cache_size)
            .clock_skew(config.clock_skew);

        if !config.verify() {
            return Ok(builder.disable_verification().build());
        }

        let key_sets = match refresher {
            Some(refresher) => KeySetRegistry::build_with_refresher(&config.key_sets, refresher)?,
            None => KeySetRegistry::build(&config.key_sets)?,
        };
        builder = builder.key_sets(key_sets);
        Ok(builder.build())
    }

    /// Start an extractor without a configuration file
    pub fn builder() -> JwtExtractorBuilder {
        JwtExtractorBuilder::default()
    }

    /// Extract the claims of `token`
    ///
    /// Returns `Ok(None)` for an empty token. `key_set_id` selects the keyset;
    /// an empty id selects the only configured one.
    ///
    /// # Errors
    ///
    /// - [`NoKeySetToVerify`](crate::AuxDataError::NoKeySetToVerify) /
    ///   [`KeySetNotFound`](crate::AuxDataError::KeySetNotFound) when no
    ///   keyset can be selected
    /// - [`Config`](crate::AuxDataError::Config) /
    ///   [`KeySetFetch`](crate::AuxDataError::KeySetFetch) when the keyset
    ///   cannot produce key material
    /// - [`Cancelled`](crate::AuxDataError::Cancelled) /
    ///   [`DeadlineExceeded`](crate::AuxDataError::DeadlineExceeded) when `cx`
    ///   ends during a keyset fetch
    /// - [`TokenParse`](crate::AuxDataError::TokenParse) for a malformed token
    /// - [`TokenValidation`](crate::AuxDataError::TokenValidation) for a bad
    ///   signature or failed time check
    #[instrument(name = "aux_data.extract_jwt", skip_all, fields(key_set_id = %key_set_id))]
    pub async fn extract(
        &self,
        cx: &RequestContext,
        token: &str,
        key_set_id: &str,
    ) -> Result<Option<Claims>> {
        if token.is_empty() {
            return Ok(None);
        }

        let cache_key = self.cache.as_ref().and_then(|_| CacheKey::from_token(token));
        let material = self.key_material(cx, key_set_id, cache_key.as_ref()).await?;

        let parsed = ParsedToken::parse(token)?;
        if let Some(material) = &material {
            parsed.verify_signature(material)?;
        }

        let now = SystemTime::now();
        parsed.validate_time(now, self.clock_skew)?;

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            let ttl = parsed
                .remaining_validity(now)
                .unwrap_or(DEFAULT_CACHE_EXPIRY);
            cache.record(key, ttl).await;
        }

        Ok(Some(self.convert_claims(parsed)))
    }

    /// Key material to verify with, or `None` when the signature is trusted
    async fn key_material(
        &self,
        cx: &RequestContext,
        key_set_id: &str,
        cache_key: Option<&CacheKey>,
    ) -> Result<Option<KeyMaterial>> {
        if !self.verify {
            return Ok(None);
        }

        if let (Some(cache), Some(key)) = (&self.cache, cache_key)
            && cache.probe(key).await
        {
            debug!("Signature already verified, skipping keyset resolution");
            return Ok(None);
        }

        let key_set = self.key_sets.resolve(key_set_id)?;
        Ok(Some(key_set.resolve(cx).await?))
    }

    fn convert_claims(&self, parsed: ParsedToken<'_>) -> Claims {
        let raw = parsed.into_claims();
        let mut claims = Claims::with_capacity(raw.len());
        for (name, value) in raw {
            match self.converter.convert(&value) {
                Ok(converted) => {
                    claims.insert(name, converted);
                }
                Err(err) => {
                    warn!(claim = %name, error = %err, "Dropping JWT claim with unsupported value");
                }
            }
        }
        claims
    }

    /// Whether signatures are verified
    pub fn verifies_signatures(&self) -> bool {
        self.verify
    }

    /// The keyset registry; empty when verification is disabled
    pub fn key_sets(&self) -> &KeySetRegistry {
        &self.key_sets
    }

    /// The verification cache, when enabled
    pub fn cache(&self) -> Option<&VerificationCache> {
        self.cache.as_ref()
    }

    /// Stop background keyset refreshing
    pub async fn shutdown(&self) {
        self.key_sets.shutdown().await;
    }
}

/// Builder for [`JwtExtractor`]
///
/// Defaults: verification on, no keysets, cache of
/// [`DEFAULT_CACHE_SIZE`](crate::config::DEFAULT_CACHE_SIZE) entries, no
/// clock skew, [`JsonValueConverter`].
pub struct JwtExtractorBuilder {
    key_sets: KeySetRegistry,
    cache_size: i64,
    verify: bool,
    clock_skew: Duration,
    converter: Arc<dyn ValueConverter>,
}

impl Default for JwtExtractorBuilder {
    fn default() -> Self {
        Self {
            key_sets: KeySetRegistry::empty(),
            cache_size: crate::config::DEFAULT_CACHE_SIZE,
            verify: true,
            clock_skew: Duration::ZERO,
            converter: Arc::new(JsonValueConverter::new()),
        }
    }
}

impl JwtExtractorBuilder {
    /// Set the keyset registry
    pub fn key_sets(mut self, key_sets: KeySetRegistry) -> Self {
        self.key_sets = key_sets;
        self
    }

    /// Set the verification cache capacity; zero or less disables the cache
    pub fn cache_size(mut self, cache_size: i64) -> Self {
        self.cache_size = cache_size;
        self
    }

    /// Skip signature verification; time claims are still checked
    pub fn disable_verification(mut self) -> Self {
        self.verify = false;
        self
    }

    /// Tolerance applied to time claim checks
    pub fn clock_skew(mut self, clock_skew: Duration) -> Self {
        self.clock_skew = clock_skew;
        self
    }

    /// Set the claim value converter
    pub fn converter(mut self, converter: Arc<dyn ValueConverter>) -> Self {
        self.converter = converter;
        self
    }

    /// Build the extractor; no cache is created without verification
    pub fn build(self) -> JwtExtractor {
        // The cache only vouches for verified signatures.
        let cache = (self.verify && self.cache_size > 0)
            .then(|| VerificationCache::new(self.cache_size as u64));

        let key_sets = if self.verify {
            self.key_sets
        } else {
            KeySetRegistry::empty()
        };

        JwtExtractor {
            key_sets,
            cache,
            verify: self.verify,
            clock_skew: self.clock_skew,
            converter: self.converter,
        }
    }
}
