//! Keysets and the keyset registry
//!
//! A [`KeySet`] resolves the key material that verifies a token. Two variants
//! exist:
//!
//! - [`LocalKeySet`]: key bytes from inline base64 data or a file, parsed once
//!   at construction. A construction failure is kept and returned by every
//!   `resolve` call, so a misconfigured keyset fails its requests instead of
//!   the process.
//! - [`RemoteKeySet`]: a JWKS URL served by the shared [`JwksRefresher`].
//!
//! The [`KeySetRegistry`] maps keyset ids to keysets and decides which one a
//! request uses. Building it performs no network I/O.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, warn};

use super::keys::KeyMaterial;
use super::refresh::JwksRefresher;
use crate::config::{ConfigError, KeySetConfig, KeySetSource, LocalSource};
use crate::context::RequestContext;
use crate::error::{AuxDataError, KeyError, Result};

/// Source of verification key material
#[async_trait]
pub trait KeySet: Send + Sync + fmt::Debug {
    /// Current key material
    ///
    /// # Errors
    ///
    /// Returns [`AuxDataError::Config`] for a misconfigured local keyset,
    /// [`AuxDataError::KeySetFetch`] when remote material cannot be fetched,
    /// or a cancellation error when `cx` ends first.
    async fn resolve(&self, cx: &RequestContext) -> Result<KeyMaterial>;
}

/// Keyset parsed once from configured bytes
#[derive(Debug)]
pub struct LocalKeySet {
    id: String,
    material: std::result::Result<KeyMaterial, KeyError>,
}

impl LocalKeySet {
    /// Load and parse `source`; a failure is stored, not returned
    pub fn from_source(id: impl Into<String>, source: &LocalSource) -> Self {
        let id = id.into();
        let material = load_local(source);
        if let Err(err) = &material {
            warn!(key_set_id = %id, error = %err, "Local keyset is unusable");
        }
        Self { id, material }
    }

    /// Wrap already parsed key material
    pub fn from_material(id: impl Into<String>, material: KeyMaterial) -> Self {
        Self {
            id: id.into(),
            material: Ok(material),
        }
    }

    /// Keyset id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The construction error, if any
    pub fn error(&self) -> Option<&KeyError> {
        self.material.as_ref().err()
    }
}

#[async_trait]
impl KeySet for LocalKeySet {
    async fn resolve(&self, _cx: &RequestContext) -> Result<KeyMaterial> {
        self.material.clone().map_err(AuxDataError::from)
    }
}

fn load_local(source: &LocalSource) -> std::result::Result<KeyMaterial, KeyError> {
    let bytes = match (source.data.as_deref(), source.file.as_ref()) {
        (Some(data), _) if !data.is_empty() => STANDARD
            .decode(data.trim())
            .map_err(|e| KeyError::Decode(e.to_string()))?,
        (_, Some(path)) => std::fs::read(path).map_err(|e| KeyError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?,
        _ => return Err(KeyError::Parse("no key data configured".to_string())),
    };
    KeyMaterial::parse(&bytes, source.pem)
}

/// Keyset fetched from a JWKS endpoint through the shared refresher
pub struct RemoteKeySet {
    id: String,
    url: String,
    refresher: Arc<JwksRefresher>,
}

impl fmt::Debug for RemoteKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteKeySet")
            .field("id", &self.id)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl RemoteKeySet {
    /// Register `url` with `refresher` and wrap it; performs no I/O
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        refresh_interval: Option<std::time::Duration>,
        refresher: Arc<JwksRefresher>,
    ) -> Self {
        let url = url.into();
        refresher.register(&url, refresh_interval);
        Self {
            id: id.into(),
            url,
            refresher,
        }
    }

    /// Keyset id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// JWKS endpoint served by the shared refresher
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl KeySet for RemoteKeySet {
    async fn resolve(&self, cx: &RequestContext) -> Result<KeyMaterial> {
        self.refresher.get(&self.url, cx).await
    }
}

/// Keysets by id, with the selection rule for requests
#[derive(Default)]
pub struct KeySetRegistry {
    key_sets: HashMap<String, Arc<dyn KeySet>>,
    refresher: Option<Arc<JwksRefresher>>,
}

impl fmt::Debug for KeySetRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySetRegistry")
            .field("key_sets", &self.key_sets)
            .field("has_refresher", &self.refresher.is_some())
            .finish()
    }
}

impl KeySetRegistry {
    /// A registry without keysets
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from configuration
    ///
    /// The shared refresher is created with the first remote keyset; a
    /// registry with only local keysets has none.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for an invalid or duplicate definition, or
    /// when the refresher's HTTP client cannot be created. Unusable local key
    /// data is not an error here.
    pub fn build(configs: &[KeySetConfig]) -> std::result::Result<Self, ConfigError> {
        Self::build_inner(configs, None)
    }

    /// Build from configuration, registering remote keysets with `refresher`
    ///
    /// # Errors
    ///
    /// Same as [`build`](Self::build).
    pub fn build_with_refresher(
        configs: &[KeySetConfig],
        refresher: Arc<JwksRefresher>,
    ) -> std::result::Result<Self, ConfigError> {
        Self::build_inner(configs, Some(refresher))
    }

    fn build_inner(
        configs: &[KeySetConfig],
        mut refresher: Option<Arc<JwksRefresher>>,
    ) -> std::result::Result<Self, ConfigError> {
        let mut key_sets: HashMap<String, Arc<dyn KeySet>> = HashMap::with_capacity(configs.len());

        for config in configs {
            if key_sets.contains_key(&config.id) {
                return Err(ConfigError::DuplicateKeySet(config.id.clone()));
            }

            let key_set: Arc<dyn KeySet> = match config.source()? {
                KeySetSource::Remote(remote) => {
                    let shared = match &refresher {
                        Some(existing) => Arc::clone(existing),
                        None => {
                            let created = Arc::new(JwksRefresher::new()?);
                            refresher = Some(Arc::clone(&created));
                            created
                        }
                    };
                    Arc::new(RemoteKeySet::new(
                        &config.id,
                        &remote.url,
                        remote.refresh_interval,
                        shared,
                    ))
                }
                KeySetSource::Local(local) => Arc::new(LocalKeySet::from_source(&config.id, local)),
            };

            debug!(key_set_id = %config.id, "Registered keyset");
            key_sets.insert(config.id.clone(), key_set);
        }

        Ok(Self {
            key_sets,
            refresher,
        })
    }

    /// Build from keysets constructed by the caller
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptyKeySetId`] or
    /// [`ConfigError::DuplicateKeySet`] for a bad id.
    pub fn from_key_sets<I, S>(key_sets: I) -> std::result::Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (S, Arc<dyn KeySet>)>,
        S: Into<String>,
    {
        let mut registry = Self::default();
        for (id, key_set) in key_sets {
            let id = id.into();
            if id.is_empty() {
                return Err(ConfigError::EmptyKeySetId);
            }
            if registry.key_sets.contains_key(&id) {
                return Err(ConfigError::DuplicateKeySet(id));
            }
            registry.key_sets.insert(id, key_set);
        }
        Ok(registry)
    }

    /// Select the keyset for a request
    ///
    /// An empty `id` selects the only keyset when there is exactly one.
    ///
    /// # Errors
    ///
    /// Returns [`AuxDataError::NoKeySetToVerify`] for an empty `id` when the
    /// registry does not hold exactly one keyset, and
    /// [`AuxDataError::KeySetNotFound`] for an unknown `id`.
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn KeySet>> {
        if id.is_empty() {
            let mut all = self.key_sets.values();
            return match (all.next(), all.next()) {
                (Some(only), None) => Ok(Arc::clone(only)),
                _ => Err(AuxDataError::NoKeySetToVerify),
            };
        }

        self.key_sets
            .get(id)
            .cloned()
            .ok_or_else(|| AuxDataError::KeySetNotFound(id.to_string()))
    }

    /// Keyset registered under exactly `id`
    pub fn get(&self, id: &str) -> Option<&Arc<dyn KeySet>> {
        self.key_sets.get(id)
    }

    /// Ids of all registered keysets
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.key_sets.keys().map(String::as_str)
    }

    /// Number of registered keysets
    pub fn len(&self) -> usize {
        self.key_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_sets.is_empty()
    }

    /// The shared refresher serving remote keysets, if any
    pub fn refresher(&self) -> Option<&Arc<JwksRefresher>> {
        self.refresher.as_ref()
    }

    /// Stop background refreshing
    pub async fn shutdown(&self) {
        if let Some(refresher) = &self.refresher {
            refresher.shutdown().await;
        }
    }
}
