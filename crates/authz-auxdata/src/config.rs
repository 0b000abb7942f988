//! Auxiliary data configuration
//!
//! ```yaml
//! jwt:
//!   key_sets:
//!     - id: ks1
//!       remote:
//!         url: https://issuer.example.com/.well-known/jwks.json
//!         refresh_interval: 1h
//!     - id: ks2
//!       local:
//!         file: /etc/keys/ks2.pem
//!         pem: true
//!   disable_verification: false
//!   cache_size: 256
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default capacity of the verification cache
pub const DEFAULT_CACHE_SIZE: i64 = 256;

/// Configuration errors raised while loading or building
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("keyset id must not be empty")]
    EmptyKeySetId,

    #[error("duplicate keyset id: {0}")]
    DuplicateKeySet(String),

    #[error("keyset {0} must define either a remote or a local source")]
    MissingSource(String),

    #[error("keyset {0} defines both a remote and a local source")]
    AmbiguousSource(String),

    #[error("local keyset {0} must define exactly one of data or file")]
    InvalidLocalSource(String),

    #[error("invalid URL for keyset {id}: {message}")]
    InvalidUrl { id: String, message: String },

    #[error("failed to create HTTP client: {0}")]
    HttpClient(String),

    /// Config file not found
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// Unsupported file format
    #[error("Unsupported configuration file format. Use .toml, .yaml, .yml, or .json")]
    UnsupportedFormat,

    /// Configuration parsing error
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] config::ConfigError),
}

/// Top-level auxiliary data configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuxDataConfig {
    /// JWT extraction settings. Absent means verification is enabled with no keysets.
    #[serde(default)]
    pub jwt: Option<JwtConfig>,
}

/// JWT extraction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    /// Keysets available for verification
    #[serde(default)]
    pub key_sets: Vec<KeySetConfig>,
    /// Skip signature verification entirely (time claims are still checked)
    #[serde(default)]
    pub disable_verification: bool,
    /// Verification cache capacity; zero or less disables the cache
    #[serde(default = "default_cache_size")]
    pub cache_size: i64,
    /// Tolerance applied to exp/nbf/iat checks
    #[serde(default, with = "humantime_serde")]
    pub clock_skew: Duration,
}

fn default_cache_size() -> i64 {
    DEFAULT_CACHE_SIZE
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            key_sets: Vec::new(),
            disable_verification: false,
            cache_size: DEFAULT_CACHE_SIZE,
            clock_skew: Duration::ZERO,
        }
    }
}

/// A named keyset definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeySetConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalSource>,
}

/// Keyset fetched from a JWKS endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteSource {
    pub url: String,
    /// Refresh cadence; absent or zero uses the refresher's default
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub refresh_interval: Option<Duration>,
}

/// Keyset defined inline or in a file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalSource {
    /// Standard base64 of the key bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// Treat the key bytes as PEM instead of JWK JSON
    #[serde(default)]
    pub pem: bool,
}

/// Borrowed view of the single source a keyset is backed by
#[derive(Debug, Clone, Copy)]
pub enum KeySetSource<'a> {
    Remote(&'a RemoteSource),
    Local(&'a LocalSource),
}

impl KeySetConfig {
    /// Remote keyset refreshed at the default cadence
    pub fn remote(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            remote: Some(RemoteSource {
                url: url.into(),
                refresh_interval: None,
            }),
            local: None,
        }
    }

    /// Local keyset from inline base64 data
    pub fn local_data(id: impl Into<String>, data: impl Into<String>, pem: bool) -> Self {
        Self {
            id: id.into(),
            remote: None,
            local: Some(LocalSource {
                data: Some(data.into()),
                file: None,
                pem,
            }),
        }
    }

    /// Local keyset read from a file
    pub fn local_file(id: impl Into<String>, file: impl Into<PathBuf>, pem: bool) -> Self {
        Self {
            id: id.into(),
            remote: None,
            local: Some(LocalSource {
                data: None,
                file: Some(file.into()),
                pem,
            }),
        }
    }

    /// Set the refresh interval of a remote keyset
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        if let Some(remote) = self.remote.as_mut() {
            remote.refresh_interval = Some(interval);
        }
        self
    }

    /// Check this definition in isolation and return its source
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the id is empty, the source is missing or
    /// ambiguous, a local source is not exactly one of data/file, or a remote
    /// URL is not an absolute http(s) URL.
    pub fn source(&self) -> Result<KeySetSource<'_>, ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::EmptyKeySetId);
        }

        match (&self.remote, &self.local) {
            (Some(_), Some(_)) => Err(ConfigError::AmbiguousSource(self.id.clone())),
            (None, None) => Err(ConfigError::MissingSource(self.id.clone())),
            (Some(remote), None) => {
                let parsed = url::Url::parse(&remote.url).map_err(|e| ConfigError::InvalidUrl {
                    id: self.id.clone(),
                    message: e.to_string(),
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(ConfigError::InvalidUrl {
                        id: self.id.clone(),
                        message: format!("unsupported scheme '{}'", parsed.scheme()),
                    });
                }
                Ok(KeySetSource::Remote(remote))
            }
            (None, Some(local)) => {
                let has_data = local.data.as_deref().is_some_and(|d| !d.is_empty());
                let has_file = local.file.is_some();
                if has_data == has_file {
                    return Err(ConfigError::InvalidLocalSource(self.id.clone()));
                }
                Ok(KeySetSource::Local(local))
            }
        }
    }
}

impl JwtConfig {
    /// Validate every keyset definition and id uniqueness
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::with_capacity(self.key_sets.len());
        for ks in &self.key_sets {
            ks.source()?;
            if !seen.insert(ks.id.as_str()) {
                return Err(ConfigError::DuplicateKeySet(ks.id.clone()));
            }
        }
        Ok(())
    }

    /// Whether signatures are verified
    pub fn verify(&self) -> bool {
        !self.disable_verification
    }
}

impl AuxDataConfig {
    /// Load configuration from a file (TOML, YAML, or JSON)
    ///
    /// Environment variables with the `AUXDATA_` prefix override file
    /// settings, using `__` as the nesting separator
    /// (e.g. `AUXDATA_JWT__CACHE_SIZE=1024`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file doesn't exist, has an unsupported
    /// extension, or contains invalid configuration.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_prefix(path, "AUXDATA")
    }

    /// Load configuration from a file with a custom environment prefix
    ///
    /// # Errors
    ///
    /// Same as [`AuxDataConfig::from_file`].
    pub fn from_file_with_prefix(
        path: impl AsRef<Path>,
        env_prefix: &str,
    ) -> Result<Self, ConfigError> {
        use config::{Config, File, FileFormat};

        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let format = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => FileFormat::Toml,
            Some("yaml") | Some("yml") => FileFormat::Yaml,
            Some("json") => FileFormat::Json,
            _ => return Err(ConfigError::UnsupportedFormat),
        };

        let config = Config::builder()
            .add_source(File::new(
                path.to_str().ok_or(ConfigError::UnsupportedFormat)?,
                format,
            ))
            .add_source(
                config::Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let conf: AuxDataConfig = config.try_deserialize()?;
        if let Some(jwt) = &conf.jwt {
            jwt.validate()?;
        }
        Ok(conf)
    }
}
