//! # Authz AuxData - Auxiliary Identity Extraction
//!
//! Resolves, verifies and extracts the claims of bearer tokens supplied with
//! authorization requests, so the policy evaluator can reason about them.
//!
//! ## Key Features
//!
//! - **Keyset registry** - Named keysets, local (inline or file, JWK or PEM)
//!   and remote (JWKS endpoints)
//! - **Shared refresher** - One background task keeps every remote keyset
//!   fresh; requests never wait on it once a keyset has been fetched
//! - **Verification cache** - Skips repeated signature checks for the same
//!   token while always re-checking `exp`/`nbf`/`iat`
//! - **Failure isolation** - A misconfigured keyset fails the requests that
//!   use it, never process start; an odd claim is dropped, not fatal
//! - **Cancellation** - Every keyset fetch on the request path honours the
//!   caller's [`RequestContext`]
//!
//! ## Architecture
//!
//! - [`config`] - Configuration types and file loading
//! - [`auxdata`] - The [`AuxData`] facade used by the decision service
//! - [`jwt`] - Keysets, refresher, verification cache and the extractor
//! - [`value`] - Generic value model for extracted claims
//! - [`context`] - Per-request cancellation and deadline
//! - [`metrics`] - Cache and refresh metrics
//!
//! ## Quick Start
//!
//! ```no_run
//! use authz_auxdata::{AuxData, AuxDataConfig, AuxDataRequest, AuxJwt, RequestContext};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AuxDataConfig::from_file("auxdata.yaml")?;
//! let aux = AuxData::new(&config)?;
//!
//! let request = AuxDataRequest::jwt(AuxJwt::new("eyJhbGciOi...").with_key_set_id("ks1"));
//! let extracted = aux.extract(&RequestContext::new(), &request).await?;
//! println!("sub = {:?}", extracted.jwt.get("sub"));
//!
//! aux.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `metrics` (default) - Record cache and refresh metrics through the
//!   `metrics` facade

pub mod auxdata;
pub mod config;
pub mod context;
pub mod error;
pub mod jwt;
pub mod metrics;
pub mod value;

#[doc(inline)]
pub use auxdata::{AuxData, AuxDataRequest, AuxJwt, ExtractedAuxData};
#[doc(inline)]
pub use config::{AuxDataConfig, ConfigError, JwtConfig, KeySetConfig, LocalSource, RemoteSource};
#[doc(inline)]
pub use context::RequestContext;
#[doc(inline)]
pub use error::{AuxDataError, KeyError, Result, Stage};
pub use jwt::{JwksRefresher, JwtExtractor, KeySetRegistry};
pub use crate::metrics::init_auxdata_metrics;
pub use value::{Claims, JsonValueConverter, Value, ValueConverter};
