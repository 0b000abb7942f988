//! JWT infrastructure for auxiliary identity extraction
//!
//! # Architecture
//!
//! ```text
//!                 JwtExtractor
//!     cache probe -> keyset -> verify -> claims
//!          |            |          |
//!          v            v          v
//!  VerificationCache  KeySetRegistry  ParsedToken
//!                       |
//!                       v
//!                 JwksRefresher (shared)
//! ```
//!
//! # Modules
//!
//! - `keys` - Key material parsed from JWKs and PEM
//! - `keyset` - Local and remote keysets, and the registry selecting them
//! - `refresh` - Shared background refresher for remote keysets
//! - `cache` - Verification cache keyed by token signature
//! - `token` - Token parsing, signature and time-claim validation
//! - `extractor` - Orchestration

pub mod cache;
pub mod extractor;
pub mod keys;
pub mod keyset;
pub mod refresh;
pub mod token;

pub use cache::{CacheKey, DEFAULT_CACHE_EXPIRY, VerificationCache};
pub use extractor::{JwtExtractor, JwtExtractorBuilder};
pub use keys::{KeyMaterial, VerificationKey};
pub use keyset::{KeySet, KeySetRegistry, LocalKeySet, RemoteKeySet};
pub use refresh::{DEFAULT_REFRESH_INTERVAL, JwksRefresher};
pub use token::{ParsedToken, TokenHeader};
