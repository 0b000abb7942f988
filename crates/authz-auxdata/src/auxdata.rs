//! Auxiliary data facade
//!
//! [`AuxData`] is what the policy decision service holds: it takes the
//! auxiliary part of an incoming request and returns the data the policy
//! evaluator sees. JWTs are currently the only kind of auxiliary data.

use serde::{Deserialize, Serialize};

use crate::config::{AuxDataConfig, ConfigError};
use crate::context::RequestContext;
use crate::error::Result;
use crate::jwt::JwtExtractor;
use crate::value::Claims;

/// Auxiliary data supplied with a request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxDataRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<AuxJwt>,
}

/// A bearer token and the keyset that should verify it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxJwt {
    pub token: String,
    /// Empty selects the only configured keyset
    #[serde(default)]
    pub key_set_id: String,
}

impl AuxJwt {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            key_set_id: String::new(),
        }
    }

    pub fn with_key_set_id(mut self, key_set_id: impl Into<String>) -> Self {
        self.key_set_id = key_set_id.into();
        self
    }
}

impl AuxDataRequest {
    pub fn jwt(jwt: AuxJwt) -> Self {
        Self { jwt: Some(jwt) }
    }
}

/// Auxiliary data handed to the policy evaluator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedAuxData {
    /// Claims of the request's JWT; empty when none was supplied
    #[serde(default)]
    pub jwt: Claims,
}

/// Extracts auxiliary data from requests
#[derive(Debug)]
pub struct AuxData {
    jwt: JwtExtractor,
}

impl AuxData {
    /// Build from configuration
    ///
    /// Without a `jwt` section tokens are still verified, but no keyset
    /// exists to verify them with and no cache is kept.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the JWT configuration is invalid.
    pub fn new(config: &AuxDataConfig) -> std::result::Result<Self, ConfigError> {
        let jwt = match &config.jwt {
            Some(jwt) => JwtExtractor::new(jwt)?,
            None => JwtExtractor::builder().cache_size(0).build(),
        };
        Ok(Self { jwt })
    }

    pub fn from_extractor(jwt: JwtExtractor) -> Self {
        Self { jwt }
    }

    /// Extract auxiliary data from `request`
    ///
    /// # Errors
    ///
    /// Returns the [`AuxDataError`](crate::AuxDataError) of the failing
    /// extraction; nothing is returned partially.
    pub async fn extract(
        &self,
        cx: &RequestContext,
        request: &AuxDataRequest,
    ) -> Result<ExtractedAuxData> {
        let Some(jwt) = &request.jwt else {
            return Ok(ExtractedAuxData::default());
        };

        let claims = self
            .jwt
            .extract(cx, &jwt.token, &jwt.key_set_id)
            .await?
            .unwrap_or_default();

        Ok(ExtractedAuxData { jwt: claims })
    }

    pub fn jwt(&self) -> &JwtExtractor {
        &self.jwt
    }

    /// Stop background work (remote keyset refreshing)
    pub async fn shutdown(&self) {
        self.jwt.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuxDataError;

    #[tokio::test]
    async fn test_empty_request() {
        let aux = AuxData::new(&AuxDataConfig::default()).unwrap();
        let cx = RequestContext::new();

        let out = aux.extract(&cx, &AuxDataRequest::default()).await.unwrap();
        assert!(out.jwt.is_empty());

        let out = aux
            .extract(&cx, &AuxDataRequest::jwt(AuxJwt::new("")))
            .await
            .unwrap();
        assert!(out.jwt.is_empty());
    }

    #[tokio::test]
    async fn test_no_jwt_section_has_no_keyset() {
        let aux = AuxData::new(&AuxDataConfig::default()).unwrap();
        assert!(aux.jwt().cache().is_none());

        let err = aux
            .extract(
                &RequestContext::new(),
                &AuxDataRequest::jwt(AuxJwt::new("a.b.c")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuxDataError::NoKeySetToVerify));
    }

    #[test]
    fn test_request_deserialize() {
        let req: AuxDataRequest =
            serde_json::from_str(r#"{"jwt": {"token": "a.b.c", "key_set_id": "ks1"}}"#).unwrap();
        assert_eq!(
            req,
            AuxDataRequest::jwt(AuxJwt::new("a.b.c").with_key_set_id("ks1"))
        );

        let req: AuxDataRequest = serde_json::from_str(r#"{"jwt": {"token": "t"}}"#).unwrap();
        assert_eq!(req.jwt.unwrap().key_set_id, "");
    }
}
