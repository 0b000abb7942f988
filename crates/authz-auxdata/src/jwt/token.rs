//! Compact JWT parsing and validation
//!
//! [`ParsedToken::parse`] checks the structure and decodes the header and
//! payload without touching any key. Signature verification
//! ([`ParsedToken::verify_signature`]) and time-claim validation
//! ([`ParsedToken::validate_time`]) are separate steps so the extractor can
//! skip the former on a cache hit while always running the latter.

use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, Validation};
use serde_json::{Map, Value as JsonValue};

use super::keys::KeyMaterial;
use crate::error::{AuxDataError, Result};

/// JOSE header fields the extractor relies on
///
/// `alg` is kept as written; it is only interpreted when the signature is
/// verified, so unsigned (`none`) tokens parse when verification is off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHeader {
    /// Signature algorithm as named in the token, e.g. `RS256` or `none`
    pub alg: String,
    pub kid: Option<String>,
}

/// A structurally valid compact JWT whose signature is not yet checked
#[derive(Debug, Clone)]
pub struct ParsedToken<'a> {
    raw: &'a str,
    header: TokenHeader,
    claims: Map<String, JsonValue>,
    expires_at: Option<f64>,
    not_before: Option<f64>,
    issued_at: Option<f64>,
}

impl<'a> ParsedToken<'a> {
    /// Parse `raw` as `header.payload.signature`
    ///
    /// # Errors
    ///
    /// Returns [`AuxDataError::TokenParse`] when the token does not have three
    /// segments, the header is not a JSON object with a string `alg`, the
    /// payload is not a base64url JSON object, or a time claim is not numeric.
    pub fn parse(raw: &'a str) -> Result<Self> {
        let mut segments = raw.split('.');
        let (Some(header), Some(payload), Some(_), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(AuxDataError::TokenParse(
                "token must have exactly three segments".to_string(),
            ));
        };

        let header = parse_header(&decode_object(header, "header")?)?;
        let claims = decode_object(payload, "payload")?;

        Ok(Self {
            expires_at: numeric_date(&claims, "exp")?,
            not_before: numeric_date(&claims, "nbf")?,
            issued_at: numeric_date(&claims, "iat")?,
            raw,
            header,
            claims,
        })
    }

    pub fn header(&self) -> &TokenHeader {
        &self.header
    }

    pub fn claims(&self) -> &Map<String, JsonValue> {
        &self.claims
    }

    pub fn into_claims(self) -> Map<String, JsonValue> {
        self.claims
    }

    /// The `exp` claim as seconds since the epoch
    pub fn expires_at(&self) -> Option<f64> {
        self.expires_at
    }

    /// Verify the signature with the first matching key of `material`
    ///
    /// # Errors
    ///
    /// Returns [`AuxDataError::TokenValidation`] when no key is eligible for
    /// the header's `kid` and `alg`, the token is unsigned (`alg: none`), or
    /// none of the eligible keys verifies.
    pub fn verify_signature(&self, material: &KeyMaterial) -> Result<()> {
        if self.header.alg.eq_ignore_ascii_case("none") {
            return Err(AuxDataError::TokenValidation(
                "unsigned token cannot be verified".to_string(),
            ));
        }
        let alg = Algorithm::from_str(&self.header.alg).map_err(|_| {
            AuxDataError::TokenValidation(format!("unsupported algorithm {}", self.header.alg))
        })?;
        let kid = self.header.kid.as_deref();

        let candidates = material.candidates(kid, alg);
        if candidates.is_empty() {
            return Err(AuxDataError::TokenValidation(format!(
                "no key matches kid {kid:?} and algorithm {alg:?}"
            )));
        }

        // Time claims are checked by validate_time for every mode.
        let mut validation = Validation::new(alg);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let mut last_error = None;
        for key in candidates {
            match jsonwebtoken::decode::<JsonValue>(self.raw, key.decoding_key(), &validation) {
                Ok(_) => return Ok(()),
                Err(e) => last_error = Some(e),
            }
        }

        Err(AuxDataError::TokenValidation(match last_error {
            Some(e) => format!("signature verification failed: {e}"),
            None => "signature verification failed".to_string(),
        }))
    }

    /// Check `exp`, `nbf` and `iat` against `now`, allowing `skew` either way
    ///
    /// # Errors
    ///
    /// Returns [`AuxDataError::TokenValidation`] when the token is expired, not
    /// yet valid, or issued in the future.
    pub fn validate_time(&self, now: SystemTime, skew: Duration) -> Result<()> {
        let now = epoch_seconds(now);
        let skew = skew.as_secs_f64();

        if let Some(exp) = self.expires_at
            && now >= exp + skew
        {
            return Err(AuxDataError::TokenValidation("token is expired".to_string()));
        }
        if let Some(nbf) = self.not_before
            && now + skew < nbf
        {
            return Err(AuxDataError::TokenValidation(
                "token is not valid yet".to_string(),
            ));
        }
        if let Some(iat) = self.issued_at
            && now + skew < iat
        {
            return Err(AuxDataError::TokenValidation(
                "token used before issued".to_string(),
            ));
        }
        Ok(())
    }

    /// Remaining validity at `now`, or `None` without an `exp` claim
    pub fn remaining_validity(&self, now: SystemTime) -> Option<Duration> {
        let exp = self.expires_at?;
        let remaining = exp - epoch_seconds(now);
        Some(if remaining > 0.0 {
            Duration::try_from_secs_f64(remaining).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        })
    }
}

/// Decode a base64url segment holding a JSON object
fn decode_object(segment: &str, what: &str) -> Result<Map<String, JsonValue>> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| AuxDataError::TokenParse(format!("{what} is not base64url: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AuxDataError::TokenParse(format!("{what} is not a JSON object: {e}")))
}

fn parse_header(fields: &Map<String, JsonValue>) -> Result<TokenHeader> {
    let Some(JsonValue::String(alg)) = fields.get("alg") else {
        return Err(AuxDataError::TokenParse(
            "header must carry a string 'alg'".to_string(),
        ));
    };
    let kid = match fields.get("kid") {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(kid)) => Some(kid.clone()),
        Some(_) => {
            return Err(AuxDataError::TokenParse(
                "header 'kid' must be a string".to_string(),
            ));
        }
    };
    Ok(TokenHeader {
        alg: alg.clone(),
        kid,
    })
}

fn numeric_date(claims: &Map<String, JsonValue>, name: &str) -> Result<Option<f64>> {
    match claims.get(name) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Number(n)) => n
            .as_f64()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| AuxDataError::TokenParse(format!("claim '{name}' is out of range"))),
        Some(_) => Err(AuxDataError::TokenParse(format!(
            "claim '{name}' must be a number"
        ))),
    }
}

fn epoch_seconds(at: SystemTime) -> f64 {
    match at.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}
