//! Signature and claim checks shared by the issuing service and remote verifiers.

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{DecodingKey, Validation};

use super::{Claims, TokenError};
use crate::keys::KeyAlgorithm;

/// Read the `kid` from an unverified token header.
pub(crate) fn header_kid(token: &str) -> Result<String, TokenError> {
    let header = jsonwebtoken::decode_header(token).map_err(|_| TokenError::InvalidTokenFormat)?;
    header.kid.ok_or(TokenError::InvalidTokenFormat)
}

/// Verify the signature of `token` with `key` and decode its claims.
///
/// Expiry is not checked here: callers compare `exp` against their own clock
/// with [`check_expiry`]. The `kid` claim must match the header `kid` the key
/// was selected by.
pub(crate) fn decode_claims(
    token: &str,
    kid: &str,
    algorithm: KeyAlgorithm,
    key: &DecodingKey,
    issuer: Option<&str>,
) -> Result<Claims, TokenError> {
    let validation = build_validation(algorithm, issuer);

    let data = jsonwebtoken::decode::<Claims>(token, key, &validation).map_err(|e| {
        match e.kind() {
            ErrorKind::InvalidSignature => TokenError::SignatureInvalid,
            _ => TokenError::InvalidTokenFormat,
        }
    })?;

    if data.claims.kid != kid {
        return Err(TokenError::InvalidTokenFormat);
    }
    Ok(data.claims)
}

/// `exp` must be strictly after `now`.
pub(crate) fn check_expiry(claims: &Claims, now: DateTime<Utc>) -> Result<(), TokenError> {
    if claims.exp > now.timestamp() {
        Ok(())
    } else {
        Err(TokenError::TokenExpired)
    }
}

fn build_validation(algorithm: KeyAlgorithm, issuer: Option<&str>) -> Validation {
    let mut v = Validation::new(algorithm.jwt_algorithm());
    v.validate_exp = false;
    v.validate_nbf = false;
    v.validate_aud = false;
    v.leeway = 0;
    match issuer {
        Some(iss) => {
            v.set_issuer(&[iss]);
            v.set_required_spec_claims(&["exp", "sub", "iss"]);
        }
        None => v.set_required_spec_claims(&["exp", "sub"]),
    }
    v
}
