//! Token lifecycle: issue, validate, refresh, revoke.
//!
//! Tokens are compact JWS signed with the [`KeyManager`]'s active key. The
//! header carries the `kid`, so validation picks the verification key
//! directly; keys that have left their overlap window are unknown and every
//! token they signed is rejected with [`TokenError::UnknownSigningKey`].

pub mod claims;
pub mod revocation;
pub(crate) mod verify;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::Header;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub use claims::{Claims, TokenPair, TokenType, UserIdentity, normalize_roles};
pub use revocation::{InMemoryRevocationStore, RevocationRecord, RevocationStore, spawn_reaper};

use crate::audit::{self, AuditEvent};
use crate::clock::{Clock, delta};
use crate::config::TokensConfig;
use crate::error::StorageError;
use crate::keys::{KeyHandle, KeyManager};
use crate::rbac::{RbacError, RbacStore};
use crate::server::auth::{TokenVerifier, VerifyOutcome};

/// Why a token was rejected.
///
/// At the HTTP boundary every variant collapses into an opaque `401`; the
/// variant is only logged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Not a well-formed token, missing `kid`, wrong issuer or claim shape
    #[error("invalid token format")]
    InvalidTokenFormat,

    /// Signature did not verify against the key named by `kid`
    #[error("token signature invalid")]
    SignatureInvalid,

    /// `exp` is not in the future
    #[error("token expired")]
    TokenExpired,

    /// The token's `jti` was revoked
    #[error("token revoked")]
    TokenRevoked,

    /// `kid` names no active or retiring key
    #[error("unknown signing key")]
    UnknownSigningKey,

    /// Verification keys could not be obtained from the issuer
    #[error("verification keys unavailable")]
    KeyFetchFailure,

    /// An access token was presented where a refresh token is required (or
    /// the other way round)
    #[error("wrong token type")]
    WrongTokenType,

    /// Signing failed
    #[error("token signing failed: {0}")]
    Signing(String),

    /// Revocation or RBAC store failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl TokenError {
    /// Stable name for logs and audit events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTokenFormat => "InvalidTokenFormat",
            Self::SignatureInvalid => "SignatureInvalid",
            Self::TokenExpired => "TokenExpired",
            Self::TokenRevoked => "TokenRevoked",
            Self::UnknownSigningKey => "UnknownSigningKey",
            Self::KeyFetchFailure => "KeyFetchFailure",
            Self::WrongTokenType => "WrongTokenType",
            Self::Signing(_) => "Signing",
            Self::Storage(_) => "Storage",
        }
    }
}

impl From<StorageError> for TokenError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<RbacError> for TokenError {
    fn from(e: RbacError) -> Self {
        Self::Storage(e.to_string())
    }
}

/// A signed pair that has not been counted or audited yet.
struct SignedPair {
    pair: TokenPair,
    access_jti: String,
    refresh_jti: String,
    kid: String,
}

/// Issues and checks tokens.
pub struct TokenService {
    keys: Arc<KeyManager>,
    revocations: Arc<dyn RevocationStore>,
    rbac: Arc<dyn RbacStore>,
    clock: Arc<dyn Clock>,
    config: TokensConfig,
}

impl TokenService {
    /// Create a token service.
    pub fn new(
        keys: Arc<KeyManager>,
        revocations: Arc<dyn RevocationStore>,
        rbac: Arc<dyn RbacStore>,
        clock: Arc<dyn Clock>,
        config: TokensConfig,
    ) -> Self {
        Self {
            keys,
            revocations,
            rbac,
            clock,
            config,
        }
    }

    /// The key manager this service signs with.
    #[must_use]
    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// The RBAC store roles are read from.
    #[must_use]
    pub fn rbac(&self) -> &Arc<dyn RbacStore> {
        &self.rbac
    }

    /// Sign an access + refresh pair for `user` carrying `roles`.
    ///
    /// Roles are de-duplicated, keeping first-occurrence order.
    pub fn issue_token_pair(
        &self,
        user: &UserIdentity,
        roles: &[String],
    ) -> Result<TokenPair, TokenError> {
        let signer = self.keys.signer();
        let roles = normalize_roles(roles.iter().cloned());
        let signed = self.sign_pair(&signer, user, &roles)?;
        self.commit(&signer, &user.id.to_string(), &roles, &signed);
        Ok(signed.pair)
    }

    /// Sign a pair for `user` with their current roles from the RBAC store.
    pub async fn issue_for_user(&self, user: &UserIdentity) -> Result<TokenPair, TokenError> {
        let roles = self.rbac.user_role_names(user.id).await?;
        self.issue_token_pair(user, &roles)
    }

    /// Verify signature, expiry and revocation status of `token`.
    pub async fn validate_token(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = self.verify_signature(token)?;
        verify::check_expiry(&claims, self.clock.now())?;
        if self.revocations.is_revoked(&claims.jti).await? {
            return Err(TokenError::TokenRevoked);
        }
        Ok(claims)
    }

    /// Exchange a refresh token for a new pair.
    ///
    /// The new pair carries the user's roles as they are now, not the roles
    /// in the presented token. The old refresh token is revoked in the same
    /// step that succeeds, so presenting it twice yields one new pair and
    /// one [`TokenError::TokenRevoked`]. Nothing is changed on failure.
    pub async fn refresh_token(&self, refresh: &str) -> Result<TokenPair, TokenError> {
        let claims = self.validate_token(refresh).await?;
        if claims.typ != TokenType::Refresh {
            return Err(TokenError::WrongTokenType);
        }
        let user = UserIdentity {
            id: claims.user_id().ok_or(TokenError::InvalidTokenFormat)?,
            email: claims.email.clone(),
        };
        let roles = self.rbac.user_role_names(user.id).await?;

        let signer = self.keys.signer();
        let signed = self.sign_pair(&signer, &user, &roles)?;

        let record = RevocationRecord {
            jti: claims.jti.clone(),
            revoked_at: self.clock.now(),
            natural_expiry: claims.expires_at(),
        };
        if !self.revocations.revoke(record).await? {
            // Lost a race with a concurrent refresh or logout
            return Err(TokenError::TokenRevoked);
        }

        self.commit(&signer, &claims.sub, &roles, &signed);
        audit::emit(&AuditEvent::token_refreshed(
            &claims.sub,
            &claims.jti,
            &signed.refresh_jti,
        ));
        Ok(signed.pair)
    }

    /// Revoke `token` until its natural expiry. Idempotent.
    ///
    /// The signature must verify against a known key. An already expired
    /// token is accepted and nothing is recorded.
    pub async fn revoke_token(&self, token: &str) -> Result<(), TokenError> {
        self.revoke_tokens(&[token]).await
    }

    /// Revoke several tokens. Every signature is checked before anything is
    /// revoked, so a bad token leaves the others untouched.
    pub async fn revoke_tokens(&self, tokens: &[&str]) -> Result<(), TokenError> {
        let verified = tokens
            .iter()
            .map(|token| self.verify_signature(token))
            .collect::<Result<Vec<_>, _>>()?;
        for claims in verified {
            self.revoke_claims(&claims).await?;
        }
        Ok(())
    }

    async fn revoke_claims(&self, claims: &Claims) -> Result<(), TokenError> {
        let now = self.clock.now();
        if verify::check_expiry(claims, now).is_err() {
            debug!(jti = %claims.jti, "Revoking expired token is a no-op");
            return Ok(());
        }

        let record = RevocationRecord {
            jti: claims.jti.clone(),
            revoked_at: now,
            natural_expiry: claims.expires_at(),
        };
        if self.revocations.revoke(record).await? {
            audit::emit(&AuditEvent::token_revoked(&claims.sub, &claims.jti));
        }
        Ok(())
    }

    fn verify_signature(&self, token: &str) -> Result<Claims, TokenError> {
        let kid = verify::header_kid(token)?;
        let handle = self
            .keys
            .verification_key(&kid)
            .ok_or(TokenError::UnknownSigningKey)?;
        verify::decode_claims(
            token,
            &kid,
            handle.algorithm(),
            handle.decoding(),
            Some(&self.config.issuer),
        )
    }

    fn sign_pair(
        &self,
        signer: &KeyHandle,
        user: &UserIdentity,
        roles: &[String],
    ) -> Result<SignedPair, TokenError> {
        let now = self.clock.now();
        let access_exp = expiry(now, self.config.access_ttl);
        let refresh_exp = expiry(now, self.config.refresh_ttl);

        let access_jti = Uuid::new_v4().to_string();
        let refresh_jti = Uuid::new_v4().to_string();

        let access = self.sign(signer, user, roles, TokenType::Access, now, access_exp, &access_jti)?;
        let refresh =
            self.sign(signer, user, roles, TokenType::Refresh, now, refresh_exp, &refresh_jti)?;

        Ok(SignedPair {
            pair: TokenPair {
                access_token: access,
                refresh_token: refresh,
                token_type: "Bearer".to_string(),
                expires_in: self.config.access_ttl.as_secs(),
                access_expires_at: access_exp,
                refresh_expires_at: refresh_exp,
            },
            access_jti,
            refresh_jti,
            kid: signer.kid().to_string(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn sign(
        &self,
        signer: &KeyHandle,
        user: &UserIdentity,
        roles: &[String],
        typ: TokenType,
        now: DateTime<Utc>,
        exp: DateTime<Utc>,
        jti: &str,
    ) -> Result<String, TokenError> {
        let encoding = signer
            .encoding()
            .ok_or_else(|| TokenError::Signing(format!("key {} cannot sign", signer.kid())))?;

        let claims = Claims {
            sub: user.id.to_string(),
            email: user.email.clone(),
            roles: roles.to_vec(),
            typ,
            iat: now.timestamp(),
            exp: exp.timestamp(),
            jti: jti.to_string(),
            iss: self.config.issuer.clone(),
            kid: signer.kid().to_string(),
        };
        let mut header = Header::new(signer.algorithm().jwt_algorithm());
        header.kid = Some(signer.kid().to_string());

        jsonwebtoken::encode(&header, &claims, encoding).map_err(|e| TokenError::Signing(e.to_string()))
    }

    /// Count both tokens against the signing key and audit the issuance.
    fn commit(&self, signer: &KeyHandle, subject: &str, roles: &[String], signed: &SignedPair) {
        self.keys.record_issuance(signer);
        self.keys.record_issuance(signer);
        audit::emit(&AuditEvent::token_issued(
            subject,
            &signed.access_jti,
            &signed.kid,
            roles,
        ));
        debug!(
            sub = %subject,
            kid = %signed.kid,
            access_jti = %signed.access_jti,
            refresh_jti = %signed.refresh_jti,
            "Issued token pair"
        );
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now.checked_add_signed(delta(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait::async_trait]
impl TokenVerifier for TokenService {
    async fn verify(&self, token: &str) -> Result<VerifyOutcome, TokenError> {
        let claims = self.validate_token(token).await?;
        if claims.typ != TokenType::Access {
            return Err(TokenError::WrongTokenType);
        }
        Ok(VerifyOutcome::Verified(claims))
    }
}
