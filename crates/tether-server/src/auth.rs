//! Bearer token verification.
//!
//! The relay only needs to know which account a token belongs to. Verifiers
//! are injected into the server state so tests and deployments can swap them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tether_core::ids::AccountId;

use crate::config::{AuthConfig, ConfigError};

/// Identity extracted from a valid token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedToken {
    pub account_id: AccountId,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("token has expired")]
    Expired,
    #[error("token rejected: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedToken, AuthError>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// HS256 JWT verifier. `sub` names the account; `exp` is mandatory.
pub struct JwtTokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtTokenVerifier {
    pub fn new(secret: &SecretString, issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }
        Self {
            key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl TokenVerifier for JwtTokenVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedToken, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|err| {
            match err.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidSignature => AuthError::Invalid("bad signature".into()),
                ErrorKind::InvalidIssuer => AuthError::Invalid("unexpected issuer".into()),
                ErrorKind::MissingRequiredClaim(claim) => {
                    AuthError::Invalid(format!("missing claim {claim}"))
                }
                other => AuthError::Invalid(format!("{other:?}")),
            }
        })?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::Invalid("empty subject".into()));
        }
        Ok(VerifiedToken {
            account_id: AccountId::from_raw(data.claims.sub),
        })
    }
}

/// Fixed token table, for development setups and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, AccountId>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, account: impl Into<String>) -> Self {
        let _ = self
            .tokens
            .insert(token.into(), AccountId::from_raw(account.into()));
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedToken, AuthError> {
        self.tokens
            .get(token)
            .map(|account_id| VerifiedToken {
                account_id: account_id.clone(),
            })
            .ok_or_else(|| AuthError::Invalid("unknown token".into()))
    }
}

/// Tries each verifier in order; the first success wins.
pub struct ChainVerifier {
    verifiers: Vec<Arc<dyn TokenVerifier>>,
}

#[async_trait]
impl TokenVerifier for ChainVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedToken, AuthError> {
        let mut last = AuthError::Invalid("no verifier configured".into());
        for verifier in &self.verifiers {
            match verifier.verify(token).await {
                Ok(verified) => return Ok(verified),
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

/// Build the verifier described by `config`.
pub fn verifier_from_config(config: &AuthConfig) -> Result<Arc<dyn TokenVerifier>, ConfigError> {
    let mut verifiers: Vec<Arc<dyn TokenVerifier>> = Vec::new();
    if !config.static_tokens.is_empty() {
        let table = config
            .static_tokens
            .iter()
            .fold(StaticTokenVerifier::new(), |v, (token, account)| {
                v.with_token(token.clone(), account.clone())
            });
        verifiers.push(Arc::new(table));
    }
    if let Some(secret) = &config.jwt_secret {
        verifiers.push(Arc::new(JwtTokenVerifier::new(secret, config.issuer.as_deref())));
    }
    match verifiers.len() {
        0 => Err(ConfigError::Invalid(
            "auth requires a jwt_secret or at least one static token".into(),
        )),
        1 => Ok(verifiers.remove(0)),
        _ => Ok(Arc::new(ChainVerifier { verifiers })),
    }
}
