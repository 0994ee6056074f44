//! Identity verification seam
//!
//! Token issuance and account management belong to the external auth
//! service. The gateway only needs to turn a presented token into a user
//! identity, so that is the whole trait.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{GatewayError, GatewayResult};

/// Identity attached to a verified connection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    pub display_name: Option<String>,
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync + std::fmt::Debug {
    /// Resolve a presented token to a user identity.
    async fn verify(&self, token: &str) -> GatewayResult<UserIdentity>;
}

/// Verifier for tokens of the form `<user_id>:<secret>` where the secret is
/// shared with the external auth service at deploy time.
#[derive(Debug, Clone)]
pub struct SharedSecretVerifier {
    secret: String,
}

impl SharedSecretVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Read the shared secret from the named environment variable.
    pub fn from_env(var_name: &str) -> GatewayResult<Self> {
        let secret = std::env::var(var_name)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                GatewayError::Config(format!("Missing shared secret env var {}", var_name))
            })?;
        Ok(Self::new(secret))
    }
}

#[async_trait]
impl IdentityVerifier for SharedSecretVerifier {
    async fn verify(&self, token: &str) -> GatewayResult<UserIdentity> {
        let Some((user_id, presented)) = token.split_once(':') else {
            return Err(GatewayError::Unauthorized("malformed token".to_string()));
        };
        if user_id.is_empty() || presented != self.secret {
            return Err(GatewayError::Unauthorized("invalid token".to_string()));
        }
        Ok(UserIdentity {
            user_id: user_id.to_string(),
            display_name: None,
        })
    }
}

/// Fixed token-to-user mapping for tests and local development.
#[derive(Debug, Clone, Default)]
pub struct AllowListVerifier {
    tokens: HashMap<String, String>,
}

impl AllowListVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), user_id.into());
        self
    }
}

#[async_trait]
impl IdentityVerifier for AllowListVerifier {
    async fn verify(&self, token: &str) -> GatewayResult<UserIdentity> {
        self.tokens
            .get(token)
            .map(|user_id| UserIdentity {
                user_id: user_id.clone(),
                display_name: None,
            })
            .ok_or_else(|| GatewayError::Unauthorized("unknown token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shared_secret_accepts_valid_token() {
        let verifier = SharedSecretVerifier::new("hunter2");
        let identity = verifier.verify("u-1:hunter2").await.unwrap();
        assert_eq!(identity.user_id, "u-1");
    }

    #[tokio::test]
    async fn test_shared_secret_rejects_bad_secret() {
        let verifier = SharedSecretVerifier::new("hunter2");
        let result = verifier.verify("u-1:wrong").await;
        assert!(matches!(result, Err(GatewayError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_shared_secret_rejects_malformed_token() {
        let verifier = SharedSecretVerifier::new("hunter2");
        assert!(verifier.verify("no-separator").await.is_err());
        assert!(verifier.verify(":hunter2").await.is_err());
    }

    #[tokio::test]
    async fn test_allow_list() {
        let verifier = AllowListVerifier::new().with_token("tok-1", "u-9");
        assert_eq!(verifier.verify("tok-1").await.unwrap().user_id, "u-9");
        assert!(verifier.verify("tok-2").await.is_err());
    }
}
