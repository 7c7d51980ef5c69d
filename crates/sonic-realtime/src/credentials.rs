//! Bearer credentials for authenticating the duplex stream.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

/// Default environment variable consulted by [`EnvCredentialProvider`].
pub const DEFAULT_API_KEY_VAR: &str = "SONIC_API_KEY";

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential variable {0} is not set")]
    Missing(String),
    #[error("credential from {0} is empty")]
    Empty(String),
}

/// Supplies the bearer token presented when a stream is opened.
///
/// Secret retrieval itself (vaults, profile files, role assumption) stays
/// outside this crate; implementations only hand back the resolved secret.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<SecretString, CredentialError>;
}

/// Reads the token from an environment variable on every connect, so a
/// rotated key is picked up by the next reconnect.
#[derive(Debug, Clone)]
pub struct EnvCredentialProvider {
    var: String,
}

impl EnvCredentialProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvCredentialProvider {
    fn default() -> Self {
        Self::new(DEFAULT_API_KEY_VAR)
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn bearer_token(&self) -> Result<SecretString, CredentialError> {
        let value =
            std::env::var(&self.var).map_err(|_| CredentialError::Missing(self.var.clone()))?;
        if value.trim().is_empty() {
            return Err(CredentialError::Empty(self.var.clone()));
        }
        Ok(SecretString::from(value))
    }
}

/// A fixed token, mostly useful for tests and local tooling.
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    token: SecretString,
}

impl StaticCredentialProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn bearer_token(&self) -> Result<SecretString, CredentialError> {
        if self.token.expose_secret().is_empty() {
            return Err(CredentialError::Empty("static credential".to_string()));
        }
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_env_provider_reads_variable() {
        let var = "SONIC_TEST_CREDENTIAL_PRESENT";
        unsafe {
            std::env::set_var(var, "secret-token");
        }
        let token = EnvCredentialProvider::new(var).bearer_token().await.unwrap();
        assert_eq!(token.expose_secret(), "secret-token");
        unsafe {
            std::env::remove_var(var);
        }
    }

    #[tokio::test]
    async fn test_env_provider_missing_and_empty() {
        let missing = EnvCredentialProvider::new("SONIC_TEST_CREDENTIAL_ABSENT")
            .bearer_token()
            .await;
        assert!(matches!(missing, Err(CredentialError::Missing(_))));

        let var = "SONIC_TEST_CREDENTIAL_BLANK";
        unsafe {
            std::env::set_var(var, "   ");
        }
        let empty = EnvCredentialProvider::new(var).bearer_token().await;
        assert!(matches!(empty, Err(CredentialError::Empty(_))));
        unsafe {
            std::env::remove_var(var);
        }
    }

    #[tokio::test]
    async fn test_static_provider() {
        let token = StaticCredentialProvider::new("abc")
            .bearer_token()
            .await
            .unwrap();
        assert_eq!(token.expose_secret(), "abc");
        assert!(StaticCredentialProvider::new("").bearer_token().await.is_err());
    }
}
