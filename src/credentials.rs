//! Credential access seam
//!
//! The engine never stores or refreshes secrets itself; the host
//! application supplies an implementation of [`CredentialProvider`]
//! backed by its own keychain and OAuth flow.

use async_trait::async_trait;

use crate::types::Account;
use crate::Result;

/// Decrypted secrets for one account.
#[derive(Debug, Clone)]
pub enum DecryptedCredentials {
    Password { username: String, password: String },
    OAuth2 { username: String, access_token: String },
}

/// Host-supplied credential backend.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Return a currently valid access token for an OAuth account,
    /// refreshing it first if it is expired or about to expire.
    async fn get_valid_access_token(&self, account: &Account) -> Result<String>;

    /// Decrypt the account's credential blob.
    async fn decrypt_credentials(&self, account: &Account) -> Result<DecryptedCredentials>;
}

/// In-memory provider for tests and examples. Holds plaintext secrets
/// keyed by account id.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    entries: std::collections::HashMap<String, DecryptedCredentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_password(
        mut self,
        account_id: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.entries.insert(
            account_id.into(),
            DecryptedCredentials::Password {
                username: username.into(),
                password: password.into(),
            },
        );
        self
    }

    pub fn with_token(
        mut self,
        account_id: impl Into<String>,
        username: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        self.entries.insert(
            account_id.into(),
            DecryptedCredentials::OAuth2 {
                username: username.into(),
                access_token: token.into(),
            },
        );
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_valid_access_token(&self, account: &Account) -> Result<String> {
        match self.entries.get(&account.id) {
            Some(DecryptedCredentials::OAuth2 { access_token, .. }) => Ok(access_token.clone()),
            Some(_) => Err(crate::MailError::Auth(format!(
                "account {} has no OAuth token",
                account.id
            ))),
            None => Err(crate::MailError::AccountNotFound(account.id.clone())),
        }
    }

    async fn decrypt_credentials(&self, account: &Account) -> Result<DecryptedCredentials> {
        self.entries
            .get(&account.id)
            .cloned()
            .ok_or_else(|| crate::MailError::AccountNotFound(account.id.clone()))
    }
}
