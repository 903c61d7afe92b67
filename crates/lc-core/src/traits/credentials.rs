//! Credential traits

use async_trait::async_trait;

use crate::error::{CredentialError, LoginError};
use crate::types::Origin;

/// Persistent storage for the access token of one origin
///
/// At most one credential is stored per origin. Implementations must be
/// safe to call from multiple tasks.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the stored credential, if any
    async fn get(&self, origin: &Origin) -> Result<Option<String>, CredentialError>;

    /// Store (or replace) the credential
    async fn set(&self, origin: &Origin, credential: &str) -> Result<(), CredentialError>;

    /// Remove the credential; removing a missing entry is not an error
    async fn delete(&self, origin: &Origin) -> Result<(), CredentialError>;
}

/// Interactive flow that obtains a fresh credential from the user
#[async_trait]
pub trait LoginFlow: Send + Sync {
    /// Run the flow to completion and return the new access token
    async fn login(&self, origin: &Origin) -> Result<String, LoginError>;
}
