//! Credential stores
//!
//! [`KeyringStore`] keeps one access token per origin in the OS keyring,
//! under the entry `<service>/<origin>`. [`MemoryCredentialStore`] keeps
//! tokens for the lifetime of the process and backs `--mock-keyring`.

use std::collections::HashMap;

use async_trait::async_trait;
use keyring::Entry;
use parking_lot::Mutex;

use lc_core::{CredentialError, CredentialStore, Origin};

/// Keyring service the tokens are stored under
pub const DEFAULT_SERVICE: &str = "gitpod-io";

fn map_keyring_error(err: keyring::Error) -> CredentialError {
    match err {
        keyring::Error::NoStorageAccess(inner) => CredentialError::Locked(inner.to_string()),
        other => CredentialError::Backend(other.to_string()),
    }
}

/// OS keyring backed credential store
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE)
    }
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    /// Run a blocking keyring operation off the runtime threads
    async fn with_entry<T, F>(&self, origin: &Origin, op: F) -> Result<T, CredentialError>
    where
        T: Send + 'static,
        F: FnOnce(Entry) -> Result<T, keyring::Error> + Send + 'static,
    {
        let service = self.service.clone();
        let user = origin.as_str().to_string();
        tokio::task::spawn_blocking(move || {
            let entry = Entry::new(&service, &user)?;
            op(entry)
        })
        .await
        .map_err(|e| CredentialError::Backend(format!("keyring task failed: {}", e)))?
        .map_err(map_keyring_error)
    }
}

#[async_trait]
impl CredentialStore for KeyringStore {
    async fn get(&self, origin: &Origin) -> Result<Option<String>, CredentialError> {
        self.with_entry(origin, |entry| match entry.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e),
        })
        .await
    }

    async fn set(&self, origin: &Origin, credential: &str) -> Result<(), CredentialError> {
        let credential = credential.to_string();
        self.with_entry(origin, move |entry| entry.set_password(&credential))
            .await?;
        tracing::debug!(%origin, "Stored credential in keyring");
        Ok(())
    }

    async fn delete(&self, origin: &Origin) -> Result<(), CredentialError> {
        self.with_entry(origin, |entry| match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e),
        })
        .await?;
        tracing::debug!(%origin, "Removed credential from keyring");
        Ok(())
    }
}

/// In-process credential store
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    tokens: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, origin: &Origin) -> Result<Option<String>, CredentialError> {
        Ok(self.tokens.lock().get(origin.as_str()).cloned())
    }

    async fn set(&self, origin: &Origin, credential: &str) -> Result<(), CredentialError> {
        self.tokens
            .lock()
            .insert(origin.as_str().to_string(), credential.to_string());
        Ok(())
    }

    async fn delete(&self, origin: &Origin) -> Result<(), CredentialError> {
        self.tokens.lock().remove(origin.as_str());
        Ok(())
    }
}
