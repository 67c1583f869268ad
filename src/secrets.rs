use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::errors::AppResult;

pub const SESSION_TOKEN_ALIAS: &str = "mobzi_token";

/// Holds the backend bearer token, in the OS keychain or in process memory.
/// Clones share the same store.
#[derive(Clone)]
pub struct SecretVault {
    store: TokenStore,
}

#[derive(Clone)]
enum TokenStore {
    Keychain { service: String },
    Process(Arc<Mutex<HashMap<String, SecretString>>>),
}

impl TokenStore {
    fn label(&self) -> &str {
        match self {
            TokenStore::Keychain { service } => service.as_str(),
            TokenStore::Process(_) => "process",
        }
    }
}

impl SecretVault {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            store: TokenStore::Keychain {
                service: service_name.into(),
            },
        }
    }

    /// Nothing leaves the process. Used headless and in tests.
    pub fn in_memory() -> Self {
        Self {
            store: TokenStore::Process(Arc::default()),
        }
    }

    pub fn read_secret(&self, account: &str) -> AppResult<Option<SecretString>> {
        match &self.store {
            TokenStore::Keychain { service } => {
                match keyring::Entry::new(service, account)?.get_password() {
                    Ok(value) => Ok(Some(SecretString::from(value))),
                    Err(keyring::Error::NoEntry) => Ok(None),
                    Err(err) => Err(err.into()),
                }
            }
            TokenStore::Process(map) => Ok(map.lock().get(account).cloned()),
        }
    }

    pub fn write_secret(&self, account: &str, secret: &SecretString) -> AppResult<()> {
        match &self.store {
            TokenStore::Keychain { service } => {
                keyring::Entry::new(service, account)?.set_password(secret.expose_secret())?
            }
            TokenStore::Process(map) => {
                map.lock().insert(account.to_string(), secret.clone());
            }
        }
        info!(target: "secret_vault", store = self.store.label(), account, "secret saved");
        Ok(())
    }

    /// Deleting an absent secret is not an error.
    pub fn delete(&self, account: &str) -> AppResult<()> {
        match &self.store {
            TokenStore::Keychain { service } => {
                match keyring::Entry::new(service, account)?.delete_password() {
                    Ok(()) | Err(keyring::Error::NoEntry) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            TokenStore::Process(map) => {
                map.lock().remove(account);
            }
        }
        debug!(target: "secret_vault", store = self.store.label(), account, "secret removed");
        Ok(())
    }

    pub fn has(&self, account: &str) -> AppResult<bool> {
        Ok(self.read_secret(account)?.is_some())
    }

    pub fn session_token(&self) -> AppResult<Option<SecretString>> {
        self.read_secret(SESSION_TOKEN_ALIAS)
    }

    pub fn store_session_token(&self, token: impl Into<String>) -> AppResult<()> {
        self.write_secret(SESSION_TOKEN_ALIAS, &SecretString::from(token.into()))
    }

    pub fn clear_session_token(&self) -> AppResult<()> {
        self.delete(SESSION_TOKEN_ALIAS)
    }
}
