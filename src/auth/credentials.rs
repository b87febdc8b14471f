//! Credential storage and resolution.
//!
//! Passwords live in the OS keychain, keyed by a fixed service name plus the
//! CDSE username. A missing entry is a normal state (the user has simply not
//! logged in yet), not an error.

use std::io::Write;

use anyhow::{Context, Result};
use keyring::Entry;
use tracing::warn;

const SERVICE_NAME: &str = "cdse-fetch";

pub struct CredentialStore;

impl CredentialStore {
    /// Store the password for a username in the OS keychain
    pub fn store(username: &str, password: &str) -> Result<()> {
        let entry =
            Entry::new(SERVICE_NAME, username).context("Failed to create keyring entry")?;
        entry
            .set_password(password)
            .context("Failed to store password in keychain")?;
        Ok(())
    }

    /// Look up the password for a username; `None` when nothing is stored
    pub fn get(username: &str) -> Option<String> {
        let entry = Entry::new(SERVICE_NAME, username).ok()?;
        entry.get_password().ok()
    }

    /// Remove the stored password for a username, e.g. after a rejected login
    pub fn delete(username: &str) -> Result<()> {
        let entry =
            Entry::new(SERVICE_NAME, username).context("Failed to create keyring entry")?;
        entry
            .delete_credential()
            .context("Failed to delete credential from keychain")?;
        Ok(())
    }
}

/// Resolves a password for a username. The production implementation talks
/// to the keychain and the terminal; tests supply a canned value.
pub trait CredentialResolver {
    fn resolve(&self, username: &str) -> Result<String>;
}

/// Keychain first, masked interactive prompt as fallback. A freshly prompted
/// password is stored so the next resolution is silent.
pub struct StoredOrPromptResolver;

impl CredentialResolver for StoredOrPromptResolver {
    fn resolve(&self, username: &str) -> Result<String> {
        if let Some(password) = CredentialStore::get(username) {
            return Ok(password);
        }
        let password = rpassword::prompt_password(format!("CDSE password for {}: ", username))?;
        if let Err(e) = CredentialStore::store(username, &password) {
            warn!(error = %e, "Failed to store password in keychain");
        }
        Ok(password)
    }
}

/// Plain (unmasked) username prompt for first runs.
pub fn prompt_username() -> Result<String> {
    print!("CDSE username: ");
    std::io::stdout().flush()?;

    let mut username = String::new();
    std::io::stdin().read_line(&mut username)?;
    Ok(username.trim().to_string())
}
