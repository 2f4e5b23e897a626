//! Bearer/refresh token cache shared by all processes of one node role.
//!
//! Tokens live in a JSON file under `TMP_DIR`, guarded by an advisory lock on
//! a sibling `.lock` file. The lock is held only for the duration of a read
//! or a write; refresh is rare enough that contention does not matter.

use crate::config::CONFIG;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("login request failed: {0}")]
    Login(#[source] reqwest::Error),
    #[error("token refresh failed: {0}")]
    Refresh(#[source] reqwest::Error),
    #[error("token cache io error: {0}")]
    Io(#[from] io::Error),
    #[error("WEB_ACCOUNT / WEB_PASSWORD are not configured")]
    MissingCredentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug)]
pub struct TokenStore {
    token_file: PathBuf,
    lock_file: PathBuf,
    http: reqwest::Client,
}

impl TokenStore {
    /// `role` scopes the cache file, so a manager and an executor on the same
    /// host do not clobber each other's tokens.
    pub fn new(role: &str) -> TokenStore {
        let token_file = CONFIG.token_cache_path(role);
        let lock_file = token_file.with_extension("json.lock");
        TokenStore {
            token_file,
            lock_file,
            http: reqwest::Client::new(),
        }
    }

    fn lock(&self) -> io::Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_file)?;
        file.lock_exclusive()?;
        Ok(file)
    }

    /// Returns `None` on a missing or unreadable cache; the caller falls back
    /// to a fresh login.
    fn load(&self) -> Option<TokenPair> {
        let _guard = self.lock().ok()?;
        let raw = std::fs::read_to_string(&self.token_file).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn save(&self, tokens: &TokenPair) -> Result<(), TokenError> {
        let _guard = self.lock()?;
        let raw = serde_json::to_string(tokens).unwrap_or_default();
        std::fs::write(&self.token_file, raw)?;
        Ok(())
    }

    async fn login(&self) -> Result<TokenPair, TokenError> {
        let (account, password) = match (&CONFIG.web_account, &CONFIG.web_password) {
            (Some(a), Some(p)) => (a, p),
            _ => return Err(TokenError::MissingCredentials),
        };
        let url = format!("{}/login", CONFIG.web_base_url());
        let tokens: TokenPair = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "account": account, "password": password }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(TokenError::Login)?
            .json()
            .await
            .map_err(TokenError::Login)?;
        self.save(&tokens)?;
        Ok(tokens)
    }

    /// Refresh the token pair, falling back to a fresh login when there is no
    /// refresh token or the refresh itself is rejected.
    pub async fn refresh(&self) -> Result<(), TokenError> {
        let tokens = match self.load() {
            Some(t) => t,
            None => {
                self.login().await?;
                return Ok(());
            }
        };

        let url = format!("{}/refresh", CONFIG.web_base_url());
        let refreshed = self
            .http
            .post(&url)
            .bearer_auth(&tokens.refresh_token)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match refreshed {
            Ok(response) => {
                let tokens: TokenPair = response.json().await.map_err(TokenError::Refresh)?;
                self.save(&tokens)?;
                Ok(())
            }
            Err(e) => {
                log::warn!("token refresh rejected, logging in again: {}", e);
                self.login().await?;
                Ok(())
            }
        }
    }

    pub async fn access_token(&self) -> Result<String, TokenError> {
        match self.load() {
            Some(tokens) => Ok(tokens.access_token),
            None => Ok(self.login().await?.access_token),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &std::path::Path) -> TokenStore {
        let token_file = dir.join("oj_judger_test_tokens.json");
        let lock_file = token_file.with_extension("json.lock");
        TokenStore {
            token_file,
            lock_file,
            http: reqwest::Client::new(),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let pair = TokenPair {
            access_token: "acc".into(),
            refresh_token: "ref".into(),
        };
        store.save(&pair).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.access_token, "acc");
        assert_eq!(loaded.refresh_token, "ref");
    }

    #[test]
    fn load_missing_or_corrupt_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(store.load().is_none());
        std::fs::write(&store.token_file, "{ not json").unwrap();
        assert!(store.load().is_none());
    }
}
