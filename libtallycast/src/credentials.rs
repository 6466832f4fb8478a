//! Per-source credential storage
//!
//! Every source carries up to four opaque secrets whose meaning is fixed by
//! the network adapter (API key and username, client secret and client id,
//! service-account JSON and site URL, ...). Stores hand them out as a
//! [`SourceToken`] whose slots are wiped from memory on drop.
//!
//! Two backends are provided:
//! - [`DatabaseCredentialStore`]: age passphrase encryption, base64 in the
//!   `source_tokens` table
//! - [`MemoryCredentialStore`]: plain in-process map for tests and embedding

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Mutex;
use zeroize::Zeroizing;

use crate::config::CredentialsConfig;
use crate::db::{Database, TokenRow};
use crate::error::CredentialError;

type CredResult<T> = std::result::Result<T, CredentialError>;

/// Decrypted secrets for one source
pub struct SourceToken {
    slots: [SecretString; 4],
}

impl SourceToken {
    pub fn new(slots: [&str; 4]) -> Self {
        Self {
            slots: slots.map(secret),
        }
    }

    /// Token with only the first two slots populated
    pub fn pair(s1: &str, s2: &str) -> Self {
        Self::new([s1, s2, "", ""])
    }

    /// Slot `index` (0-based); empty when unset
    pub fn slot(&self, index: usize) -> &str {
        self.slots
            .get(index)
            .map(|s| s.expose_secret())
            .unwrap_or("")
    }

    pub fn s1(&self) -> &str {
        self.slot(0)
    }

    pub fn s2(&self) -> &str {
        self.slot(1)
    }

    pub fn s3(&self) -> &str {
        self.slot(2)
    }

    pub fn s4(&self) -> &str {
        self.slot(3)
    }
}

impl std::fmt::Debug for SourceToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceToken")
            .field("slots", &"[REDACTED]")
            .finish()
    }
}

fn secret(value: &str) -> SecretString {
    SecretString::new(value.to_string().into_boxed_str())
}

/// Lookup of per-source secrets
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetch the decrypted secrets for a source
    ///
    /// Fails with [`CredentialError::NotFound`] when nothing is stored and
    /// with [`CredentialError::DecryptionFailed`] when the stored data can't
    /// be read back. Callers must abort rather than continue with empty
    /// credentials.
    async fn get_source_token(&self, source_id: &str) -> CredResult<SourceToken>;

    /// Replace all secrets for a source
    async fn set_source_token(&self, source_id: &str, token: &SourceToken) -> CredResult<()>;

    fn backend_name(&self) -> &str;
}

/// Secrets encrypted with an age passphrase and kept in the database
pub struct DatabaseCredentialStore {
    db: Database,
    passphrase: SecretString,
}

impl DatabaseCredentialStore {
    pub fn new(db: Database, passphrase: SecretString) -> Self {
        Self { db, passphrase }
    }

    /// Read the passphrase from the environment variable named in the config
    pub fn from_config(db: Database, config: &CredentialsConfig) -> CredResult<Self> {
        let passphrase = std::env::var(&config.key_env)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| CredentialError::MissingKey(config.key_env.clone()))?;

        Ok(Self::new(db, secret(&passphrase)))
    }

    fn encrypt(&self, plaintext: &str) -> CredResult<String> {
        let encryptor = age::Encryptor::with_user_passphrase(age::secrecy::Secret::new(
            self.passphrase.expose_secret().to_string(),
        ));

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        writer
            .write_all(plaintext.as_bytes())
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        writer
            .finish()
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        Ok(STANDARD.encode(encrypted))
    }

    fn decrypt(&self, encoded: &str) -> CredResult<String> {
        let data = STANDARD
            .decode(encoded)
            .map_err(|e| CredentialError::DecryptionFailed(format!("invalid base64: {}", e)))?;

        let decryptor = match age::Decryptor::new(&data[..]) {
            Ok(age::Decryptor::Passphrase(d)) => d,
            Ok(_) => {
                return Err(CredentialError::DecryptionFailed(
                    "invalid encryption format (expected passphrase)".to_string(),
                ))
            }
            Err(e) => return Err(CredentialError::DecryptionFailed(e.to_string())),
        };

        let mut reader = decryptor
            .decrypt(
                &age::secrecy::Secret::new(self.passphrase.expose_secret().to_string()),
                None,
            )
            .map_err(|e| CredentialError::DecryptionFailed(e.to_string()))?;

        let mut decrypted = Zeroizing::new(vec![]);
        reader
            .read_to_end(&mut decrypted)
            .map_err(|e| CredentialError::DecryptionFailed(e.to_string()))?;

        String::from_utf8(decrypted.to_vec())
            .map_err(|e| CredentialError::DecryptionFailed(format!("invalid UTF-8: {}", e)))
    }
}

#[async_trait]
impl CredentialStore for DatabaseCredentialStore {
    async fn get_source_token(&self, source_id: &str) -> CredResult<SourceToken> {
        let row = self
            .db
            .get_token_row(source_id)
            .await
            .map_err(|e| CredentialError::Storage(e.to_string()))?
            .ok_or_else(|| CredentialError::NotFound(source_id.to_string()))?;

        let mut plain: [Zeroizing<String>; 4] = Default::default();
        for (slot, stored) in plain.iter_mut().zip(row.iter()) {
            if let Some(encoded) = stored {
                *slot = Zeroizing::new(self.decrypt(encoded)?);
            }
        }

        Ok(SourceToken::new([
            plain[0].as_str(),
            plain[1].as_str(),
            plain[2].as_str(),
            plain[3].as_str(),
        ]))
    }

    async fn set_source_token(&self, source_id: &str, token: &SourceToken) -> CredResult<()> {
        let mut row: TokenRow = Default::default();
        for (index, stored) in row.iter_mut().enumerate() {
            let value = token.slot(index);
            if !value.is_empty() {
                *stored = Some(self.encrypt(value)?);
            }
        }

        self.db
            .put_token_row(source_id, &row)
            .await
            .map_err(|e| CredentialError::Storage(e.to_string()))?;

        tracing::debug!(source_id, "Stored encrypted credentials");
        Ok(())
    }

    fn backend_name(&self) -> &str {
        "database"
    }
}

/// In-memory credential store
#[derive(Default)]
pub struct MemoryCredentialStore {
    tokens: Mutex<HashMap<String, [Zeroizing<String>; 4]>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert secrets without going through the async trait
    pub fn insert(&self, source_id: &str, slots: [&str; 4]) {
        let slots = slots.map(|s| Zeroizing::new(s.to_string()));
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(source_id.to_string(), slots);
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get_source_token(&self, source_id: &str) -> CredResult<SourceToken> {
        let tokens = self
            .tokens
            .lock()
            .map_err(|e| CredentialError::Storage(e.to_string()))?;

        let slots = tokens
            .get(source_id)
            .ok_or_else(|| CredentialError::NotFound(source_id.to_string()))?;

        Ok(SourceToken::new([
            slots[0].as_str(),
            slots[1].as_str(),
            slots[2].as_str(),
            slots[3].as_str(),
        ]))
    }

    async fn set_source_token(&self, source_id: &str, token: &SourceToken) -> CredResult<()> {
        self.insert(
            source_id,
            [token.s1(), token.s2(), token.s3(), token.s4()],
        );
        Ok(())
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}
