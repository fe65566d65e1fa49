//! The encrypted local state file.
//!
//! On disk the state is a JSON envelope `{ algorithm, iv, authTag, ciphertext }` with hex
//! fields. The plaintext is a versioned JSON document holding named database configs, secrets
//! and known users. The AES-256-GCM key is derived from the caller's private key with Argon2.
//! A wrong key or a modified file fails with [`Error::Decryption`].

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dialect::Dialect;
use crate::error::Error;
use crate::registry::TargetConfig;
use crate::version;

pub const ALGORITHM: &str = "aes-256-gcm";

const KDF_SALT: &[u8] = b"mutatio-state-kdf";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    pub algorithm: String,
    pub iv: String,
    pub auth_tag: String,
    pub ciphertext: String,
}

fn derive_key(private_key: &str) -> Result<[u8; 32], Error> {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(private_key.as_bytes(), KDF_SALT, &mut key)
        .map_err(|e| Error::Decryption(format!("key derivation failed: {}", e)))?;
    Ok(key)
}

fn cipher(private_key: &str) -> Result<Aes256Gcm, Error> {
    let key = derive_key(private_key)?;
    Aes256Gcm::new_from_slice(&key).map_err(|e| Error::Decryption(e.to_string()))
}

pub fn encrypt(plaintext: &[u8], private_key: &str) -> Result<EncryptedPayload, Error> {
    let mut iv = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut iv);
    let mut sealed = cipher(private_key)?
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| Error::Serialization(format!("encryption failed: {}", e)))?;
    let tag = sealed.split_off(sealed.len().saturating_sub(TAG_LEN));
    Ok(EncryptedPayload {
        algorithm: ALGORITHM.to_string(),
        iv: hex::encode(iv),
        auth_tag: hex::encode(tag),
        ciphertext: hex::encode(sealed),
    })
}

pub fn decrypt(payload: &EncryptedPayload, private_key: &str) -> Result<Vec<u8>, Error> {
    if payload.algorithm != ALGORITHM {
        return Err(Error::Decryption(format!(
            "unsupported algorithm '{}'",
            payload.algorithm
        )));
    }
    let field = |name: &str, value: &str| {
        hex::decode(value).map_err(|e| Error::Decryption(format!("{} is not valid hex: {}", name, e)))
    };
    let iv = field("iv", &payload.iv)?;
    let tag = field("authTag", &payload.auth_tag)?;
    let mut sealed = field("ciphertext", &payload.ciphertext)?;
    if iv.len() != NONCE_LEN || tag.len() != TAG_LEN {
        return Err(Error::Decryption("malformed iv or auth tag".to_string()));
    }
    sealed.extend_from_slice(&tag);
    cipher(private_key)?
        .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
        .map_err(|_| Error::Decryption("wrong key or tampered state".to_string()))
}

/// A named database target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigEntry {
    pub dialect: Dialect,
    pub url: String,
    /// Destructive commands refuse to run against protected configs.
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub is_test: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub version: u32,
    #[serde(default)]
    pub active_config: Option<String>,
    #[serde(default)]
    pub configs: BTreeMap<String, ConfigEntry>,
    #[serde(default)]
    pub secrets: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub global_secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub known_users: Vec<String>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            version: version::state::migrations().len() as u32,
            active_config: None,
            configs: BTreeMap::new(),
            secrets: BTreeMap::new(),
            global_secrets: BTreeMap::new(),
            known_users: Vec::new(),
        }
    }
}

impl State {
    /// Load and decrypt `path`, migrating it if it was written by an older build.
    ///
    /// A missing file yields an empty state. A migrated document is written back before
    /// returning; a failed migration writes nothing.
    pub fn load(path: &Path, private_key: &str) -> Result<Self, Error> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No state file, starting empty");
            return Ok(Self::default());
        }
        let envelope: EncryptedPayload = serde_json::from_str(&fs::read_to_string(path)?)?;
        let plaintext = decrypt(&envelope, private_key)?;
        let stored: Value = serde_json::from_slice(&plaintext)?;

        let coordinator = version::state::coordinator()?;
        let check = coordinator.check_version(&stored);
        let current = coordinator.ensure_version(stored)?;
        let state: State = serde_json::from_value(current)?;
        if check.needs_migration {
            state.save(path, private_key)?;
        }
        Ok(state)
    }

    pub fn save(&self, path: &Path, private_key: &str) -> Result<(), Error> {
        let plaintext = serde_json::to_vec(self)?;
        let envelope = encrypt(&plaintext, private_key)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&envelope)?)?;
        Ok(())
    }

    pub fn add_config(&mut self, name: impl Into<String>, entry: ConfigEntry) {
        let name = name.into();
        if self.active_config.is_none() {
            self.active_config = Some(name.clone());
        }
        self.configs.insert(name, entry);
    }

    /// Resolve `name`, or the active config when `name` is `None`.
    pub fn target(&self, name: Option<&str>) -> Result<TargetConfig, Error> {
        let name = name
            .or(self.active_config.as_deref())
            .ok_or_else(|| Error::Generic("no config selected and no active config".to_string()))?;
        let entry = self
            .configs
            .get(name)
            .ok_or_else(|| Error::Generic(format!("unknown config '{}'", name)))?;
        Ok(TargetConfig::new(name, entry.dialect, entry.url.clone()))
    }

    pub fn set_secret(&mut self, config: &str, key: impl Into<String>, value: impl Into<String>) {
        self.secrets
            .entry(config.to_string())
            .or_default()
            .insert(key.into(), value.into());
    }

    pub fn remember_user(&mut self, user: &str) {
        if !self.known_users.iter().any(|u| u == user) {
            self.known_users.push(user.to_string());
        }
    }
}
