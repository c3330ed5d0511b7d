//! File-backed token store.
//!
//! One file per key under a restricted directory: `<directory>/<key>.token`
//! at mode 0600 (directory 0700). With encryption enabled, the payload is
//! the raw AEAD blob; otherwise it is the JSON serialization of the token.
//! Writes go through a temp file and rename so a crash never leaves a
//! half-written token behind. Optional backups keep timestamped copies per
//! key, pruned to the configured retention.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use tokio::sync::RwLock;

use crate::config::{BackupConfig, EncryptionConfig, FileStorageConfig};
use crate::error::{AuthError, Result};
use crate::security::crypto;
use crate::store::{
    OAuthToken, TokenMetadata, TokenStore, sanitize_key, sanitize_stem, token_not_found,
    with_default_expiry,
};

/// Token store that persists each token as an individual file.
#[derive(Debug)]
pub struct FileTokenStore {
    directory: PathBuf,
    file_permissions: u32,
    directory_permissions: u32,
    encryption_key: Option<Vec<u8>>,
    backup: BackupConfig,
    /// Serializes readers and writers; also guards `last_accessed`.
    lock: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl FileTokenStore {
    /// Open (and create if needed) a file store at the configured directory.
    pub fn new(config: &FileStorageConfig, encryption: &EncryptionConfig) -> Result<Self> {
        let encryption_key = if encryption.enabled {
            Some(resolve_encryption_key(encryption)?)
        } else {
            None
        };

        let store = Self {
            directory: config.directory.clone(),
            file_permissions: config.file_permissions,
            directory_permissions: config.directory_permissions,
            encryption_key,
            backup: config.backup.clone(),
            lock: RwLock::new(HashMap::new()),
        };
        store.ensure_directory()?;
        Ok(store)
    }

    fn ensure_directory(&self) -> Result<()> {
        fs::create_dir_all(&self.directory)?;
        set_permissions(&self.directory, self.directory_permissions)?;
        Ok(())
    }

    fn token_path(&self, key: &str) -> PathBuf {
        self.directory.join(sanitize_key(key))
    }

    fn backup_directory(&self, key: &str) -> PathBuf {
        let root = self
            .backup
            .directory
            .clone()
            .unwrap_or_else(|| self.directory.join("backups"));
        root.join(sanitize_stem(key))
    }

    fn is_encrypted(&self) -> bool {
        self.encryption_key.is_some()
    }

    fn encode(&self, token: &OAuthToken) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(token)?;
        match &self.encryption_key {
            Some(key) => crypto::encrypt(&json, key),
            None => Ok(json),
        }
    }

    fn decode(&self, payload: &[u8]) -> Result<OAuthToken> {
        let json = match &self.encryption_key {
            Some(key) => crypto::decrypt(payload, key)?,
            None => payload.to_vec(),
        };
        Ok(serde_json::from_slice(&json)?)
    }

    /// Write `payload` to `path` atomically at the configured file mode.
    fn write_atomic(&self, path: &Path, payload: &[u8]) -> Result<()> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| AuthError::storage("token path has no filename"))?;
        let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

        fs::write(&tmp_path, payload)?;
        set_permissions(&tmp_path, self.file_permissions)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Best-effort timestamped backup copy. Never fails the primary write.
    fn write_backup(&self, key: &str, payload: &[u8]) {
        if !self.backup.enabled {
            return;
        }
        if let Err(err) = self.try_write_backup(key, payload) {
            tracing::warn!(key, error = %err, "Token backup write failed");
        }
    }

    fn try_write_backup(&self, key: &str, payload: &[u8]) -> Result<()> {
        let dir = self.backup_directory(key);
        fs::create_dir_all(&dir)?;
        set_permissions(&dir, self.directory_permissions)?;

        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let name = format!("{}.{stamp}", sanitize_key(key));
        let path = dir.join(name);
        fs::write(&path, payload)?;
        set_permissions(&path, self.file_permissions)?;

        self.prune_backups(&dir)?;
        Ok(())
    }

    /// Keep only the `max_files` most recent backups in `dir`.
    fn prune_backups(&self, dir: &Path) -> Result<()> {
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        if entries.len() <= self.backup.max_files {
            return Ok(());
        }
        // Backup names embed a sortable timestamp suffix.
        entries.sort();
        let excess = entries.len() - self.backup.max_files;
        for stale in entries.into_iter().take(excess) {
            if let Err(err) = fs::remove_file(&stale) {
                tracing::warn!(path = %stale.display(), error = %err, "Failed to prune backup");
            }
        }
        Ok(())
    }

    fn delete_locked(&self, key: &str) {
        let path = self.token_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(key, error = %err, "Failed to delete token file");
            }
        }
        let backups = self.backup_directory(key);
        if backups.exists()
            && let Err(err) = fs::remove_dir_all(&backups)
        {
            tracing::warn!(key, error = %err, "Failed to delete token backups");
        }
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn store(&self, key: &str, token: &OAuthToken) -> Result<()> {
        let token = with_default_expiry(token);
        let payload = self.encode(&token)?;

        let mut accessed = self.lock.write().await;
        self.ensure_directory()?;
        self.write_atomic(&self.token_path(key), &payload)?;
        self.write_backup(key, &payload);
        accessed.insert(key.to_string(), Utc::now());

        tracing::debug!(key, encrypted = self.is_encrypted(), "Token stored");
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<OAuthToken> {
        let token = {
            let mut accessed = self.lock.write().await;
            let path = self.token_path(key);
            let payload = match fs::read(&path) {
                Ok(payload) => payload,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(token_not_found(key));
                }
                Err(err) => return Err(err.into()),
            };
            accessed.insert(key.to_string(), Utc::now());
            self.decode(&payload)?
        };
        // First acquisition is dropped before the expiry path retakes the
        // lock, so the delete below cannot self-deadlock.

        if let Some(expires_at) = token.expires_at
            && Utc::now() > expires_at
        {
            let _guard = self.lock.write().await;
            self.delete_locked(key);
            return Err(AuthError::TokenExpired {
                provider: key.to_string(),
            });
        }

        Ok(token)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut accessed = self.lock.write().await;
        self.delete_locked(key);
        accessed.remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let _guard = self.lock.read().await;
        let mut keys = Vec::new();
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(err) => return Err(err.into()),
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".token")
                && !name.starts_with('.')
            {
                keys.push(stem.to_string());
            }
        }
        Ok(keys)
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let mut removed = 0;
        for key in self.list().await? {
            if !self.is_valid(&key).await {
                self.delete(&key).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Expired tokens purged from file store");
        }
        Ok(removed)
    }

    async fn info(&self, key: &str) -> Result<TokenMetadata> {
        let accessed = self.lock.read().await;
        let path = self.token_path(key);
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(token_not_found(key));
            }
            Err(err) => return Err(err.into()),
        };
        let created_at: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());

        // Parse without the expiry side effects of retrieve.
        let payload = fs::read(&path)?;
        let token = self.decode(&payload)?;

        Ok(TokenMetadata {
            provider: key.to_string(),
            created_at,
            last_accessed: accessed.get(key).copied().unwrap_or(created_at),
            expires_at: token.expires_at,
            is_encrypted: self.is_encrypted(),
        })
    }
}

/// Resolve raw key material from config: inline key, or key file contents.
/// Material shorter than the AEAD minimum is stretched with the configured
/// KDF parameters.
fn resolve_encryption_key(encryption: &EncryptionConfig) -> Result<Vec<u8>> {
    let material: Vec<u8> = if let Some(key) = &encryption.key {
        key.expose_secret().as_bytes().to_vec()
    } else if let Some(path) = &encryption.key_file {
        fs::read(path).map_err(|e| {
            AuthError::invalid_config(format!("failed to read key file {}: {e}", path.display()))
        })?
    } else {
        return Err(AuthError::invalid_config(
            "encryption enabled but neither key nor key_file is set",
        ));
    };

    if material.is_empty() {
        return Err(AuthError::invalid_config("encryption key is empty"));
    }

    // A 64-character hex string is key material in transport encoding;
    // decode it to its 32 raw bytes.
    let material = if material.len() == 64 && material.iter().all(u8::is_ascii_hexdigit) {
        hex::decode(&material).unwrap_or(material)
    } else {
        material
    };

    if material.len() >= crypto::MIN_KEY_SIZE {
        Ok(material)
    } else {
        let kdf = &encryption.key_derivation;
        Ok(crypto::derive_key(
            &material,
            kdf.salt.as_bytes(),
            kdf.iterations,
            kdf.key_length.max(crypto::MIN_KEY_SIZE),
        ))
    }
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
