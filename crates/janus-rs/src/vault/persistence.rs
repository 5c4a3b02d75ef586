//! `XEMSv1` snapshot: optional on-disk persistence for the vault.
//!
//! Layout: `"XEMSv1"` magic, 32-byte random salt, 12-byte nonce, AES-256-GCM
//! blob of the serialized session map. The blob key is derived with
//! HKDF-SHA256 from the configured secret concatenated with a host
//! fingerprint, so a snapshot copied to another machine (or decrypted with
//! the wrong secret) fails authentication and the vault starts empty.
//! The file is created with mode `0600`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use log::{info, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

use super::store::SessionVault;

const MAGIC: &[u8; 6] = b"XEMSv1";
const HKDF_INFO: &[u8] = b"xems-snapshot-key";

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Snapshot key derivation failed")]
    KeyDerivation,

    #[error("Snapshot cipher failure")]
    Crypto,
}

/// One persisted session: digest key plus decrypted payload and timing.
#[derive(Serialize, Deserialize)]
struct SnapshotEntry {
    digest: String,
    sandbox: String,
    payload_b64: String,
    created_at_ms: i64,
    expires_at_ms: i64,
}

/// Fingerprint of the host the snapshot is bound to.
///
/// Prefers `/etc/machine-id`; falls back to the hostname. The value is
/// hashed so the snapshot file discloses neither.
pub fn host_fingerprint() -> Vec<u8> {
    let raw = fs::read_to_string("/etc/machine-id")
        .map(|s| s.trim().to_string())
        .or_else(|_| {
            fs::read_to_string("/proc/sys/kernel/hostname").map(|s| s.trim().to_string())
        })
        .unwrap_or_else(|_| "janus-unknown-host".to_string());
    Sha256::digest(raw.as_bytes()).to_vec()
}

fn derive_key(secret: &str, fingerprint: &[u8], salt: &[u8]) -> Result<[u8; 32], PersistenceError> {
    let mut ikm = Vec::with_capacity(secret.len() + fingerprint.len());
    ikm.extend_from_slice(secret.as_bytes());
    ikm.extend_from_slice(fingerprint);

    let hk = Hkdf::<Sha256>::new(Some(salt), &ikm);
    let mut okm = [0u8; 32];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|_| PersistenceError::KeyDerivation)?;
    Ok(okm)
}

/// Writes the current session map to `path`.
///
/// Grace tombstones and expired entries are not persisted; a restored vault
/// begins with only live sessions.
pub fn snapshot(
    vault: &SessionVault,
    path: &Path,
    secret: &str,
) -> Result<(), PersistenceError> {
    let entries: Vec<SnapshotEntry> = vault
        .snapshot_entries()
        .into_iter()
        .map(
            |(digest, sandbox, payload, created_at_ms, expires_at_ms)| SnapshotEntry {
                digest,
                sandbox,
                payload_b64: {
                    use base64::Engine as _;
                    base64::engine::general_purpose::STANDARD.encode(payload)
                },
                created_at_ms,
                expires_at_ms,
            },
        )
        .collect();
    let plaintext = serde_json::to_vec(&entries)?;

    let mut salt = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);

    let key = derive_key(secret, &host_fingerprint(), &salt)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let blob = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| PersistenceError::Crypto)?;

    let mut file = open_0600(path)?;
    file.write_all(MAGIC)?;
    file.write_all(&salt)?;
    file.write_all(&nonce)?;
    file.write_all(&blob)?;
    file.sync_all()?;
    info!("Vault snapshot written: {} sessions", entries.len());
    Ok(())
}

#[cfg(unix)]
fn open_0600(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

/// Restores sessions from `path` into `vault`.
///
/// Any failure (missing file, bad magic, host mismatch, wrong secret,
/// tampered blob) is non-fatal: the snapshot is discarded and the vault
/// starts empty, which is the safe interpretation of an unreadable store.
pub fn restore(vault: &mut SessionVault, path: &Path, secret: &str) -> usize {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(_) => return 0,
    };
    if data.len() < MAGIC.len() + 32 + 12 || &data[..MAGIC.len()] != MAGIC {
        warn!("Vault snapshot at {} is malformed, starting empty", path.display());
        return 0;
    }

    let salt = &data[6..38];
    let nonce = &data[38..50];
    let blob = &data[50..];

    let Ok(key) = derive_key(secret, &host_fingerprint(), salt) else {
        return 0;
    };
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let plaintext = match cipher.decrypt(Nonce::from_slice(nonce), blob) {
        Ok(p) => p,
        Err(_) => {
            warn!(
                "Vault snapshot at {} did not authenticate (host or secret mismatch), starting empty",
                path.display()
            );
            return 0;
        }
    };

    let entries: Vec<SnapshotEntry> = match serde_json::from_slice(&plaintext) {
        Ok(e) => e,
        Err(_) => {
            warn!("Vault snapshot at {} is corrupt, starting empty", path.display());
            return 0;
        }
    };

    let mut restored = 0;
    for entry in entries {
        use base64::Engine as _;
        let Ok(payload) = base64::engine::general_purpose::STANDARD.decode(&entry.payload_b64)
        else {
            continue;
        };
        if vault
            .load_entry(
                &entry.digest,
                &entry.sandbox,
                &payload,
                entry.created_at_ms,
                entry.expires_at_ms,
            )
            .is_ok()
        {
            restored += 1;
        }
    }
    info!("Vault snapshot restored: {} sessions", restored);
    restored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::store::VaultConfig;

    fn vault() -> SessionVault {
        SessionVault::new(VaultConfig::default())
    }

    #[test]
    fn snapshot_round_trip_restores_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.xems");

        let mut original = vault();
        let token = original.create("app", b"user=7", None).unwrap();
        snapshot(&original, &path, "secret").unwrap();

        let mut restored = vault();
        assert_eq!(restore(&mut restored, &path, "secret"), 1);
        assert_eq!(restored.read(&token).unwrap(), b"user=7");
    }

    #[test]
    fn wrong_secret_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.xems");

        let mut original = vault();
        original.create("app", b"data", None).unwrap();
        snapshot(&original, &path, "right").unwrap();

        let mut restored = vault();
        assert_eq!(restore(&mut restored, &path, "wrong"), 0);
        assert!(restored.is_empty());
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut v = vault();
        assert_eq!(restore(&mut v, &dir.path().join("absent.xems"), "s"), 0);
    }

    #[test]
    fn truncated_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.xems");
        std::fs::write(&path, b"XEMSv1short").unwrap();

        let mut v = vault();
        assert_eq!(restore(&mut v, &path, "s"), 0);
    }

    #[cfg(unix)]
    #[test]
    fn snapshot_file_is_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.xems");
        snapshot(&vault(), &path, "s").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
