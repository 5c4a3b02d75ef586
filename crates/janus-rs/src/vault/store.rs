//! In-memory encrypted session store with atomic token rotation.
//!
//! Tokens are 256 bits of OS randomness rendered as URL-safe base64; the
//! store never indexes by the raw token. Lookups go through a SHA-256 digest
//! so map probing never compares secret bytes directly, a matched entry is
//! only accepted after [`constant_time_eq`] confirms the digest bytes, and
//! the digest keys are what the snapshot format persists.
//!
//! Rotation keeps the predecessor readable for a grace window to absorb
//! in-flight concurrent requests, then answers `Rotated` until the entry's
//! natural expiry sweeps it out, after which reads see `NotFound`. Rotating
//! a token that is already in its grace window is rejected: grace applies to
//! reads only, and a second rotation would fork the token lineage.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

/// Errors returned by vault operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VaultError {
    /// The configured capacity is exhausted.
    #[error("Vault capacity of {capacity} sessions exceeded")]
    VaultFull { capacity: usize },

    /// No live or lingering entry for this token.
    #[error("Unknown session token")]
    NotFound,

    /// The entry exists but its TTL has elapsed.
    #[error("Session expired")]
    Expired,

    /// The token was rotated out and its grace window has closed, or a
    /// rotation was attempted on a token already in grace.
    #[error("Session token was rotated")]
    Rotated,

    /// Encryption or decryption failed. With a stable master key this means
    /// the ciphertext was tampered with.
    #[error("Session cipher failure")]
    Crypto,
}

/// Tuning knobs for the store.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Maximum live sessions (grace entries included).
    pub capacity: usize,
    /// Default TTL in milliseconds when `create` is not given one.
    pub default_ttl_ms: u64,
    /// How long a rotated-out token stays readable, in milliseconds.
    pub grace_period_ms: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            default_ttl_ms: 30 * 60 * 1_000,
            grace_period_ms: 1_000,
        }
    }
}

/// Lifecycle state of one stored entry.
#[derive(Debug, Clone, PartialEq)]
enum EntryState {
    Active,
    /// Rotated out; readable until `readable_until_ms`, then `Rotated`.
    Grace { readable_until_ms: i64 },
}

#[derive(Debug)]
pub(crate) struct SessionEntry {
    /// Digest the entry is stored under; re-checked in constant time before
    /// any lookup is accepted.
    digest: [u8; 32],
    pub(crate) sandbox: String,
    pub(crate) nonce: [u8; 12],
    pub(crate) ciphertext: Vec<u8>,
    pub(crate) created_at_ms: i64,
    pub(crate) expires_at_ms: i64,
    state: EntryState,
}

impl Drop for SessionEntry {
    fn drop(&mut self) {
        wipe(&mut self.ciphertext);
    }
}

/// Best-effort zeroization that the optimizer may not elide.
fn wipe(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        unsafe { std::ptr::write_volatile(b, 0) };
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Digest key a token is stored under.
pub(crate) fn token_digest(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

/// The encrypted session store.
///
/// Owned mutably by a single task (the sidecar event loop); operations take
/// `&mut self` and are linearizable by construction.
pub struct SessionVault {
    config: VaultConfig,
    master_key: [u8; 32],
    entries: ahash::HashMap<[u8; 32], SessionEntry>,
}

impl SessionVault {
    /// Creates a vault with a fresh random master key.
    pub fn new(config: VaultConfig) -> Self {
        let mut master_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut master_key);
        Self::with_master_key(config, master_key)
    }

    pub fn with_master_key(config: VaultConfig, master_key: [u8; 32]) -> Self {
        Self {
            config,
            master_key,
            entries: ahash::HashMap::default(),
        }
    }

    /// Number of stored entries, grace tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves a digest to its entry.
    ///
    /// The map probe matches on hash equality; acceptance goes through a
    /// full constant-time comparison of the digest bytes so no lookup path
    /// short-circuits on secret-derived data.
    fn entry(&self, digest: &[u8; 32]) -> Option<&SessionEntry> {
        let entry = self.entries.get(digest)?;
        constant_time_eq(digest, &entry.digest).then_some(entry)
    }

    /// Creates a session and returns its opaque token.
    pub fn create(
        &mut self,
        sandbox: &str,
        plaintext: &[u8],
        ttl_ms: Option<u64>,
    ) -> Result<String, VaultError> {
        self.sweep();
        if self.entries.len() >= self.config.capacity {
            return Err(VaultError::VaultFull {
                capacity: self.config.capacity,
            });
        }

        let token = Self::generate_token();
        let digest = token_digest(&token);
        let now = now_ms();
        let ttl = ttl_ms.unwrap_or(self.config.default_ttl_ms);
        let entry = self.seal(digest, sandbox, plaintext, now, now + ttl as i64)?;
        self.entries.insert(digest, entry);
        Ok(token)
    }

    /// Decrypts the payload for a token without extending its TTL.
    pub fn read(&mut self, token: &str) -> Result<Vec<u8>, VaultError> {
        let now = now_ms();
        let digest = token_digest(token);
        let master_key = self.master_key;

        let entry = self.entry(&digest).ok_or(VaultError::NotFound)?;
        if now >= entry.expires_at_ms {
            return Err(VaultError::Expired);
        }
        if let EntryState::Grace { readable_until_ms } = entry.state {
            if now > readable_until_ms {
                return Err(VaultError::Rotated);
            }
        }
        open(&master_key, entry)
    }

    /// Atomically replaces `token` with a fresh one.
    ///
    /// The old token stays readable for the grace period. The new entry
    /// keeps the predecessor's expiry: TTL is never extended by rotation.
    /// Passing `new_plaintext` swaps the stored payload under the new token.
    pub fn rotate(
        &mut self,
        token: &str,
        new_plaintext: Option<&[u8]>,
    ) -> Result<String, VaultError> {
        let now = now_ms();
        let digest = token_digest(token);
        let master_key = self.master_key;

        let entry = self.entry(&digest).ok_or(VaultError::NotFound)?;
        if now >= entry.expires_at_ms {
            return Err(VaultError::Expired);
        }
        if entry.state != EntryState::Active {
            // Grace applies to reads only.
            return Err(VaultError::Rotated);
        }

        let payload = match new_plaintext {
            Some(p) => p.to_vec(),
            None => open(&master_key, entry)?,
        };
        let sandbox = entry.sandbox.clone();
        let expires_at_ms = entry.expires_at_ms;

        let new_token = Self::generate_token();
        let new_digest = token_digest(&new_token);
        let new_entry = self.seal(new_digest, &sandbox, &payload, now, expires_at_ms)?;
        self.entries.insert(new_digest, new_entry);

        let grace = self.config.grace_period_ms as i64;
        if let Some(old) = self.entries.get_mut(&digest) {
            old.state = EntryState::Grace {
                readable_until_ms: now + grace,
            };
        }
        Ok(new_token)
    }

    /// Removes a session immediately. Returns whether a live entry existed.
    ///
    /// The ciphertext buffer is wiped on drop.
    pub fn destroy(&mut self, token: &str) -> bool {
        let digest = token_digest(token);
        if self.entry(&digest).is_none() {
            return false;
        }
        self.entries.remove(&digest).is_some()
    }

    /// Drops expired entries. Grace tombstones ride along on their original
    /// expiry, which is what turns `Rotated` into `NotFound` eventually.
    pub fn sweep(&mut self) {
        let now = now_ms();
        self.entries.retain(|_, entry| now < entry.expires_at_ms);
    }

    fn generate_token() -> String {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        URL_SAFE_NO_PAD.encode(raw)
    }

    fn seal(
        &self,
        digest: [u8; 32],
        sandbox: &str,
        plaintext: &[u8],
        created_at_ms: i64,
        expires_at_ms: i64,
    ) -> Result<SessionEntry, VaultError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.master_key));
        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: sandbox.as_bytes(),
                },
            )
            .map_err(|_| VaultError::Crypto)?;
        Ok(SessionEntry {
            digest,
            sandbox: sandbox.to_string(),
            nonce,
            ciphertext,
            created_at_ms,
            expires_at_ms,
            state: EntryState::Active,
        })
    }

    // Snapshot support: iterate decryptable entries / bulk load. Used by the
    // persistence module; not part of the public operation set.

    pub(crate) fn snapshot_entries(&self) -> Vec<(String, String, Vec<u8>, i64, i64)> {
        let now = now_ms();
        self.entries
            .iter()
            .filter(|(_, e)| e.state == EntryState::Active && now < e.expires_at_ms)
            .filter_map(|(digest, e)| {
                open(&self.master_key, e).ok().map(|plaintext| {
                    (
                        hex_encode(digest),
                        e.sandbox.clone(),
                        plaintext,
                        e.created_at_ms,
                        e.expires_at_ms,
                    )
                })
            })
            .collect()
    }

    pub(crate) fn load_entry(
        &mut self,
        digest_hex: &str,
        sandbox: &str,
        plaintext: &[u8],
        created_at_ms: i64,
        expires_at_ms: i64,
    ) -> Result<(), VaultError> {
        if now_ms() >= expires_at_ms {
            return Ok(());
        }
        let Some(digest) = hex_decode(digest_hex) else {
            return Ok(());
        };
        let entry = self.seal(digest, sandbox, plaintext, created_at_ms, expires_at_ms)?;
        self.entries.insert(digest, entry);
        Ok(())
    }
}

fn open(master_key: &[u8; 32], entry: &SessionEntry) -> Result<Vec<u8>, VaultError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(master_key));
    cipher
        .decrypt(
            Nonce::from_slice(&entry.nonce),
            Payload {
                msg: &entry.ciphertext,
                aad: entry.sandbox.as_bytes(),
            },
        )
        .map_err(|_| VaultError::Crypto)
}

fn hex_encode(bytes: &[u8; 32]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(s: &str) -> Option<[u8; 32]> {
    if s.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out[i] = ((hi << 4) | lo) as u8;
    }
    Some(out)
}

/// Constant-time byte comparison; no short-circuit on mismatch.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
