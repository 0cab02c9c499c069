pub mod crypto;

use crate::{
    account::Account,
    errors::VaultError,
    kv::{KvStore, Update},
};
use crypto::{CryptoBox, KEY_LEN};
use eyre::Context as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use zeroize::Zeroizing;

const STORE_PREFIX: &str = "vault";
const RECORD_VERSION: u8 = 1;

/// On-disk form of a vault entry. The key itself only ever appears sealed.
///
/// A deleted entry stays behind as a tombstone (no `sealed_key`) so the next key for the
/// account continues the revision sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VaultRecord {
    v: u8,
    revision: u64,
    created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rotated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sealed_key: Option<CryptoBox>,
}

fn parse_record(raw: &[u8]) -> Result<VaultRecord, VaultError> {
    let rec: VaultRecord = serde_json::from_slice(raw)
        .map_err(|e| VaultError::StorageUnavailable(format!("corrupt vault entry: {e}")))?;
    if rec.v != RECORD_VERSION {
        return Err(VaultError::StorageUnavailable(format!(
            "unsupported vault entry version: {}",
            rec.v
        )));
    }
    Ok(rec)
}

/// An unsealed per-account AES key.
#[derive(Debug, Clone)]
pub struct VaultEntry {
    key: Zeroizing<[u8; KEY_LEN]>,
    pub revision: u64,
    pub created_at: String,
    pub rotated_at: Option<String>,
}

impl VaultEntry {
    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    pub fn key_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.key.as_slice()))
    }

    pub fn fingerprint(&self) -> String {
        crypto::fingerprint(&self.key)
    }
}

/// Key metadata that is safe to hand to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfo {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotated_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// Owns every account's AES key: creation, rotation, deletion.
pub struct KeyVault {
    store: Arc<dyn KvStore>,
    machine_secret: Zeroizing<[u8; KEY_LEN]>,
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVault").finish_non_exhaustive()
    }
}

impl KeyVault {
    pub fn new(store: Arc<dyn KvStore>, machine_secret: Zeroizing<[u8; KEY_LEN]>) -> Self {
        Self {
            store,
            machine_secret,
        }
    }

    fn unseal(&self, scope: &str, rec: &VaultRecord) -> eyre::Result<Option<VaultEntry>> {
        let Some(sealed) = rec.sealed_key.as_ref() else {
            return Ok(None);
        };
        let sealing = crypto::derive_sealing_key(&self.machine_secret, scope)?;
        let pt = crypto::decrypt_aes_gcm(&sealing, sealed).map_err(|e| {
            VaultError::StorageUnavailable(format!("vault entry failed to unseal: {e}"))
        })?;
        let mut key = Zeroizing::new([0_u8; KEY_LEN]);
        if pt.len() != KEY_LEN {
            return Err(VaultError::StorageUnavailable("vault key wrong length".into()).into());
        }
        key.copy_from_slice(&pt);
        if key.iter().all(|b| *b == 0) {
            return Err(VaultError::StorageUnavailable("vault key is all zeros".into()).into());
        }

        Ok(Some(VaultEntry {
            key,
            revision: rec.revision,
            created_at: rec.created_at.clone(),
            rotated_at: rec.rotated_at.clone(),
        }))
    }

    fn seal(&self, scope: &str, entry: &VaultEntry) -> eyre::Result<Vec<u8>> {
        let sealing = crypto::derive_sealing_key(&self.machine_secret, scope)?;
        let rec = VaultRecord {
            v: RECORD_VERSION,
            revision: entry.revision,
            created_at: entry.created_at.clone(),
            rotated_at: entry.rotated_at.clone(),
            sealed_key: Some(crypto::encrypt_aes_gcm(&sealing, entry.key.as_slice())?),
        };
        serde_json::to_vec_pretty(&rec).context("serialize vault entry")
    }

    fn load(&self, account: &Account) -> eyre::Result<Option<VaultEntry>> {
        let scope = account.store_key(STORE_PREFIX);
        let Some(raw) = self.store.get(&scope)? else {
            return Ok(None);
        };
        self.unseal(&scope, &parse_record(&raw)?)
    }

    /// Existing key for the account. Never creates; a missing entry is `KeyUnavailable`.
    pub fn require_key(&self, account: &Account) -> eyre::Result<VaultEntry> {
        self.load(account)?
            .ok_or_else(|| VaultError::KeyUnavailable.into())
    }

    pub fn get_or_create_key(&self, account: &Account) -> eyre::Result<VaultEntry> {
        let scope = account.store_key(STORE_PREFIX);
        let mut out = None;
        let mut created = false;
        self.store.update(&scope, &mut |raw| {
            let prev = raw.as_deref().map(parse_record).transpose()?;
            if let Some(rec) = prev.as_ref() {
                if let Some(entry) = self.unseal(&scope, rec)? {
                    out = Some(entry);
                    return Ok(Update::Keep);
                }
            }

            let entry = VaultEntry {
                key: crypto::random_key(),
                revision: prev.map_or(0, |tomb| tomb.revision.saturating_add(1)),
                created_at: utc_now_iso(),
                rotated_at: None,
            };
            let bytes = self.seal(&scope, &entry)?;
            out = Some(entry);
            created = true;
            Ok(Update::Put(bytes))
        })?;

        let entry = out.ok_or(VaultError::KeyUnavailable)?;
        if created {
            info!(
                chain_id = account.chain_id(),
                revision = entry.revision,
                fingerprint = %entry.fingerprint(),
                "created vault key"
            );
        }
        Ok(entry)
    }

    /// Replace the key with a fresh one. The old key is gone once this returns.
    pub fn rotate_key(&self, account: &Account) -> eyre::Result<VaultEntry> {
        let scope = account.store_key(STORE_PREFIX);
        let mut out = None;
        self.store.update(&scope, &mut |raw| {
            let rec = raw
                .as_deref()
                .map(parse_record)
                .transpose()?
                .ok_or(VaultError::KeyUnavailable)?;
            let prev = self
                .unseal(&scope, &rec)?
                .ok_or(VaultError::KeyUnavailable)?;
            let entry = VaultEntry {
                key: crypto::random_key(),
                revision: prev.revision.saturating_add(1),
                created_at: prev.created_at,
                rotated_at: Some(utc_now_iso()),
            };
            let bytes = self.seal(&scope, &entry)?;
            out = Some(entry);
            Ok(Update::Put(bytes))
        })?;

        let entry = out.ok_or(VaultError::KeyUnavailable)?;
        info!(
            chain_id = account.chain_id(),
            revision = entry.revision,
            fingerprint = %entry.fingerprint(),
            "rotated vault key"
        );
        Ok(entry)
    }

    /// Drops the sealed key and leaves a tombstone. Returns whether a key existed.
    pub fn delete_key(&self, account: &Account) -> eyre::Result<bool> {
        let scope = account.store_key(STORE_PREFIX);
        let mut removed = false;
        self.store.update(&scope, &mut |raw| {
            let Some(raw) = raw else {
                return Ok(Update::Keep);
            };
            let Ok(mut rec) = parse_record(&raw) else {
                // Unreadable entries can still be cleared.
                removed = true;
                return Ok(Update::Remove);
            };
            if rec.sealed_key.take().is_none() {
                return Ok(Update::Keep);
            }
            removed = true;
            let bytes = serde_json::to_vec_pretty(&rec).context("serialize vault tombstone")?;
            Ok(Update::Put(bytes))
        })?;
        if removed {
            info!(chain_id = account.chain_id(), "deleted vault key");
        }
        Ok(removed)
    }

    pub fn key_info(&self, account: &Account) -> eyre::Result<KeyInfo> {
        Ok(match self.load(account)? {
            Some(e) => KeyInfo {
                exists: true,
                revision: Some(e.revision),
                fingerprint: Some(e.fingerprint()),
                created_at: Some(e.created_at),
                rotated_at: e.rotated_at,
            },
            None => KeyInfo {
                exists: false,
                revision: None,
                created_at: None,
                rotated_at: None,
                fingerprint: None,
            },
        })
    }
}

pub fn utc_now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}
