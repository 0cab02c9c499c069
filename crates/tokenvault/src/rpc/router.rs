//! Method dispatch: validate params, resolve the account, take the per-account guard, call
//! into the vault/registry/decryptor, and hand back whatever they returned.
use crate::{
    account::Account,
    amount::format_base_units,
    config::VaultConfig,
    decrypt,
    errors::VaultError,
    keyvault::{KeyVault, VaultEntry},
    kv::KvStore,
    registry::{TokenKind, TokenMetadata, TokenRegistry},
};
use serde_json::{json, Value};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::debug;
use zeroize::Zeroizing;

use super::params;

/// Every method the host may call.
pub const METHODS: &[&str] = &[
    "importToken",
    "hideToken",
    "listTokens",
    "getOrCreateKey",
    "rotateKey",
    "deleteKey",
    "getKeyInfo",
    "decryptBalance",
];

/// A fully validated call. Building one never touches storage.
#[derive(Debug)]
enum Call {
    ImportToken {
        contract_address: String,
        kind: TokenKind,
        meta: TokenMetadata,
    },
    HideToken {
        contract_address: String,
        kind: TokenKind,
    },
    ListTokens {
        kind: Option<TokenKind>,
        include_hidden: bool,
    },
    GetOrCreateKey,
    RotateKey,
    DeleteKey,
    GetKeyInfo,
    DecryptBalance {
        ciphertext: String,
        token: Option<(String, TokenKind)>,
        block_ref: Option<Value>,
    },
}

impl Call {
    fn parse(method: &str, p: &Value) -> Result<Self, VaultError> {
        if !METHODS.contains(&method) {
            return Err(VaultError::UnsupportedMethod(method.to_owned()));
        }
        params::ensure_object(p)?;

        Ok(match method {
            "importToken" => Self::ImportToken {
                contract_address: params::required_str(p, "contractAddress")?.to_owned(),
                kind: params::required_kind(p)?,
                meta: TokenMetadata {
                    name: params::optional_str(p, "name")?.map(str::to_owned),
                    symbol: params::optional_str(p, "symbol")?.map(str::to_owned),
                    decimals: params::optional_u8(p, "decimals")?,
                    token_id: params::optional_token_id(p)?,
                },
            },
            "hideToken" => Self::HideToken {
                contract_address: params::required_str(p, "contractAddress")?.to_owned(),
                kind: params::required_kind(p)?,
            },
            "listTokens" => Self::ListTokens {
                kind: params::optional_kind(p)?,
                include_hidden: params::optional_bool(p, "includeHidden")?.unwrap_or(false),
            },
            "getOrCreateKey" => Self::GetOrCreateKey,
            "rotateKey" => Self::RotateKey,
            "deleteKey" => Self::DeleteKey,
            "getKeyInfo" => Self::GetKeyInfo,
            "decryptBalance" => {
                let token = match params::optional_str(p, "contractAddress")? {
                    Some(addr) => Some((
                        addr.to_owned(),
                        params::optional_kind(p)?.unwrap_or(TokenKind::Erc20),
                    )),
                    None => None,
                };
                Self::DecryptBalance {
                    ciphertext: params::required_str(p, "ciphertext")?.to_owned(),
                    token,
                    block_ref: p.get("blockRef").filter(|v| !v.is_null()).cloned(),
                }
            }
            other => return Err(VaultError::UnsupportedMethod(other.to_owned())),
        })
    }
}

/// Marks an account as having a call in flight until dropped.
#[derive(Debug)]
pub struct AccountGuard<'a> {
    busy: &'a Mutex<HashSet<Account>>,
    account: Account,
}

impl Drop for AccountGuard<'_> {
    fn drop(&mut self) {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.account);
    }
}

fn key_payload(entry: &VaultEntry) -> Value {
    let key_hex = entry.key_hex();
    json!({
        "key": key_hex.as_str(),
        "revision": entry.revision,
        "createdAt": entry.created_at,
        "rotatedAt": entry.rotated_at,
        "fingerprint": entry.fingerprint(),
    })
}

/// Dispatcher over the vault and registry. Holds no per-call state beyond the busy set.
#[derive(Debug)]
pub struct RequestRouter {
    vault: KeyVault,
    registry: TokenRegistry,
    busy: Mutex<HashSet<Account>>,
    default_account: Option<Account>,
    max_ciphertext_bytes: usize,
}

impl RequestRouter {
    pub fn new(
        store: Arc<dyn KvStore>,
        machine_secret: Zeroizing<[u8; 32]>,
        cfg: &VaultConfig,
    ) -> eyre::Result<Self> {
        let default_account = cfg
            .default_account
            .as_ref()
            .map(|d| Account::new(&d.address, d.chain_id))
            .transpose()?;
        Ok(Self {
            vault: KeyVault::new(Arc::clone(&store), machine_secret),
            registry: TokenRegistry::new(store),
            busy: Mutex::new(HashSet::new()),
            default_account,
            max_ciphertext_bytes: cfg.max_ciphertext_bytes,
        })
    }

    /// Claim the account for one call; `AccountBusy` if another call already holds it.
    pub fn begin(&self, account: &Account) -> Result<AccountGuard<'_>, VaultError> {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if !busy.insert(account.clone()) {
            debug!(%account, "call rejected; account busy");
            return Err(VaultError::AccountBusy);
        }
        Ok(AccountGuard {
            busy: &self.busy,
            account: account.clone(),
        })
    }

    fn resolve(&self, p: &Value) -> Result<Account, VaultError> {
        params::context_account(p)?
            .or_else(|| self.default_account.clone())
            .ok_or(VaultError::NoActiveAccount)
    }

    pub fn dispatch(&self, method: &str, p: &Value) -> eyre::Result<Value> {
        let call = Call::parse(method, p)?;
        let account = self.resolve(p)?;
        let _guard = self.begin(&account)?;
        debug!(method, address = account.address(), chain_id = account.chain_id(), "dispatch");

        match call {
            Call::ImportToken {
                contract_address,
                kind,
                meta,
            } => {
                let token = self
                    .registry
                    .import_token(&account, &contract_address, kind, meta)?;
                Ok(json!({ "token": token }))
            }
            Call::HideToken {
                contract_address,
                kind,
            } => {
                self.registry.hide_token(&account, &contract_address, kind)?;
                Ok(json!({ "ok": true }))
            }
            Call::ListTokens {
                kind,
                include_hidden,
            } => {
                let tokens = self.registry.list_tokens(&account, kind, include_hidden)?;
                Ok(json!({ "tokens": tokens }))
            }
            Call::GetOrCreateKey => Ok(key_payload(&self.vault.get_or_create_key(&account)?)),
            Call::RotateKey => Ok(key_payload(&self.vault.rotate_key(&account)?)),
            Call::DeleteKey => Ok(json!({ "deleted": self.vault.delete_key(&account)? })),
            Call::GetKeyInfo => Ok(serde_json::to_value(self.vault.key_info(&account)?)?),
            Call::DecryptBalance {
                ciphertext,
                token,
                block_ref,
            } => self.decrypt_balance(&account, &ciphertext, token, block_ref),
        }
    }

    fn decrypt_balance(
        &self,
        account: &Account,
        ciphertext: &str,
        token: Option<(String, TokenKind)>,
        block_ref: Option<Value>,
    ) -> eyre::Result<Value> {
        let entry = self.vault.require_key(account)?;
        let tracked = match token {
            Some((addr, kind)) => Some(
                self.registry
                    .get_token(account, &addr, kind)?
                    .ok_or_else(|| VaultError::TokenNotFound(addr.clone()))?,
            ),
            None => None,
        };

        let raw = decrypt::decode_ciphertext(ciphertext, self.max_ciphertext_bytes)?;
        let amount = decrypt::decrypt_balance(&raw, entry.key())?;

        let mut out = json!({
            "amount": amount.to_str_radix(10),
            "keyRevision": entry.revision,
        });
        if let Some(obj) = out.as_object_mut() {
            if let Some(b) = block_ref {
                obj.insert("blockRef".into(), b);
            }
            if let Some(t) = tracked {
                if let Some(d) = t.decimals {
                    obj.insert("formatted".into(), json!(format_base_units(&amount, d)));
                }
                obj.insert(
                    "token".into(),
                    json!({ "address": t.address, "kind": t.kind, "symbol": t.symbol }),
                );
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::DefaultAccount, errors::classify, kv::MemoryKvStore};
    use aes_gcm::{
        aead::{Aead as _, KeyInit as _},
        Aes256Gcm, Nonce,
    };
    use eyre::ContextCompat as _;

    const ADDR: &str = "0x00000000000000000000000000000000000000aa";
    const FOO: &str = "0xaaa0000000000000000000000000000000000001";

    fn router() -> eyre::Result<RequestRouter> {
        router_with(&VaultConfig::default())
    }

    fn router_with(cfg: &VaultConfig) -> eyre::Result<RequestRouter> {
        RequestRouter::new(
            Arc::new(MemoryKvStore::new()),
            Zeroizing::new([4_u8; 32]),
            cfg,
        )
    }

    fn ctx(extra: &Value) -> Value {
        let mut p = json!({ "context": { "address": ADDR, "chainId": 1 } });
        if let (Some(obj), Some(more)) = (p.as_object_mut(), extra.as_object()) {
            for (k, v) in more {
                obj.insert(k.clone(), v.clone());
            }
        }
        p
    }

    fn err_kind(r: eyre::Result<Value>) -> eyre::Result<VaultError> {
        let e = r.err().context("call must fail")?;
        classify(&e).cloned().context("error must be classified")
    }

    fn seal_hex(key_hex: &str, amount: &num_bigint::BigUint) -> eyre::Result<String> {
        let key = hex::decode(key_hex)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| eyre::eyre!("{e}"))?;
        let nonce = [3_u8; 12];
        let ct = cipher
            .encrypt(Nonce::from_slice(&nonce), amount.to_bytes_be().as_slice())
            .map_err(|e| eyre::eyre!("{e}"))?;
        Ok(format!("0x{}{}", hex::encode(nonce), hex::encode(ct)))
    }

    fn key_hex(v: &Value) -> eyre::Result<String> {
        Ok(v.get("key").and_then(Value::as_str).context("key")?.to_owned())
    }

    #[test]
    fn import_hide_reimport_example() -> eyre::Result<()> {
        let r = router()?;
        r.dispatch(
            "importToken",
            &ctx(&json!({ "contractAddress": FOO, "tokenKind": "ERC20", "name": "Foo", "symbol": "FOO" })),
        )?;
        let listed = r.dispatch("listTokens", &ctx(&json!({})))?;
        let tokens = listed.get("tokens").and_then(Value::as_array).context("tokens")?;
        assert_eq!(tokens.len(), 1);
        let t = tokens.first().context("first")?;
        assert_eq!(t.get("address"), Some(&json!(FOO)));
        assert_eq!(t.get("kind"), Some(&json!("ERC20")));
        assert_eq!(t.get("name"), Some(&json!("Foo")));
        assert_eq!(t.get("symbol"), Some(&json!("FOO")));
        assert_eq!(t.get("visible"), Some(&json!(true)));

        r.dispatch("hideToken", &ctx(&json!({ "contractAddress": FOO, "tokenKind": "ERC20" })))?;
        let listed = r.dispatch("listTokens", &ctx(&json!({})))?;
        assert_eq!(listed.get("tokens"), Some(&json!([])));

        r.dispatch("importToken", &ctx(&json!({ "contractAddress": FOO, "tokenKind": "ERC20" })))?;
        let listed = r.dispatch("listTokens", &ctx(&json!({})))?;
        let tokens = listed.get("tokens").and_then(Value::as_array).context("tokens")?;
        assert_eq!(tokens.len(), 1, "re-import restores the single record");
        let back = tokens.first().context("first")?;
        for field in ["address", "kind", "name", "symbol", "visible", "importedAt"] {
            assert_eq!(back.get(field), t.get(field), "{field} survives hide/re-import");
        }
        Ok(())
    }

    #[test]
    fn missing_params_fail_before_account_resolution() -> eyre::Result<()> {
        let r = router()?;
        // No context and no default account: validation still wins.
        let kind = err_kind(r.dispatch("importToken", &json!({ "tokenKind": "ERC20" })))?;
        assert!(matches!(kind, VaultError::InvalidRequest(_)));
        let kind = err_kind(r.dispatch("decryptBalance", &json!({})))?;
        assert!(matches!(kind, VaultError::InvalidRequest(_)));
        Ok(())
    }

    #[test]
    fn no_context_and_no_default_is_no_active_account() -> eyre::Result<()> {
        let r = router()?;
        assert_eq!(
            err_kind(r.dispatch("listTokens", &json!({})))?,
            VaultError::NoActiveAccount
        );
        Ok(())
    }

    #[test]
    fn default_account_is_used_without_context() -> eyre::Result<()> {
        let cfg = VaultConfig {
            default_account: Some(DefaultAccount {
                address: ADDR.into(),
                chain_id: 1,
            }),
            ..VaultConfig::default()
        };
        let r = router_with(&cfg)?;
        r.dispatch("importToken", &json!({ "contractAddress": FOO, "tokenKind": "ERC20" }))?;
        let listed = r.dispatch("listTokens", &ctx(&json!({})))?;
        assert_eq!(
            listed.get("tokens").and_then(Value::as_array).map(Vec::len),
            Some(1)
        );
        Ok(())
    }

    #[test]
    fn unknown_method_is_unsupported() -> eyre::Result<()> {
        let r = router()?;
        assert_eq!(
            err_kind(r.dispatch("signTransaction", &ctx(&json!({}))))?,
            VaultError::UnsupportedMethod("signTransaction".into())
        );
        Ok(())
    }

    #[test]
    fn decrypt_roundtrip_rotate_and_delete() -> eyre::Result<()> {
        let r = router()?;
        let created = r.dispatch("getOrCreateKey", &ctx(&json!({})))?;
        let k0 = key_hex(&created)?;
        let amount = num_bigint::BigUint::from(u128::MAX) * num_bigint::BigUint::from(3_u32);
        let ct = seal_hex(&k0, &amount)?;

        let first = r.dispatch("decryptBalance", &ctx(&json!({ "ciphertext": ct, "blockRef": "latest" })))?;
        let second = r.dispatch("decryptBalance", &ctx(&json!({ "ciphertext": ct, "blockRef": "latest" })))?;
        assert_eq!(first, second);
        assert_eq!(first.get("amount"), Some(&json!(amount.to_string())));
        assert_eq!(first.get("keyRevision"), Some(&json!(0)));
        assert_eq!(first.get("blockRef"), Some(&json!("latest")));

        let rotated = r.dispatch("rotateKey", &ctx(&json!({})))?;
        assert_ne!(key_hex(&rotated)?, k0);
        assert_eq!(
            err_kind(r.dispatch("decryptBalance", &ctx(&json!({ "ciphertext": ct }))))?,
            VaultError::DecryptionFailed
        );

        let deleted = r.dispatch("deleteKey", &ctx(&json!({})))?;
        assert_eq!(deleted.get("deleted"), Some(&json!(true)));
        assert_eq!(
            err_kind(r.dispatch("decryptBalance", &ctx(&json!({ "ciphertext": ct }))))?,
            VaultError::KeyUnavailable
        );

        let recreated = r.dispatch("getOrCreateKey", &ctx(&json!({})))?;
        let ct2 = seal_hex(&key_hex(&recreated)?, &amount)?;
        let third = r.dispatch("decryptBalance", &ctx(&json!({ "ciphertext": ct2 })))?;
        assert_eq!(third.get("amount"), Some(&json!(amount.to_string())));
        assert_ne!(
            third.get("keyRevision"),
            first.get("keyRevision"),
            "a recreated key reports a new revision"
        );
        assert_eq!(third.get("keyRevision"), Some(&json!(2)));
        Ok(())
    }

    #[test]
    fn decrypt_bound_to_token_formats_with_decimals() -> eyre::Result<()> {
        let r = router()?;
        r.dispatch(
            "importToken",
            &ctx(&json!({ "contractAddress": FOO, "tokenKind": "ERC20", "symbol": "FOO", "decimals": 6 })),
        )?;
        let k = key_hex(&r.dispatch("getOrCreateKey", &ctx(&json!({})))?)?;
        let ct = seal_hex(&k, &num_bigint::BigUint::from(1_500_000_u32))?;

        let out = r.dispatch("decryptBalance", &ctx(&json!({ "ciphertext": ct, "contractAddress": FOO })))?;
        assert_eq!(out.get("amount"), Some(&json!("1500000")));
        assert_eq!(out.get("formatted"), Some(&json!("1.5")));

        let other = "0x00000000000000000000000000000000000000b2";
        let kind = err_kind(r.dispatch(
            "decryptBalance",
            &ctx(&json!({ "ciphertext": ct, "contractAddress": other })),
        ))?;
        assert!(matches!(kind, VaultError::TokenNotFound(_)));
        Ok(())
    }

    #[test]
    fn malformed_ciphertext_is_decryption_failed() -> eyre::Result<()> {
        let r = router()?;
        r.dispatch("getOrCreateKey", &ctx(&json!({})))?;
        assert_eq!(
            err_kind(r.dispatch("decryptBalance", &ctx(&json!({ "ciphertext": "0xnothex" }))))?,
            VaultError::DecryptionFailed
        );
        Ok(())
    }

    #[test]
    fn busy_account_is_rejected_and_released() -> eyre::Result<()> {
        let r = router()?;
        let acct = Account::new(ADDR, 1)?;
        {
            let _held = r.begin(&acct)?;
            assert_eq!(
                err_kind(r.dispatch("listTokens", &ctx(&json!({}))))?,
                VaultError::AccountBusy
            );
            // Other accounts are unaffected.
            let other = json!({ "context": { "address": ADDR, "chainId": 137 } });
            r.dispatch("listTokens", &other)?;
        }
        r.dispatch("listTokens", &ctx(&json!({})))?;
        Ok(())
    }

    struct BrokenStore;

    impl KvStore for BrokenStore {
        fn get(&self, _key: &str) -> crate::kv::StoreResult<Option<Vec<u8>>> {
            Err(VaultError::storage("disk gone"))
        }
        fn update(
            &self,
            _key: &str,
            _f: &mut dyn FnMut(Option<Vec<u8>>) -> eyre::Result<crate::kv::Update>,
        ) -> eyre::Result<()> {
            Err(VaultError::storage("disk gone").into())
        }
    }

    #[test]
    fn store_failures_surface_as_storage_unavailable() -> eyre::Result<()> {
        let r = RequestRouter::new(
            Arc::new(BrokenStore),
            Zeroizing::new([4_u8; 32]),
            &VaultConfig::default(),
        )?;
        for method in ["listTokens", "getOrCreateKey", "deleteKey"] {
            let kind = err_kind(r.dispatch(method, &ctx(&json!({}))))?;
            assert!(
                matches!(kind, VaultError::StorageUnavailable(_)),
                "{method} surfaced {kind:?}"
            );
        }
        Ok(())
    }

    #[test]
    fn guard_is_released_after_failed_call() -> eyre::Result<()> {
        let r = router()?;
        err_kind(r.dispatch("rotateKey", &ctx(&json!({}))))?;
        r.dispatch("listTokens", &ctx(&json!({})))?;
        Ok(())
    }
}
