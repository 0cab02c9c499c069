use crate::{
    account::{normalize_address, Account},
    errors::VaultError,
    keyvault::utc_now_iso,
    kv::{KvStore, Update},
};
use eyre::Context as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

const STORE_PREFIX: &str = "tokens";
const RECORD_VERSION: u8 = 1;

/// Largest decimals value whose scale still fits a 256-bit token amount.
pub const MAX_DECIMALS: u8 = 77;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    #[serde(rename = "ERC20")]
    Erc20,
    #[serde(rename = "ERC721")]
    Erc721,
}

impl TokenKind {
    pub fn parse(s: &str) -> Result<Self, VaultError> {
        match s.trim().to_ascii_uppercase().replace('-', "").as_str() {
            "ERC20" => Ok(Self::Erc20),
            "ERC721" => Ok(Self::Erc721),
            _ => Err(VaultError::InvalidRequest(format!(
                "tokenKind must be ERC20 or ERC721, got {s:?}"
            ))),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Erc20 => "ERC20",
            Self::Erc721 => "ERC721",
        }
    }
}

/// User-supplied details for an import. Fields that do not apply to the kind are dropped.
#[derive(Debug, Clone, Default)]
pub struct TokenMetadata {
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimals: Option<u8>,
    pub token_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedToken {
    pub address: String,
    pub kind: TokenKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    pub visible: bool,
    pub imported_at: String,
    pub updated_at: String,
}

impl TrackedToken {
    fn matches(&self, address: &str, kind: TokenKind) -> bool {
        self.kind == kind && self.address == address
    }

    /// Overlay provided metadata; absent fields keep what the record already had.
    fn apply(&mut self, meta: TokenMetadata) {
        if let Some(name) = meta.name {
            self.name = name;
        }
        match self.kind {
            TokenKind::Erc20 => {
                if meta.symbol.is_some() {
                    self.symbol = meta.symbol;
                }
                if meta.decimals.is_some() {
                    self.decimals = meta.decimals;
                }
            }
            TokenKind::Erc721 => {
                if meta.token_id.is_some() {
                    self.token_id = meta.token_id;
                }
            }
        }
    }
}

/// Everything tracked for one account, stored and replaced as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenList {
    v: u8,
    tokens: Vec<TrackedToken>,
}

impl Default for TokenList {
    fn default() -> Self {
        Self {
            v: RECORD_VERSION,
            tokens: Vec::new(),
        }
    }
}

fn parse_list(raw: Option<&[u8]>) -> Result<TokenList, VaultError> {
    let Some(raw) = raw else {
        return Ok(TokenList::default());
    };
    let list: TokenList = serde_json::from_slice(raw)
        .map_err(|e| VaultError::StorageUnavailable(format!("corrupt token list: {e}")))?;
    if list.v != RECORD_VERSION {
        return Err(VaultError::StorageUnavailable(format!(
            "unsupported token list version: {}",
            list.v
        )));
    }
    Ok(list)
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_owned()).filter(|v| !v.is_empty())
}

/// Imported and hidden tokens per account, in insertion order.
pub struct TokenRegistry {
    store: Arc<dyn KvStore>,
}

impl std::fmt::Debug for TokenRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRegistry").finish_non_exhaustive()
    }
}

impl TokenRegistry {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn load(&self, account: &Account) -> eyre::Result<TokenList> {
        let raw = self.store.get(&account.store_key(STORE_PREFIX))?;
        Ok(parse_list(raw.as_deref())?)
    }

    /// Read-modify-write of the account's whole list under the store's write lock.
    /// `f` returns `false` when nothing changed and the list need not be rewritten.
    fn modify(
        &self,
        account: &Account,
        mut f: impl FnMut(&mut TokenList) -> eyre::Result<bool>,
    ) -> eyre::Result<()> {
        self.store
            .update(&account.store_key(STORE_PREFIX), &mut |raw| {
                let mut list = parse_list(raw.as_deref())?;
                if !f(&mut list)? {
                    return Ok(Update::Keep);
                }
                let bytes = serde_json::to_vec_pretty(&list).context("serialize token list")?;
                Ok(Update::Put(bytes))
            })
    }

    pub fn import_token(
        &self,
        account: &Account,
        contract_address: &str,
        kind: TokenKind,
        meta: TokenMetadata,
    ) -> eyre::Result<TrackedToken> {
        let address = normalize_address(contract_address)?;
        let mut meta = TokenMetadata {
            name: non_empty(meta.name),
            symbol: non_empty(meta.symbol),
            decimals: meta.decimals,
            token_id: non_empty(meta.token_id),
        };
        match kind {
            TokenKind::Erc20 => {
                if meta.decimals.is_some_and(|d| d > MAX_DECIMALS) {
                    return Err(VaultError::InvalidRequest(format!(
                        "decimals must be <= {MAX_DECIMALS}"
                    ))
                    .into());
                }
                meta.token_id = None;
            }
            TokenKind::Erc721 => {
                meta.symbol = None;
                meta.decimals = None;
            }
        }

        let mut out = None;
        self.modify(account, |list| {
            let now = utc_now_iso();
            let token = if let Some(existing) =
                list.tokens.iter_mut().find(|t| t.matches(&address, kind))
            {
                let restored = !existing.visible;
                existing.visible = true;
                existing.apply(meta.clone());
                existing.updated_at = now;
                debug!(kind = kind.as_str(), restored, "re-imported token");
                existing.clone()
            } else {
                // A new ERC-721 record needs its tokenId; re-imports keep the stored one.
                if kind == TokenKind::Erc721 && meta.token_id.is_none() {
                    return Err(VaultError::MissingTokenId.into());
                }
                let mut token = TrackedToken {
                    address: address.clone(),
                    kind,
                    name: String::new(),
                    symbol: None,
                    decimals: None,
                    token_id: None,
                    visible: true,
                    imported_at: now.clone(),
                    updated_at: now,
                };
                token.apply(meta.clone());
                list.tokens.push(token.clone());
                info!(kind = kind.as_str(), chain_id = account.chain_id(), "imported token");
                token
            };
            out = Some(token);
            Ok(true)
        })?;
        Ok(out.ok_or_else(|| VaultError::TokenNotFound(address.clone()))?)
    }

    /// Hidden records stay in the list so a later import restores them as they were.
    pub fn hide_token(
        &self,
        account: &Account,
        contract_address: &str,
        kind: TokenKind,
    ) -> eyre::Result<()> {
        let address = normalize_address(contract_address)?;
        self.modify(account, |list| {
            let Some(token) = list.tokens.iter_mut().find(|t| t.matches(&address, kind)) else {
                return Err(VaultError::TokenNotFound(address.clone()).into());
            };
            if !token.visible {
                return Ok(false);
            }
            token.visible = false;
            token.updated_at = utc_now_iso();
            info!(kind = kind.as_str(), chain_id = account.chain_id(), "hid token");
            Ok(true)
        })
    }

    pub fn list_tokens(
        &self,
        account: &Account,
        kind: Option<TokenKind>,
        include_hidden: bool,
    ) -> eyre::Result<Vec<TrackedToken>> {
        Ok(self
            .load(account)?
            .tokens
            .into_iter()
            .filter(|t| include_hidden || t.visible)
            .filter(|t| kind.is_none_or(|k| t.kind == k))
            .collect())
    }

    /// Look up a record regardless of visibility.
    pub fn get_token(
        &self,
        account: &Account,
        contract_address: &str,
        kind: TokenKind,
    ) -> eyre::Result<Option<TrackedToken>> {
        let address = normalize_address(contract_address)?;
        Ok(self
            .load(account)?
            .tokens
            .into_iter()
            .find(|t| t.matches(&address, kind)))
    }
}
