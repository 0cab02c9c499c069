use crate::errors::VaultError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalize a `0x` + 40 hex digit address to lowercase.
pub fn normalize_address(raw: &str) -> Result<String, VaultError> {
    let s = raw.trim();
    let Some(body) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) else {
        return Err(VaultError::InvalidAddress(raw.to_owned()));
    };
    if body.len() != 40 || hex::decode(body).is_err() {
        return Err(VaultError::InvalidAddress(raw.to_owned()));
    }
    Ok(format!("0x{}", body.to_ascii_lowercase()))
}

/// The (address, chain) pair every persisted record is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Account {
    address: String,
    chain_id: u64,
}

impl Account {
    pub fn new(address: &str, chain_id: u64) -> Result<Self, VaultError> {
        Ok(Self {
            address: normalize_address(address)?,
            chain_id,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub const fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Composite store key `<prefix>/<chain_id>/<address>`.
    pub fn store_key(&self, prefix: &str) -> String {
        format!("{prefix}/{}/{}", self.chain_id, self.address)
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.address, self.chain_id)
    }
}
