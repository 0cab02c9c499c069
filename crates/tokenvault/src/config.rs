use serde::{Deserialize, Serialize};

/// Upper bound on a hex ciphertext accepted by `decryptBalance`, in decoded bytes.
pub const DEFAULT_MAX_CIPHERTEXT_BYTES: usize = 4096;

/// Account used when the host does not send a `context` with the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultAccount {
    pub address: String,
    pub chain_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Fallback active account. Hosts that always send `context` can leave this unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_account: Option<DefaultAccount>,

    /// Ciphertexts larger than this are rejected as malformed before any decryption work.
    pub max_ciphertext_bytes: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            default_account: None,
            max_ciphertext_bytes: DEFAULT_MAX_CIPHERTEXT_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Context as _;

    #[test]
    fn partial_toml_fills_defaults() -> eyre::Result<()> {
        let cfg: VaultConfig = toml::from_str(
            r#"
            [default_account]
            address = "0x00000000000000000000000000000000000000aa"
            chain_id = 11155111
            "#,
        )
        .context("parse")?;
        assert_eq!(cfg.max_ciphertext_bytes, DEFAULT_MAX_CIPHERTEXT_BYTES);
        assert_eq!(cfg.default_account.map(|a| a.chain_id), Some(11_155_111));
        Ok(())
    }
}
