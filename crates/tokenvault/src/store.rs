use crate::{
    config::{DefaultAccount, VaultConfig},
    paths::VaultPaths,
};
use eyre::Context as _;
use std::{fs, path::PathBuf};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

fn parse_chain_id_env(s: &str) -> Option<u64> {
    let v = s.trim();
    v.strip_prefix("0x")
        .or_else(|| v.strip_prefix("0X"))
        .map_or_else(|| v.parse().ok(), |h| u64::from_str_radix(h, 16).ok())
}

/// Apply environment variable overrides to the config.
fn apply_env_overrides(cfg: &mut VaultConfig) {
    let address = std::env::var("TOKENVAULT_ACCOUNT_ADDRESS")
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty());
    let chain_id = std::env::var("TOKENVAULT_CHAIN_ID").ok();

    match (address, chain_id) {
        (Some(address), Some(raw)) => match parse_chain_id_env(&raw) {
            Some(chain_id) => cfg.default_account = Some(DefaultAccount { address, chain_id }),
            None => warn!(value = %raw, "ignoring unparsable TOKENVAULT_CHAIN_ID"),
        },
        (Some(_), None) | (None, Some(_)) => {
            warn!("TOKENVAULT_ACCOUNT_ADDRESS and TOKENVAULT_CHAIN_ID must be set together");
        }
        (None, None) => {}
    }

    if let Ok(v) = std::env::var("TOKENVAULT_MAX_CIPHERTEXT_BYTES") {
        if let Ok(n) = v.trim().parse::<usize>() {
            if n > 0 {
                cfg.max_ciphertext_bytes = n;
            }
        }
    }
}

impl ConfigStore {
    pub fn new(paths: &VaultPaths) -> Self {
        Self {
            path: paths.config_file(),
        }
    }

    pub fn load_or_init_default(&self) -> eyre::Result<VaultConfig> {
        if !self.path.exists() {
            // Env overrides are session-only; persist the plain defaults.
            let mut cfg = VaultConfig::default();
            self.save(&cfg)?;
            apply_env_overrides(&mut cfg);
            return Ok(cfg);
        }

        let s = fs::read_to_string(&self.path).context("read config.toml")?;
        let mut cfg: VaultConfig = toml::from_str(&s).context("parse config.toml")?;
        apply_env_overrides(&mut cfg);
        Ok(cfg)
    }

    pub fn save(&self, cfg: &VaultConfig) -> eyre::Result<()> {
        let s = toml::to_string_pretty(cfg).context("serialize config.toml")?;
        crate::fsutil::write_atomic_private(&self.path, s.as_bytes())
            .context("write config.toml")?;
        Ok(())
    }
}
