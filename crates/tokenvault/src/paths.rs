use directories::ProjectDirs;
use eyre::{Context as _, ContextCompat as _};
use std::path::PathBuf;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt as _;

pub const LOG_FILE_NAME: &str = "tokenvault.log.jsonl";

#[derive(Debug, Clone)]
pub struct VaultPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_file: PathBuf,
}

impl VaultPaths {
    pub fn discover() -> eyre::Result<Self> {
        // Test/CI override knobs.
        if let (Ok(data_dir), Ok(config_dir)) = (
            std::env::var("TOKENVAULT_DATA_DIR"),
            std::env::var("TOKENVAULT_CONFIG_DIR"),
        ) {
            return Ok(Self::at(PathBuf::from(config_dir), PathBuf::from(data_dir)));
        }

        // macOS: ~/Library/Application Support/tokenvault
        // Linux: ~/.config/tokenvault
        // Windows: %APPDATA%\\tokenvault
        let proj =
            ProjectDirs::from("", "", "tokenvault").context("failed to resolve project dirs")?;
        Ok(Self::at(
            proj.config_dir().to_path_buf(),
            proj.data_dir().to_path_buf(),
        ))
    }

    pub fn at(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        let log_file = data_dir.join(LOG_FILE_NAME);
        Self {
            config_dir,
            data_dir,
            log_file,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn machine_secret_path(&self) -> PathBuf {
        self.config_dir.join("machine_secret.bin")
    }

    /// Root of the per-account records written by the file store.
    pub fn records_dir(&self) -> PathBuf {
        self.data_dir.join("records")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("tokenvault.lock")
    }

    pub fn ensure_private_dirs(&self) -> eyre::Result<()> {
        crate::fsutil::ensure_private_dir(&self.config_dir)?;
        crate::fsutil::ensure_private_dir(&self.data_dir)?;
        Ok(())
    }

    /// Load the 32-byte machine secret that seals vault keys at rest, creating it on first use.
    ///
    /// Creation goes through a temp file hard-linked into place, so two processes racing on
    /// first start end up sharing whichever secret landed first.
    pub fn ensure_machine_secret(&self) -> eyre::Result<zeroize::Zeroizing<[u8; 32]>> {
        self.ensure_private_dirs()?;
        let p = self.machine_secret_path();

        for _ in 0_usize..5_usize {
            if p.exists() {
                let md = std::fs::symlink_metadata(&p)
                    .with_context(|| format!("stat {}", p.display()))?;
                if md.file_type().is_symlink() {
                    eyre::bail!("refusing to read symlink: {}", p.display());
                }
                let buf = zeroize::Zeroizing::new(
                    std::fs::read(&p).with_context(|| format!("read {}", p.display()))?,
                );
                let mut out = zeroize::Zeroizing::new([0_u8; 32]);
                if buf.len() != out.len() {
                    eyre::bail!("machine secret wrong length: {}", p.display());
                }
                out.copy_from_slice(&buf);
                return Ok(out);
            }

            let mut secret = zeroize::Zeroizing::new([0_u8; 32]);
            crate::keyvault::crypto::fill_random(secret.as_mut_slice());

            let parent = p
                .parent()
                .ok_or_else(|| eyre::eyre!("missing parent for {}", p.display()))?;
            let tmp = crate::fsutil::tmp_path_for(parent, &p);

            let mut oo = std::fs::OpenOptions::new();
            oo.create_new(true).write(true).truncate(false);
            #[cfg(unix)]
            {
                oo.mode(crate::fsutil::MODE_FILE_PRIVATE);
            }
            {
                use std::io::Write as _;
                let mut f = oo
                    .open(&tmp)
                    .with_context(|| format!("open temp {}", tmp.display()))?;
                f.write_all(secret.as_slice())
                    .with_context(|| format!("write {}", tmp.display()))?;
                f.sync_all()
                    .with_context(|| format!("fsync {}", tmp.display()))?;
            }

            match std::fs::hard_link(&tmp, &p) {
                Ok(()) => {
                    drop(std::fs::remove_file(&tmp));
                    return Ok(secret);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    // Lost the race; read the winner's secret on the next pass.
                    drop(std::fs::remove_file(&tmp));
                }
                Err(e) => {
                    drop(std::fs::remove_file(&tmp));
                    return Err(eyre::Report::new(e).wrap_err(format!(
                        "hard_link {} -> {}",
                        tmp.display(),
                        p.display()
                    )));
                }
            }
        }

        eyre::bail!("failed to create/read machine secret: {}", p.display())
    }
}
