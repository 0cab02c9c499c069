use eyre::Context as _;
use rand::Rng as _;
use std::{
    fs::{self, OpenOptions},
    io::Write as _,
    path::{Path, PathBuf},
};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt as _, PermissionsExt as _};

pub const MODE_DIR_PRIVATE: u32 = 0o700;
pub const MODE_FILE_PRIVATE: u32 = 0o600;

fn is_symlink(p: &Path) -> eyre::Result<bool> {
    let md = fs::symlink_metadata(p).with_context(|| format!("stat {}", p.display()))?;
    Ok(md.file_type().is_symlink())
}

pub fn ensure_private_dir(dir: &Path) -> eyre::Result<()> {
    if dir.exists() {
        if is_symlink(dir)? {
            eyre::bail!("refusing to use symlinked directory: {}", dir.display());
        }
        let md = fs::metadata(dir).with_context(|| format!("stat {}", dir.display()))?;
        if !md.is_dir() {
            eyre::bail!("expected directory at {}", dir.display());
        }
    } else {
        fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
    }

    #[cfg(unix)]
    {
        let md = fs::metadata(dir).with_context(|| format!("stat {}", dir.display()))?;
        let mode = md.permissions().mode();
        if (mode & 0o077) != 0 {
            fs::set_permissions(dir, fs::Permissions::from_mode(MODE_DIR_PRIVATE))
                .with_context(|| format!("chmod {MODE_DIR_PRIVATE:o} {}", dir.display()))?;
        }
    }

    Ok(())
}

pub fn tmp_path_for(parent: &Path, final_name: &Path) -> PathBuf {
    let base = final_name
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let mut rand_bytes = [0_u8; 8];
    rand::rng().fill_bytes(&mut rand_bytes);
    parent.join(format!(".{base}.tmp.{}", hex::encode(rand_bytes)))
}

/// Replace `path` with `bytes` via temp file + fsync + rename, never leaving a torn file.
pub fn write_atomic_private(path: &Path, bytes: &[u8]) -> eyre::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| eyre::eyre!("missing parent for {}", path.display()))?;
    ensure_private_dir(parent)?;

    if path.exists() && is_symlink(path)? {
        eyre::bail!("refusing to write to symlink: {}", path.display());
    }

    let tmp = tmp_path_for(parent, path);
    let mut oo = OpenOptions::new();
    oo.create_new(true).write(true);
    #[cfg(unix)]
    {
        oo.mode(MODE_FILE_PRIVATE);
    }
    let mut f = oo
        .open(&tmp)
        .with_context(|| format!("open temp {}", tmp.display()))?;

    f.write_all(bytes)
        .with_context(|| format!("write {}", tmp.display()))?;
    f.sync_all()
        .with_context(|| format!("fsync {}", tmp.display()))?;
    drop(f);

    // `rename` is atomic on Unix. On Windows, this can fail if the destination exists.
    #[cfg(windows)]
    {
        if path.exists() {
            fs::remove_file(path).with_context(|| format!("remove existing {}", path.display()))?;
        }
    }

    if let Err(e) = fs::rename(&tmp, path) {
        drop(fs::remove_file(&tmp));
        return Err(eyre::Report::new(e).wrap_err(format!(
            "rename {} -> {}",
            tmp.display(),
            path.display()
        )));
    }
    Ok(())
}

/// `Ok(None)` when the file does not exist; symlinks are refused.
pub fn read_private(path: &Path) -> eyre::Result<Option<Vec<u8>>> {
    match fs::symlink_metadata(path) {
        Ok(md) if md.file_type().is_symlink() => {
            eyre::bail!("refusing to read symlink: {}", path.display())
        }
        Ok(_) => Ok(Some(
            fs::read(path).with_context(|| format!("read {}", path.display()))?,
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(eyre::Report::new(e).wrap_err(format!("stat {}", path.display()))),
    }
}

/// Returns whether a file was removed.
pub fn remove_if_exists(path: &Path) -> eyre::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(eyre::Report::new(e).wrap_err(format!("remove {}", path.display()))),
    }
}
