//! Atomic file replacement.
//!
//! The target is only ever observed in its old or its new state:
//! content goes to a uniquely named temp file in the same directory, is
//! fsynced, gets its final mode, and is renamed over the target. The parent
//! directory is fsynced afterwards so the rename itself survives a crash.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Mode for world-readable files (site configs, registry, certificates).
pub const MODE_PUBLIC: u32 = 0o644;

/// Mode for private keys and account credentials.
pub const MODE_PRIVATE: u32 = 0o600;

pub fn write_atomic(target: &Path, content: &[u8], mode: u32) -> std::io::Result<()> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let temp_path = temp_path_for(target);
    let result = write_temp(&temp_path, content, mode).and_then(|_| fs::rename(&temp_path, target));
    if result.is_err() {
        // best-effort cleanup
        let _ = fs::remove_file(&temp_path);
        return result;
    }

    if let Ok(dir) = File::open(&parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

fn write_temp(temp_path: &Path, content: &[u8], mode: u32) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    let mut file = options.open(temp_path)?;
    file.write_all(content)?;
    file.sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(temp_path, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

fn temp_path_for(target: &Path) -> PathBuf {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    target.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()))
}
