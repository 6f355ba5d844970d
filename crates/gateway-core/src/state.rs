//! Atomic persistence of versioned JSON state documents.
//!
//! Writes go to a uniquely named sibling temp file which is then renamed
//! over the target, so concurrent readers never observe a partial write.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Read a JSON document from `path`.
///
/// Returns `None` when no readable, schema-matching document exists: a
/// missing file, an unreadable file, or JSON that does not deserialize
/// into `T`. Anything other than a missing file is logged.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to read state file {}: {err}", path.display());
            }
            return None;
        }
    };

    match serde_json::from_str(&raw) {
        Ok(doc) => Some(doc),
        Err(err) => {
            tracing::warn!("ignoring unreadable state file {}: {err}", path.display());
            None
        }
    }
}

/// Atomically replace `path` with the JSON serialization of `doc`.
///
/// The parent directory is created if missing. The document is written to
/// `path.<uuid>.tmp` with owner-only permissions, then renamed over `path`;
/// permissions are re-applied after the rename on a best-effort basis.
pub fn write_json_atomic<T: Serialize>(path: &Path, doc: &T) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid state path: {}", path.display()))?;
    fs::create_dir_all(dir)?;

    let json = serde_json::to_string_pretty(doc)?;
    let tmp = tmp_path(path);
    fs::write(&tmp, json)?;
    restrict_permissions(&tmp);

    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    restrict_permissions(path);
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", uuid::Uuid::new_v4()));
    path.with_file_name(name)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
