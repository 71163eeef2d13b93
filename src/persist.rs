//! Atomic file writes for the on-disk caches.
//!
//! Every cache file is written to a `.tmp` sibling and renamed into place,
//! so a reader never observes a half-written file. Failures are reported as
//! [`PersistError`]; callers log them and keep their in-memory result.

use serde::Serialize;
use std::path::Path;

use crate::error::PersistError;

pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PersistError::io(parent, e))?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp_name);

    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| PersistError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| PersistError::io(path, e))?;
    Ok(())
}

pub(crate) async fn write_json_atomic<T: Serialize>(
    path: &Path,
    what: &'static str,
    value: &T,
) -> Result<(), PersistError> {
    let bytes =
        serde_json::to_vec(value).map_err(|source| PersistError::Encode { what, source })?;
    write_atomic(path, &bytes).await
}

/// Remove a file, treating "already gone" as success.
pub(crate) async fn remove_if_exists(path: &Path) -> Result<(), PersistError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PersistError::io(path, e)),
    }
}
