//! Crash-safe file replacement.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use waypoint_core::error::{Result, WaypointError};

/// Replace `path` with `data` via write-temp, fsync, rename.
///
/// A crash leaves either the old file or the new one, never a torn write.
/// Temp names are unique so concurrent writers of the same path do not
/// clobber each other's temp file.
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            WaypointError::Persistence(format!("create {}: {}", parent.display(), e))
        })?;
    }

    let temp = temp_path(path);
    let mut file = fs::File::create(&temp)
        .await
        .map_err(|e| WaypointError::Persistence(format!("create {}: {}", temp.display(), e)))?;
    file.write_all(data)
        .await
        .map_err(|e| WaypointError::Persistence(format!("write {}: {}", temp.display(), e)))?;
    file.sync_all()
        .await
        .map_err(|e| WaypointError::Persistence(format!("sync {}: {}", temp.display(), e)))?;
    drop(file);

    if let Err(e) = fs::rename(&temp, path).await {
        let _ = fs::remove_file(&temp).await;
        return Err(WaypointError::Persistence(format!(
            "rename {}: {}",
            path.display(),
            e
        )));
    }
    Ok(())
}

/// Read a file, mapping "not found" to `None`.
pub async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(WaypointError::Persistence(format!(
            "read {}: {}",
            path.display(),
            e
        ))),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replaces_content_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.json");

        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_optional(&dir.path().join("absent")).await.unwrap().is_none());
    }
}
