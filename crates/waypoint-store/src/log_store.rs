use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use waypoint_core::error::Result;
use waypoint_core::evolution::AuditEntry;
use waypoint_core::traits::RuntimeLogStore;

/// Append-only JSONL sink for evolution audit entries.
///
/// One JSON object per line, flushed per entry, so every line written before
/// a crash stays intact.
pub struct JsonlLogStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlLogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every entry, skipping lines that fail to parse.
    pub async fn read_all(&self) -> Result<Vec<AuditEntry>> {
        read_audit_log(&self.path).await
    }
}

impl RuntimeLogStore for JsonlLogStore {
    fn write(&self, entry: &AuditEntry) -> BoxFuture<'_, Result<()>> {
        let line = serde_json::to_string(entry).map(|json| format!("{}\n", json));
        Box::pin(async move {
            let line = line?;
            let _guard = self.write_lock.lock().await;

            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;

            debug!(path = %self.path.display(), "Audit entry appended");
            Ok(())
        })
    }
}

/// Parse a JSONL audit log. A missing file is an empty log.
pub async fn read_audit_log(path: &Path) -> Result<Vec<AuditEntry>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    };
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}
