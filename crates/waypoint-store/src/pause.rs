use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::info;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::PauseChannel;
use waypoint_core::types::SessionId;

/// Pause flags as marker files, one per session. Setting a flag from another
/// process (e.g. `waypoint pause`) is picked up at the next node boundary.
pub struct FilePauseFlags {
    dir: PathBuf,
}

impl FilePauseFlags {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn flag_path(&self, session: &SessionId) -> PathBuf {
        let name: String = session
            .0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.pause", name))
    }
}

impl PauseChannel for FilePauseFlags {
    fn request_pause(&self, session: &SessionId) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.flag_path(session), chrono::Utc::now().to_rfc3339())?;
        info!(session_id = %session, "Pause requested");
        Ok(())
    }

    fn take_pause(&self, session: &SessionId) -> Result<bool> {
        // Removal is the atomic check-and-clear: only one taker can succeed.
        match std::fs::remove_file(self.flag_path(session)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(WaypointError::Io(e)),
        }
    }

    fn is_pause_requested(&self, session: &SessionId) -> Result<bool> {
        Ok(self.flag_path(session).exists())
    }
}

#[derive(Default)]
pub struct InMemoryPauseFlags {
    flags: Mutex<HashSet<SessionId>>,
}

impl InMemoryPauseFlags {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashSet<SessionId>>> {
        self.flags
            .lock()
            .map_err(|e| WaypointError::Persistence(e.to_string()))
    }
}

impl PauseChannel for InMemoryPauseFlags {
    fn request_pause(&self, session: &SessionId) -> Result<()> {
        self.lock()?.insert(session.clone());
        Ok(())
    }

    fn take_pause(&self, session: &SessionId) -> Result<bool> {
        Ok(self.lock()?.remove(session))
    }

    fn is_pause_requested(&self, session: &SessionId) -> Result<bool> {
        Ok(self.lock()?.contains(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_flag_is_taken_once() {
        let dir = tempfile::tempdir().unwrap();
        let flags = FilePauseFlags::new(dir.path().join("pause"));
        let session = SessionId::from_string("sess-1");

        assert!(!flags.take_pause(&session).unwrap());
        flags.request_pause(&session).unwrap();
        assert!(flags.is_pause_requested(&session).unwrap());
        assert!(flags.take_pause(&session).unwrap());
        assert!(!flags.take_pause(&session).unwrap());
        assert!(!flags.is_pause_requested(&session).unwrap());
    }

    #[test]
    fn file_flags_are_session_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let flags = FilePauseFlags::new(dir.path());
        let a = SessionId::from_string("a");
        let b = SessionId::from_string("b");
        flags.request_pause(&a).unwrap();
        assert!(!flags.take_pause(&b).unwrap());
        assert!(flags.take_pause(&a).unwrap());
    }

    #[test]
    fn memory_flags() {
        let flags = InMemoryPauseFlags::new();
        let s = SessionId::from_string("s");
        flags.request_pause(&s).unwrap();
        assert!(flags.take_pause(&s).unwrap());
        assert!(!flags.is_pause_requested(&s).unwrap());
    }
}
