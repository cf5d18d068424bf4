use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use super::{validate_script_name, CheckpointError, CheckpointStore};

/// Whether checkpoints survive the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPolicy {
    Persist,
    /// Reads report "no checkpoint" and writes are dropped, so every run cold-starts.
    Ephemeral,
}

impl CheckpointPolicy {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            Self::Persist
        } else {
            Self::Ephemeral
        }
    }
}

/// Stores each script's cursor as a decimal string in `<dir>/<script_name>.state`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    policy: CheckpointPolicy,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, policy: CheckpointPolicy) -> Self {
        Self {
            dir: dir.into(),
            policy,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn policy(&self) -> CheckpointPolicy {
        self.policy
    }

    pub fn state_path(&self, script_name: &str) -> PathBuf {
        self.dir.join(format!("{script_name}.state"))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, script_name: &str) -> Option<u64> {
        if self.policy == CheckpointPolicy::Ephemeral {
            return None;
        }
        if let Err(err) = validate_script_name(script_name) {
            warn!(event = "checkpoint_load_rejected", error = %err, "ignoring checkpoint");
            return None;
        }

        let path = self.state_path(script_name);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) => {
                debug!(
                    event = "checkpoint_unreadable",
                    script = script_name,
                    path = %path.display(),
                    error = %err,
                    "no readable checkpoint"
                );
                return None;
            }
        };

        match raw.trim().parse::<u64>() {
            Ok(sequence_id) => Some(sequence_id),
            Err(err) => {
                warn!(
                    event = "checkpoint_corrupt",
                    script = script_name,
                    path = %path.display(),
                    error = %err,
                    "checkpoint content is not a sequence id"
                );
                None
            }
        }
    }

    fn save(&self, script_name: &str, sequence_id: u64) -> Result<(), CheckpointError> {
        if self.policy == CheckpointPolicy::Ephemeral {
            debug!(
                event = "checkpoint_save_suppressed",
                script = script_name,
                sequence_id,
                "ephemeral checkpoints; skipping write"
            );
            return Ok(());
        }
        validate_script_name(script_name)?;

        fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;
        let path = self.state_path(script_name);
        let tmp_path = self.dir.join(format!("{script_name}.state.tmp"));

        let mut file = fs::File::create(&tmp_path).map_err(io_error(&tmp_path))?;
        file.write_all(sequence_id.to_string().as_bytes())
            .map_err(io_error(&tmp_path))?;
        file.sync_all().map_err(io_error(&tmp_path))?;
        drop(file);

        fs::rename(&tmp_path, &path).map_err(io_error(&path))?;
        Ok(())
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError {
    let path = path.to_path_buf();
    move |source| CheckpointError::Io { path, source }
}

/// Process-local store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<String, u64>>,
    history: Mutex<Vec<(String, u64)>>,
}

impl MemoryCheckpointStore {
    pub fn with_entry(script_name: &str, sequence_id: u64) -> Self {
        let store = Self::default();
        store
            .entries
            .lock()
            .expect("checkpoint mutex poisoned")
            .insert(script_name.to_string(), sequence_id);
        store
    }

    /// Every value saved for `script_name`, oldest first.
    pub fn saved_values(&self, script_name: &str) -> Vec<u64> {
        self.history
            .lock()
            .expect("checkpoint history mutex poisoned")
            .iter()
            .filter(|(name, _)| name == script_name)
            .map(|(_, value)| *value)
            .collect()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, script_name: &str) -> Option<u64> {
        self.entries
            .lock()
            .expect("checkpoint mutex poisoned")
            .get(script_name)
            .copied()
    }

    fn save(&self, script_name: &str, sequence_id: u64) -> Result<(), CheckpointError> {
        validate_script_name(script_name)?;
        self.entries
            .lock()
            .expect("checkpoint mutex poisoned")
            .insert(script_name.to_string(), sequence_id);
        self.history
            .lock()
            .expect("checkpoint history mutex poisoned")
            .push((script_name.to_string(), sequence_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{CheckpointPolicy, FileCheckpointStore, MemoryCheckpointStore};
    use crate::checkpoint::{CheckpointError, CheckpointStore};

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        let store = FileCheckpointStore::new(dir.path(), CheckpointPolicy::Persist);
        assert_eq!(store.load("notifyUserCreated"), None);
    }

    #[test]
    fn save_then_load_round_trips_and_overwrites() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        let store = FileCheckpointStore::new(dir.path().join("cache"), CheckpointPolicy::Persist);

        store.save("notifyUserCreated", 1042).expect("save succeeds");
        assert_eq!(store.load("notifyUserCreated"), Some(1042));
        store.save("notifyUserCreated", 1047).expect("save succeeds");
        assert_eq!(store.load("notifyUserCreated"), Some(1047));

        let raw = std::fs::read_to_string(store.state_path("notifyUserCreated"))
            .expect("state file exists");
        assert_eq!(raw, "1047");
        assert!(!dir.path().join("cache/notifyUserCreated.state.tmp").exists());
    }

    #[test]
    fn garbage_and_negative_content_load_as_none() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        let store = FileCheckpointStore::new(dir.path(), CheckpointPolicy::Persist);

        std::fs::write(store.state_path("a"), "not-a-number").expect("write fixture");
        std::fs::write(store.state_path("b"), "-5").expect("write fixture");
        std::fs::write(store.state_path("c"), " 77\n").expect("write fixture");

        assert_eq!(store.load("a"), None);
        assert_eq!(store.load("b"), None);
        assert_eq!(store.load("c"), Some(77));
    }

    #[test]
    fn scripts_do_not_share_checkpoints() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        let store = FileCheckpointStore::new(dir.path(), CheckpointPolicy::Persist);
        store.save("notifyUserCreated", 10).expect("save succeeds");
        assert_eq!(store.load("notifyUserUpdated"), None);
    }

    #[test]
    fn ephemeral_policy_never_touches_disk() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        let store = FileCheckpointStore::new(dir.path(), CheckpointPolicy::Ephemeral);
        std::fs::write(store.state_path("notifyUserCreated"), "99").expect("write fixture");

        assert_eq!(store.load("notifyUserCreated"), None);
        store.save("notifyUserCreated", 100).expect("suppressed save is ok");
        let raw = std::fs::read_to_string(store.state_path("notifyUserCreated"))
            .expect("fixture remains");
        assert_eq!(raw, "99");
    }

    #[test]
    fn path_like_script_names_are_rejected() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        let store = FileCheckpointStore::new(dir.path(), CheckpointPolicy::Persist);
        let err = store.save("../escape", 1).expect_err("name rejected");
        assert!(matches!(err, CheckpointError::InvalidScriptName(_)));
        assert_eq!(store.load("../escape"), None);
    }

    #[test]
    fn memory_store_records_history() {
        let store = MemoryCheckpointStore::with_entry("script", 5);
        assert_eq!(store.load("script"), Some(5));
        store.save("script", 6).expect("save succeeds");
        store.save("script", 9).expect("save succeeds");
        assert_eq!(store.saved_values("script"), vec![6, 9]);
    }
}
