//! Mutable wasm-instance status with an atomic on-disk checkpoint.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{YardError, YardResult};

/// Current version of the wasm instance status schema.
const STATUS_VERSION: &str = "v1";

/// Derived lifecycle state of a wasm instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    Running,
    Exited,
    Unknown,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Created => "CREATED",
            InstanceState::Running => "RUNNING",
            InstanceState::Exited => "EXITED",
            InstanceState::Unknown => "UNKNOWN",
        }
    }
}

/// Runtime resource constraints mirrored into the status checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub cpu_shares: i64,
    pub memory_limit_in_bytes: i64,
    pub oom_score_adj: i64,
    pub cpuset_cpus: String,
    pub cpuset_mems: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Status {
    /// Init process id of the wasm instance.
    pub pid: u32,

    /// Unix-nano timestamps; zero means "not reached".
    pub created_at: i64,
    pub started_at: i64,
    pub finished_at: i64,

    pub exit_code: i32,

    /// CamelCase summary of why the instance is in its current state.
    pub reason: String,
    /// Human-readable detail for the current state.
    pub message: String,

    /// Short-lived mutual-exclusion flags; at most one may be true.
    pub starting: bool,
    pub removing: bool,
    /// Set when the status could not be fully loaded.
    pub unknown: bool,

    pub resources: Option<Resources>,
}

impl Status {
    pub fn state(&self) -> InstanceState {
        if self.unknown {
            return InstanceState::Unknown;
        }
        if self.finished_at != 0 {
            return InstanceState::Exited;
        }
        if self.started_at != 0 {
            return InstanceState::Running;
        }
        if self.created_at != 0 {
            return InstanceState::Created;
        }
        InstanceState::Unknown
    }

    fn encode(&self) -> YardResult<Vec<u8>> {
        let versioned = VersionedStatus {
            version: STATUS_VERSION.to_string(),
            status: self.clone(),
        };
        Ok(serde_json::to_vec(&versioned)?)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VersionedStatus {
    version: String,
    #[serde(flatten)]
    status: Status,
}

/// Per-instance status storage.
///
/// `update` changes the in-memory value; `update_sync` additionally writes
/// the checkpoint while still holding the write lock, so no reader ever sees
/// an in-memory status newer than its disk copy.
pub struct StatusStorage {
    path: PathBuf,
    status: RwLock<Status>,
}

/// Creates the storage and writes the initial checkpoint in one step.
pub fn store_status(root: &Path, _id: &str, status: Status) -> YardResult<StatusStorage> {
    let path = root.join("status");
    let data = status
        .encode()
        .map_err(|e| e.context("failed to encode status"))?;
    atomic_write(&path, &data)
        .map_err(|e| e.context(format!("failed to checkpoint status to {}", path.display())))?;
    Ok(StatusStorage {
        path,
        status: RwLock::new(status),
    })
}

/// Loads a checkpoint from disk, rejecting unknown schema versions.
pub fn load_status(root: &Path, id: &str) -> YardResult<Status> {
    let path = root.join("status");
    let data = std::fs::read(&path).map_err(|e| {
        YardError::internal(format!(
            "failed to read status checkpoint for {id:?} from {}: {e}",
            path.display()
        ))
    })?;
    let versioned: VersionedStatus = serde_json::from_slice(&data)
        .map_err(|e| YardError::internal(format!("failed to decode status for {id:?}: {e}")))?;
    if versioned.version != STATUS_VERSION {
        return Err(YardError::internal(format!(
            "unsupported status version {:?} for {id:?}",
            versioned.version
        )));
    }
    Ok(versioned.status)
}

impl StatusStorage {
    pub fn get(&self) -> Status {
        self.status.read().unwrap().clone()
    }

    /// Applies the update in memory. Rolled back (not applied) if the
    /// closure fails.
    pub fn update<F>(&self, update: F) -> YardResult<()>
    where
        F: FnOnce(Status) -> YardResult<Status>,
    {
        let mut status = self.status.write().unwrap();
        let new_status = update(status.clone())?;
        *status = new_status;
        Ok(())
    }

    /// Applies the update and checkpoints it to disk in one transaction.
    pub fn update_sync<F>(&self, update: F) -> YardResult<()>
    where
        F: FnOnce(Status) -> YardResult<Status>,
    {
        let mut status = self.status.write().unwrap();
        let new_status = update(status.clone())?;
        let data = new_status
            .encode()
            .map_err(|e| e.context("failed to encode status"))?;
        atomic_write(&self.path, &data).map_err(|e| {
            e.context(format!(
                "failed to checkpoint status to {}",
                self.path.display()
            ))
        })?;
        *status = new_status;
        Ok(())
    }

    /// Deletes the checkpoint file.
    pub fn delete(&self) -> YardResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(YardError::internal(format!(
                "failed to delete status checkpoint {}: {e}",
                self.path.display()
            ))),
        }
    }
}

/// Write-temp, fsync, rename. A crash leaves either the old or the new
/// checkpoint, never a torn one.
fn atomic_write(path: &Path, data: &[u8]) -> YardResult<()> {
    use std::io::Write as _;

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(data)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_created() -> Status {
        Status {
            created_at: 1_700_000_000_000_000_000,
            ..Status::default()
        }
    }

    #[test]
    fn state_derivation() {
        let mut s = Status::default();
        assert_eq!(s.state(), InstanceState::Unknown);

        s.created_at = 1;
        assert_eq!(s.state(), InstanceState::Created);

        s.started_at = 2;
        assert_eq!(s.state(), InstanceState::Running);

        s.finished_at = 3;
        assert_eq!(s.state(), InstanceState::Exited);

        s.unknown = true;
        assert_eq!(s.state(), InstanceState::Unknown);
    }

    #[test]
    fn status_round_trips_through_checkpoint() {
        let td = tempfile::tempdir().unwrap();
        let original = Status {
            pid: 42,
            created_at: 1,
            started_at: 2,
            finished_at: 3,
            exit_code: 137,
            reason: "Error".to_string(),
            message: "killed".to_string(),
            starting: false,
            removing: true,
            unknown: false,
            resources: Some(Resources {
                cpu_shares: 512,
                memory_limit_in_bytes: 1 << 20,
                ..Resources::default()
            }),
        };

        store_status(td.path(), "inst-1", original.clone()).unwrap();
        let loaded = load_status(td.path(), "inst-1").unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(
            td.path().join("status"),
            br#"{"Version":"v0","Pid":0,"CreatedAt":1,"StartedAt":0,"FinishedAt":0,"ExitCode":0,"Reason":"","Message":"","Starting":false,"Removing":false,"Unknown":false,"Resources":null}"#,
        )
        .unwrap();
        let err = load_status(td.path(), "inst-1").unwrap_err();
        assert!(err.to_string().contains("unsupported status version"));
    }

    #[test]
    fn update_sync_persists_under_the_same_lock_window() {
        let td = tempfile::tempdir().unwrap();
        let storage = store_status(td.path(), "inst-1", status_created()).unwrap();

        storage
            .update_sync(|mut s| {
                s.started_at = 7;
                s.pid = 99;
                Ok(s)
            })
            .unwrap();

        let on_disk = load_status(td.path(), "inst-1").unwrap();
        assert_eq!(on_disk, storage.get());
        assert_eq!(on_disk.pid, 99);
    }

    #[test]
    fn failed_update_leaves_status_untouched() {
        let td = tempfile::tempdir().unwrap();
        let storage = store_status(td.path(), "inst-1", status_created()).unwrap();

        let err = storage
            .update(|_s| Err(YardError::failed_precondition("nope")))
            .unwrap_err();
        assert!(matches!(err, YardError::FailedPrecondition(_)));
        assert_eq!(storage.get(), status_created());
    }

    #[test]
    fn delete_is_idempotent() {
        let td = tempfile::tempdir().unwrap();
        let storage = store_status(td.path(), "inst-1", status_created()).unwrap();
        storage.delete().unwrap();
        storage.delete().unwrap();
        assert!(load_status(td.path(), "inst-1").is_err());
    }
}
