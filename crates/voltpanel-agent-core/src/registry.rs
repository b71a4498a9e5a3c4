//! Durable record of process definitions and their last known state.
//!
//! The whole record set lives in one JSON file (`{"apps": [...]}`) that is
//! rewritten on every upsert: serialized to a sibling temp file, synced, then
//! renamed over the original.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RegistryError;
use crate::process::ProcessRecord;

#[derive(Serialize)]
struct RegistryFileRef<'a> {
    apps: Vec<&'a ProcessRecord>,
}

#[derive(Deserialize)]
struct RegistryFile {
    #[serde(default)]
    apps: Vec<ProcessRecord>,
}

pub struct ProcessRegistry {
    path: PathBuf,
    records: Mutex<BTreeMap<String, ProcessRecord>>,
}

impl ProcessRegistry {
    /// Load the registry stored at `path`. A missing file is an empty registry.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let records = load(&path)?;
        debug!(path = %path.display(), records = records.len(), "Loaded process registry");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<String, ProcessRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace the record for its id and persist the full set.
    ///
    /// The in-memory copy only changes once the file has been written.
    pub fn upsert(&self, record: ProcessRecord) -> Result<(), RegistryError> {
        let mut records = self.records();
        self.write_through(&mut records, record)
    }

    /// Replace the stored record only while it still describes the same run
    /// (same start time). Returns `false` when a newer run is recorded.
    pub fn update_run(&self, record: ProcessRecord) -> Result<bool, RegistryError> {
        let mut records = self.records();
        if records
            .get(record.id())
            .is_some_and(|current| current.state.started_at != record.state.started_at)
        {
            return Ok(false);
        }
        self.write_through(&mut records, record)?;
        Ok(true)
    }

    fn write_through(
        &self,
        records: &mut BTreeMap<String, ProcessRecord>,
        record: ProcessRecord,
    ) -> Result<(), RegistryError> {
        let id = record.id().to_string();
        let previous = records.insert(id.clone(), record);

        if let Err(e) = persist(&self.path, records) {
            match previous {
                Some(previous) => records.insert(id, previous),
                None => records.remove(&id),
            };
            return Err(e);
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<ProcessRecord> {
        self.records().get(id).cloned()
    }

    /// Snapshot of every record, ordered by id
    pub fn list(&self) -> Vec<ProcessRecord> {
        self.records().values().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}

fn load(path: &Path) -> Result<BTreeMap<String, ProcessRecord>, RegistryError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(source) => {
            return Err(RegistryError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let file: RegistryFile =
        serde_json::from_slice(&bytes).map_err(|source| RegistryError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(file
        .apps
        .into_iter()
        .map(|record| (record.id().to_string(), record))
        .collect())
}

fn persist(path: &Path, records: &BTreeMap<String, ProcessRecord>) -> Result<(), RegistryError> {
    let body = serde_json::to_vec_pretty(&RegistryFileRef {
        apps: records.values().collect(),
    })?;

    let write_error = |source: std::io::Error| RegistryError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_error)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = fs::File::create(&tmp_path).map_err(write_error)?;
    file.write_all(&body).map_err(write_error)?;
    file.sync_all().map_err(write_error)?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(write_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessDefinition;
    use crate::process::ProcessRuntimeState;

    fn record(id: &str) -> ProcessRecord {
        ProcessRecord {
            definition: ProcessDefinition::builder()
                .id(id)
                .name(format!("{id} service"))
                .command("sleep")
                .args(["30"])
                .env("MODE", "test")
                .build()
                .unwrap(),
            state: ProcessRuntimeState::running(Some(100), PathBuf::from(format!("/logs/{id}.log"))),
        }
    }

    #[test]
    fn test_missing_file_is_empty_registry() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::open(tmp.path().join("apps.json")).unwrap();
        assert!(registry.is_empty());
        assert!(registry.get("anything").is_none());
    }

    #[test]
    fn test_upsert_is_durable() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("apps.json");

        let registry = ProcessRegistry::open(&path).unwrap();
        let mut web = record("web");
        let worker = record("worker");
        registry.upsert(web.clone()).unwrap();
        registry.upsert(worker.clone()).unwrap();

        web.state.mark_exited(3, chrono::Utc::now());
        registry.upsert(web.clone()).unwrap();

        let reopened = ProcessRegistry::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get("web"), Some(web));
        assert_eq!(reopened.get("worker"), Some(worker));
        assert!(!tmp.path().join("apps.json.tmp").exists());
    }

    #[test]
    fn test_file_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("apps.json");
        let registry = ProcessRegistry::open(&path).unwrap();
        registry.upsert(record("b")).unwrap();
        registry.upsert(record("a")).unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        let apps = value["apps"].as_array().unwrap();
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0]["id"], "a");
        assert_eq!(apps[1]["command"], "sleep");
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn test_stale_run_does_not_overwrite_newer_run() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("apps.json");
        let registry = ProcessRegistry::open(&path).unwrap();

        let mut old_run = record("web");
        registry.upsert(old_run.clone()).unwrap();

        let mut new_run = record("web");
        new_run.state.started_at = old_run.state.started_at + chrono::Duration::seconds(1);
        registry.upsert(new_run.clone()).unwrap();

        old_run.state.mark_exited(-1, chrono::Utc::now());
        assert!(!registry.update_run(old_run).unwrap());
        assert_eq!(registry.get("web"), Some(new_run.clone()));

        new_run.state.mark_exited(0, chrono::Utc::now());
        assert!(registry.update_run(new_run.clone()).unwrap());
        assert_eq!(ProcessRegistry::open(&path).unwrap().get("web"), Some(new_run));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("apps.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            ProcessRegistry::open(&path),
            Err(RegistryError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_failed_write_leaves_memory_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        // a directory where the file should be makes the rename fail
        let path = tmp.path().join("apps.json");
        let registry = ProcessRegistry::open(&path).unwrap();
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), b"x").unwrap();

        assert!(registry.upsert(record("web")).is_err());
        assert!(!registry.contains("web"));
    }
}
