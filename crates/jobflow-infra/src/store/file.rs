//! File-backed run store.
//!
//! Directory layout:
//! ```text
//! {root}/
//!   runs/{run_id}.json
//!   manifests/{run_id}/{step_id}.json
//!   outputs/{run_id}/{step_id}.json
//!   attempts/{run_id}/{attempt_n}.json
//! ```
//!
//! Every record is pretty-printed JSON so runs can be inspected and replayed
//! offline.

use std::path::{Path, PathBuf};

use jobflow_core::repository::run_store::{RunStore, manifest_ref, new_run_id, output_ref};
use jobflow_types::error::RepositoryError;
use jobflow_types::run::{AttemptRecord, RunRecord, StepManifest};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

const RUNS_DIR: &str = "runs";
const MANIFESTS_DIR: &str = "manifests";
const OUTPUTS_DIR: &str = "outputs";
const ATTEMPTS_DIR: &str = "attempts";

/// Run store persisting JSON documents under a root directory.
#[derive(Debug, Clone)]
pub struct FileRunStore {
    root: PathBuf,
}

impl FileRunStore {
    /// Create a store rooted at `root`. Directories are created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_path(&self, run_id: &str) -> Result<PathBuf, RepositoryError> {
        Ok(self
            .root
            .join(RUNS_DIR)
            .join(format!("{}.json", component(run_id)?)))
    }

    fn step_path(
        &self,
        dir: &str,
        run_id: &str,
        step_id: &str,
    ) -> Result<PathBuf, RepositoryError> {
        Ok(self
            .root
            .join(dir)
            .join(component(run_id)?)
            .join(format!("{}.json", component(step_id)?)))
    }

    fn attempts_dir(&self, run_id: &str) -> Result<PathBuf, RepositoryError> {
        Ok(self.root.join(ATTEMPTS_DIR).join(component(run_id)?))
    }

    fn attempt_path(&self, run_id: &str, attempt_n: u32) -> Result<PathBuf, RepositoryError> {
        Ok(self.attempts_dir(run_id)?.join(format!("{attempt_n}.json")))
    }
}

/// Ids become file names, so they must be single, non-special path components.
fn component(id: &str) -> Result<&str, RepositoryError> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\', '\0']) {
        return Err(RepositoryError::Io(format!(
            "'{id}' is not usable as a store path component"
        )));
    }
    Ok(id)
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), RepositoryError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, bytes).await?;
    tracing::debug!(path = %path.display(), "stored record");
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, RepositoryError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// File names directly inside `dir`; a missing directory has none.
async fn file_names(dir: &Path) -> Result<Vec<String>, RepositoryError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

impl RunStore for FileRunStore {
    async fn create_run(
        &self,
        job_id: &str,
        job_def_sha256: &str,
        envelope: &Value,
    ) -> Result<RunRecord, RepositoryError> {
        let run = RunRecord::start(new_run_id(), job_id, job_def_sha256, envelope.clone());
        let path = self.run_path(&run.run_id)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = serde_json::to_vec_pretty(&run)?;
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(RepositoryError::Conflict(format!(
                    "run '{}' already exists",
                    run.run_id
                )));
            }
            Err(err) => return Err(err.into()),
        };
        file.write_all(&bytes).await?;
        file.flush().await?;

        tracing::debug!(run_id = %run.run_id, job_id, "created run record");
        Ok(run)
    }

    async fn update_run(&self, run: &RunRecord) -> Result<(), RepositoryError> {
        let path = self.run_path(&run.run_id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(RepositoryError::NotFound);
        }
        write_json(&path, run).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, RepositoryError> {
        read_json(&self.run_path(run_id)?).await
    }

    async fn list_runs(&self, job_id: &str) -> Result<Vec<RunRecord>, RepositoryError> {
        let dir = self.root.join(RUNS_DIR);
        let mut runs = Vec::new();
        for name in file_names(&dir).await? {
            if !name.ends_with(".json") {
                continue;
            }
            let path = dir.join(&name);
            match read_json::<RunRecord>(&path).await {
                Ok(Some(run)) if run.job_id == job_id => runs.push(run),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "skipping unreadable run record"
                    );
                }
            }
        }
        runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(runs)
    }

    async fn store_manifest(&self, manifest: &StepManifest) -> Result<String, RepositoryError> {
        let path = self.step_path(MANIFESTS_DIR, &manifest.run_id, &manifest.step_id)?;
        write_json(&path, manifest).await?;
        Ok(manifest_ref(&manifest.run_id, &manifest.step_id))
    }

    async fn get_manifest(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<Option<StepManifest>, RepositoryError> {
        read_json(&self.step_path(MANIFESTS_DIR, run_id, step_id)?).await
    }

    async fn store_output(
        &self,
        run_id: &str,
        step_id: &str,
        output: &Value,
    ) -> Result<String, RepositoryError> {
        let path = self.step_path(OUTPUTS_DIR, run_id, step_id)?;
        write_json(&path, output).await?;
        Ok(output_ref(run_id, step_id))
    }

    async fn get_output(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<Option<Value>, RepositoryError> {
        read_json(&self.step_path(OUTPUTS_DIR, run_id, step_id)?).await
    }

    async fn store_attempt(&self, attempt: &AttemptRecord) -> Result<(), RepositoryError> {
        let path = self.attempt_path(&attempt.run_id, attempt.attempt_n)?;
        write_json(&path, attempt).await
    }

    async fn get_attempt(
        &self,
        run_id: &str,
        attempt_n: u32,
    ) -> Result<Option<AttemptRecord>, RepositoryError> {
        read_json(&self.attempt_path(run_id, attempt_n)?).await
    }

    async fn get_latest_attempt(
        &self,
        run_id: &str,
    ) -> Result<Option<AttemptRecord>, RepositoryError> {
        let latest = file_names(&self.attempts_dir(run_id)?)
            .await?
            .iter()
            .filter_map(|name| name.strip_suffix(".json")?.parse::<u32>().ok())
            .max();
        match latest {
            Some(attempt_n) => self.get_attempt(run_id, attempt_n).await,
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_types::job::{Backend, Op};
    use jobflow_types::run::{AttemptStatus, RunStatus, StepOutcome};
    use serde_json::{Map, json};
    use tempfile::TempDir;

    fn manifest(run_id: &str, step_id: &str) -> StepManifest {
        let mut resolved_params = Map::new();
        resolved_params.insert("table".into(), json!("events"));
        StepManifest {
            run_id: run_id.into(),
            step_id: step_id.into(),
            backend: Backend::Storage,
            op: Op::ReadTable,
            resolved_params,
            prompt_hash: None,
            idempotency_key: format!("{run_id}:{step_id}"),
            timeout_s: 60,
        }
    }

    #[tokio::test]
    async fn run_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let store = FileRunStore::new(tmp.path());

        let mut run = store
            .create_run("nightly", "abc", &json!({"job_id": "nightly"}))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(tmp.path().join("runs").join(format!("{}.json", run.run_id)).is_file());

        run.rows_read = 7;
        run.finish(RunStatus::Success);
        store.update_run(&run).await.unwrap();

        let loaded = store.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded, run);
        assert!(store.get_run("01ARZ3NDEKTSV4RRFFQ69G5FAV").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_of_unknown_run_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = FileRunStore::new(tmp.path());
        let run = RunRecord::start("01ARZ3NDEKTSV4RRFFQ69G5FAV", "nightly", "abc", json!({}));
        assert!(matches!(
            store.update_run(&run).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn list_runs_filters_by_job_and_sorts() {
        let tmp = TempDir::new().unwrap();
        let store = FileRunStore::new(tmp.path());
        assert!(store.list_runs("nightly").await.unwrap().is_empty());

        let first = store.create_run("nightly", "a", &json!({})).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store.create_run("hourly", "b", &json!({})).await.unwrap();
        let second = store.create_run("nightly", "a", &json!({})).await.unwrap();
        tokio::fs::write(tmp.path().join("runs").join("garbage.json"), "{")
            .await
            .unwrap();

        let runs = store.list_runs("nightly").await.unwrap();
        let ids: Vec<&str> = runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec![first.run_id.as_str(), second.run_id.as_str()]);
    }

    #[tokio::test]
    async fn manifests_and_outputs_follow_layout() {
        let tmp = TempDir::new().unwrap();
        let store = FileRunStore::new(tmp.path());

        let m = manifest("R1", "load");
        let reference = store.store_manifest(&m).await.unwrap();
        assert_eq!(reference, "manifests/R1/load.json");
        assert!(tmp.path().join(&reference).is_file());
        assert_eq!(store.get_manifest("R1", "load").await.unwrap(), Some(m));

        let reference = store
            .store_output("R1", "load", &json!({"rows_read": 3}))
            .await
            .unwrap();
        assert_eq!(reference, "outputs/R1/load.json");
        assert!(tmp.path().join(&reference).is_file());
        assert_eq!(
            store.get_output("R1", "load").await.unwrap(),
            Some(json!({"rows_read": 3}))
        );
        assert!(store.get_output("R1", "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn later_writes_overwrite() {
        let tmp = TempDir::new().unwrap();
        let store = FileRunStore::new(tmp.path());
        store.store_output("R1", "s1", &json!({"n": 1})).await.unwrap();
        store.store_output("R1", "s1", &json!({"n": 2})).await.unwrap();
        assert_eq!(
            store.get_output("R1", "s1").await.unwrap(),
            Some(json!({"n": 2}))
        );
    }

    #[tokio::test]
    async fn latest_attempt_is_numeric_max() {
        let tmp = TempDir::new().unwrap();
        let store = FileRunStore::new(tmp.path());
        assert!(store.get_latest_attempt("R1").await.unwrap().is_none());

        for n in [1, 2, 10] {
            let mut attempt = AttemptRecord::start("R1", n);
            attempt.step_outcomes.push(StepOutcome::skipped("s1"));
            attempt.finish(AttemptStatus::Completed);
            store.store_attempt(&attempt).await.unwrap();
        }

        let latest = store.get_latest_attempt("R1").await.unwrap().unwrap();
        assert_eq!(latest.attempt_n, 10);
        assert_eq!(store.get_attempt("R1", 2).await.unwrap().unwrap().attempt_n, 2);
        assert!(tmp.path().join("attempts/R1/10.json").is_file());
    }

    #[tokio::test]
    async fn ids_must_be_plain_components() {
        let tmp = TempDir::new().unwrap();
        let store = FileRunStore::new(tmp.path());
        assert!(matches!(
            store.store_manifest(&manifest("R1", "../escape")).await,
            Err(RepositoryError::Io(_))
        ));
        assert!(store.get_run("..").await.is_err());
    }

    #[tokio::test]
    async fn corrupt_record_is_a_serialization_error() {
        let tmp = TempDir::new().unwrap();
        let store = FileRunStore::new(tmp.path());
        tokio::fs::create_dir_all(tmp.path().join("runs")).await.unwrap();
        tokio::fs::write(tmp.path().join("runs/R1.json"), "not json")
            .await
            .unwrap();
        assert!(matches!(
            store.get_run("R1").await,
            Err(RepositoryError::Serialization(_))
        ));
    }
}
