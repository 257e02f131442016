//! Job sources: the `JobSource` port and the caching filesystem registry.
//!
//! `JobRegistry` searches a definitions root recursively for `{job_id}.yaml`,
//! `{job_id}.yml` or `{job_id}.json`. When one id exists in several formats the
//! extension order above decides; among files of the same format the
//! lexicographically smallest path wins.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use jobflow_types::job::JobDef;

use super::definition::{
    DefinitionFormat, RegistryError, check_structure, discover_definition_files, file_job_id,
    load_job_file,
};
use super::hash::compute_hash;

/// Version selector meaning "whatever is current".
pub const LATEST: &str = "latest";

fn is_latest(version: Option<&str>) -> bool {
    matches!(version, None | Some(LATEST))
}

/// Anything that can produce a validated `JobDef` by id.
///
/// Object safe, so engines can hold an `Arc<dyn JobSource>`.
pub trait JobSource: Send + Sync {
    /// Load a job definition.
    ///
    /// `version` of `None` or `"latest"` accepts whatever version is present;
    /// any other value must match exactly or the job is reported as not found.
    fn load(&self, job_id: &str, version: Option<&str>) -> Result<JobDef, RegistryError>;
}

/// Validate a loaded definition against the id and version it was requested by.
fn verify_loaded(def: &JobDef, job_id: &str, version: Option<&str>) -> Result<(), RegistryError> {
    if def.job_id != job_id {
        return Err(RegistryError::Validation {
            job_id: job_id.to_string(),
            reason: format!("file declares job_id '{}'", def.job_id),
        });
    }
    check_structure(def).map_err(|e| RegistryError::Validation {
        job_id: job_id.to_string(),
        reason: e.to_string(),
    })?;
    if let Some(v) = version.filter(|v| *v != LATEST) {
        if def.version != v {
            return Err(RegistryError::NotFound {
                job_id: job_id.to_string(),
                version: Some(v.to_string()),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem registry
// ---------------------------------------------------------------------------

/// Caching registry over a definitions directory.
#[derive(Debug)]
pub struct JobRegistry {
    root: PathBuf,
    /// Latest-version cache keyed by job_id.
    cache: DashMap<String, JobDef>,
    /// Content hash -> definition, filled on every successful load.
    hash_index: DashMap<String, JobDef>,
}

impl JobRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: DashMap::new(),
            hash_index: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The preferred definition file for `job_id`, if any.
    fn find_file(&self, job_id: &str) -> Result<Option<PathBuf>, RegistryError> {
        let files = discover_definition_files(&self.root)?;
        Ok(files
            .into_iter()
            .filter(|p| file_job_id(p) == Some(job_id))
            .min_by(|a, b| {
                DefinitionFormat::preference(a)
                    .cmp(&DefinitionFormat::preference(b))
                    .then_with(|| a.cmp(b))
            }))
    }

    /// Preferred file per job id, across all formats.
    fn files_by_job(&self) -> Result<Vec<(String, PathBuf)>, RegistryError> {
        let mut best: HashMap<String, PathBuf> = HashMap::new();
        for path in discover_definition_files(&self.root)? {
            let Some(job_id) = file_job_id(&path).map(str::to_string) else {
                continue;
            };
            let replace = match best.get(&job_id) {
                Some(current) => {
                    (DefinitionFormat::preference(&path), &path)
                        < (DefinitionFormat::preference(current), current)
                }
                None => true,
            };
            if replace {
                best.insert(job_id, path);
            }
        }
        let mut out: Vec<(String, PathBuf)> = best.into_iter().collect();
        out.sort();
        Ok(out)
    }

    fn load_uncached(&self, job_id: &str, version: Option<&str>) -> Result<JobDef, RegistryError> {
        let path = self.find_file(job_id)?.ok_or_else(|| RegistryError::NotFound {
            job_id: job_id.to_string(),
            version: version.map(str::to_string),
        })?;
        let def = load_job_file(&path)?;
        verify_loaded(&def, job_id, version)?;

        let sha = compute_hash(&def).map_err(|e| RegistryError::Validation {
            job_id: job_id.to_string(),
            reason: format!("cannot hash definition: {e}"),
        })?;
        self.hash_index.insert(sha, def.clone());
        tracing::debug!(
            job_id,
            version = %def.version,
            path = %path.display(),
            "loaded job definition"
        );
        Ok(def)
    }

    /// Sorted job ids, excluding deprecated definitions.
    ///
    /// Files that fail to parse are skipped with a warning.
    pub fn list_jobs(&self) -> Result<Vec<String>, RegistryError> {
        let mut ids = BTreeSet::new();
        for (job_id, path) in self.files_by_job()? {
            match load_job_file(&path) {
                Ok(def) if def.is_deprecated() => {
                    tracing::debug!(job_id, "skipping deprecated job");
                }
                Ok(_) => {
                    ids.insert(job_id);
                }
                Err(err) => {
                    tracing::warn!(?path, %err, "skipping unparseable job definition");
                }
            }
        }
        Ok(ids.into_iter().collect())
    }

    /// Load and validate every definition under the root, failing on the first error.
    ///
    /// Returns the number of jobs loaded.
    pub fn preload_all(&self) -> Result<usize, RegistryError> {
        let jobs = self.files_by_job()?;
        for (job_id, _) in &jobs {
            self.load(job_id, None)?;
        }
        tracing::info!(
            count = jobs.len(),
            root = %self.root.display(),
            "preloaded job definitions"
        );
        Ok(jobs.len())
    }

    /// A previously loaded definition by content hash.
    pub fn get_by_hash(&self, sha256: &str) -> Option<JobDef> {
        self.hash_index.get(sha256).map(|d| d.clone())
    }

    /// Job id of a previously loaded definition by content hash.
    pub fn job_id_for_hash(&self, sha256: &str) -> Option<String> {
        self.hash_index.get(sha256).map(|d| d.job_id.clone())
    }

    /// Drop the cached latest definition for one job.
    pub fn invalidate(&self, job_id: &str) {
        self.cache.remove(job_id);
    }

    pub fn clear(&self) {
        self.cache.clear();
        self.hash_index.clear();
    }
}

impl JobSource for JobRegistry {
    fn load(&self, job_id: &str, version: Option<&str>) -> Result<JobDef, RegistryError> {
        let cacheable = is_latest(version);
        if cacheable {
            if let Some(def) = self.cache.get(job_id) {
                return Ok(def.clone());
            }
        }
        let def = self.load_uncached(job_id, version)?;
        if cacheable {
            self.cache.insert(job_id.to_string(), def.clone());
        }
        Ok(def)
    }
}

// ---------------------------------------------------------------------------
// In-memory source
// ---------------------------------------------------------------------------

/// Job source over definitions held in memory.
///
/// Several versions of one job may be registered; an unversioned load returns
/// the most recently inserted.
#[derive(Debug, Default, Clone)]
pub struct MemoryJobSource {
    jobs: HashMap<String, Vec<JobDef>>,
}

impl MemoryJobSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, def: JobDef) {
        self.jobs.entry(def.job_id.clone()).or_default().push(def);
    }

    pub fn with_job(mut self, def: JobDef) -> Self {
        self.insert(def);
        self
    }
}

impl JobSource for MemoryJobSource {
    fn load(&self, job_id: &str, version: Option<&str>) -> Result<JobDef, RegistryError> {
        let not_found = || RegistryError::NotFound {
            job_id: job_id.to_string(),
            version: version.map(str::to_string),
        };
        let versions = self.jobs.get(job_id).ok_or_else(not_found)?;
        let def = if is_latest(version) {
            versions.last()
        } else {
            versions.iter().rev().find(|d| Some(d.version.as_str()) == version)
        }
        .ok_or_else(not_found)?;
        verify_loaded(def, job_id, version)?;
        Ok(def.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_types::job::{Op, StepDef};
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    fn yaml(job_id: &str, version: &str) -> String {
        format!("job_id: {job_id}\nversion: \"{version}\"\nsteps:\n  - step_id: s1\n    op: noop\n")
    }

    #[test]
    fn loads_from_nested_directories() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "team/etl/nightly.yaml", &yaml("nightly", "1.0.0"));
        let registry = JobRegistry::new(tmp.path());

        let def = registry.load("nightly", None).unwrap();
        assert_eq!(def.version, "1.0.0");
        assert_eq!(def.steps[0].op, Op::Noop);
    }

    #[test]
    fn missing_job_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let registry = JobRegistry::new(tmp.path());
        assert!(matches!(
            registry.load("ghost", None),
            Err(RegistryError::NotFound { version: None, .. })
        ));
    }

    #[test]
    fn yaml_preferred_over_json() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "nightly.json",
            r#"{"job_id": "nightly", "version": "json",
                "steps": [{"step_id": "s1", "op": "noop"}]}"#,
        );
        write(tmp.path(), "nightly.yaml", &yaml("nightly", "yaml"));
        let registry = JobRegistry::new(tmp.path());
        assert_eq!(registry.load("nightly", None).unwrap().version, "yaml");
    }

    #[test]
    fn declared_id_mismatch_is_validation_error() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "nightly.yaml", &yaml("other", "1.0.0"));
        let registry = JobRegistry::new(tmp.path());
        assert!(matches!(
            registry.load("nightly", None),
            Err(RegistryError::Validation { .. })
        ));
    }

    #[test]
    fn version_mismatch_is_not_found() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "nightly.yaml", &yaml("nightly", "1.0.0"));
        let registry = JobRegistry::new(tmp.path());

        let err = registry.load("nightly", Some("2.0.0")).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::NotFound { version: Some(ref v), .. } if v == "2.0.0"
        ));
        assert!(registry.load("nightly", Some("1.0.0")).is_ok());
        assert!(registry.load("nightly", Some("latest")).is_ok());
    }

    #[test]
    fn structural_problems_are_validation_errors() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "dup.yaml",
            "job_id: dup\nversion: '1'\nsteps:\n  \
             - {step_id: a, op: noop}\n  - {step_id: a, op: noop}\n",
        );
        let registry = JobRegistry::new(tmp.path());
        let err = registry.load("dup", None).unwrap_err();
        assert!(err.to_string().contains("duplicate step_id 'a'"), "{err}");
    }

    #[test]
    fn latest_load_is_cached_until_invalidated() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "nightly.yaml", &yaml("nightly", "1.0.0"));
        let registry = JobRegistry::new(tmp.path());
        registry.load("nightly", None).unwrap();

        write(tmp.path(), "nightly.yaml", &yaml("nightly", "2.0.0"));
        assert_eq!(registry.load("nightly", None).unwrap().version, "1.0.0");
        // Explicit versions bypass the cache.
        assert_eq!(registry.load("nightly", Some("2.0.0")).unwrap().version, "2.0.0");

        registry.invalidate("nightly");
        assert_eq!(registry.load("nightly", None).unwrap().version, "2.0.0");
    }

    #[test]
    fn list_jobs_dedupes_and_excludes_deprecated() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "b.yaml", &yaml("b", "1"));
        write(
            tmp.path(),
            "b.json",
            r#"{"job_id": "b", "version": "1", "steps": [{"step_id": "s1", "op": "noop"}]}"#,
        );
        write(tmp.path(), "nested/a.yml", &yaml("a", "1"));
        write(tmp.path(), "old.yaml", &format!("{}deprecated: true\n", yaml("old", "1")));
        write(tmp.path(), "broken.yaml", "job_id: [unclosed");

        let registry = JobRegistry::new(tmp.path());
        assert_eq!(registry.list_jobs().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn preload_all_fails_fast() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.yaml", &yaml("a", "1"));
        write(tmp.path(), "b.yaml", &yaml("b", "1"));
        let registry = JobRegistry::new(tmp.path());
        assert_eq!(registry.preload_all().unwrap(), 2);

        write(tmp.path(), "c.yaml", &yaml("not-c", "1"));
        let registry = JobRegistry::new(tmp.path());
        assert!(registry.preload_all().is_err());
    }

    #[test]
    fn hash_index_resolves_loaded_definitions() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "nightly.yaml", &yaml("nightly", "1.0.0"));
        let registry = JobRegistry::new(tmp.path());
        let def = registry.load("nightly", None).unwrap();
        let sha = compute_hash(&def).unwrap();

        assert_eq!(registry.get_by_hash(&sha), Some(def));
        assert_eq!(registry.job_id_for_hash(&sha).as_deref(), Some("nightly"));
        assert!(registry.get_by_hash("0000").is_none());
    }

    #[test]
    fn memory_source_selects_versions() {
        let mut v1 = JobDef {
            job_id: "mem".to_string(),
            version: "1".to_string(),
            steps: vec![StepDef::new("s1", Op::Noop)],
            extras: Default::default(),
        };
        let source = MemoryJobSource::new().with_job(v1.clone());
        v1.version = "2".to_string();
        let source = source.with_job(v1);

        assert_eq!(source.load("mem", None).unwrap().version, "2");
        assert_eq!(source.load("mem", Some("1")).unwrap().version, "1");
        assert!(matches!(
            source.load("mem", Some("3")),
            Err(RegistryError::NotFound { .. })
        ));
        assert!(matches!(
            source.load("other", None),
            Err(RegistryError::NotFound { .. })
        ));
    }
}
