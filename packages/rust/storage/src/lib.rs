//! Durable JSON-file ledger for pipeline iterations and step logs.
//!
//! The [`ProgressStore`] owns every read and write of one progress file and
//! the step-log files beside it. Nothing is cached: each call re-reads the
//! file, so the on-disk state is always the source of truth.
//!
//! **Access rules:** one orchestrator process owns a progress file at a time.
//! There is no locking.

pub mod json_file;
pub mod project_root;

use std::path::{Path, PathBuf};

use stepledger_format::{FormatAdapter, KeyCase};
use stepledger_shared::{Iteration, Result, StepLedgerError, StepLog};
use tracing::{debug, warn};

pub use project_root::{discover_project_root, normalize, relative_ref, resolve_ref};

/// Keys whose values belong to the step, not to the ledger envelope.
pub const OPAQUE_KEYS: [&str; 3] = ["data", "error", "meta"];

/// Handle to one progress file and its step logs.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    progress_dir: PathBuf,
    progress_file: PathBuf,
    root: PathBuf,
    adapter: FormatAdapter,
}

impl ProgressStore {
    /// Store for `progress_dir/file_name`. The project root defaults to the
    /// progress directory and the disk casing to camelCase.
    pub fn new(progress_dir: impl Into<PathBuf>, file_name: impl AsRef<Path>) -> Self {
        let progress_dir = progress_dir.into();
        let progress_file = progress_dir.join(file_name);
        let root = normalize(&progress_dir);
        Self {
            progress_dir,
            progress_file,
            root,
            adapter: FormatAdapter::new(KeyCase::Camel).with_opaque(OPAQUE_KEYS),
        }
    }

    pub fn with_key_case(mut self, case: KeyCase) -> Self {
        self.adapter = FormatAdapter::new(case).with_opaque(OPAQUE_KEYS);
        self
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = normalize(&root.into());
        self
    }

    /// Set the root by walking up from the progress directory.
    pub fn discover_root(mut self, markers: &[String]) -> Self {
        self.root = discover_project_root(&self.progress_dir, markers);
        self
    }

    pub fn progress_dir(&self) -> &Path {
        &self.progress_dir
    }

    pub fn progress_file(&self) -> &Path {
        &self.progress_file
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // -----------------------------------------------------------------------
    // Progress file
    // -----------------------------------------------------------------------

    /// Create the directory tree and an empty `[]` progress file if absent.
    pub async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.progress_dir)
            .await
            .map_err(|e| StepLedgerError::io(&self.progress_dir, e))?;

        if !tokio::fs::try_exists(&self.progress_file)
            .await
            .map_err(|e| StepLedgerError::io(&self.progress_file, e))?
        {
            json_file::write_json(&self.progress_file, &Vec::<Iteration>::new(), &self.adapter)
                .await?;
            debug!(path = %self.progress_file.display(), "initialized progress file");
        }
        Ok(())
    }

    /// All iterations, validated. A missing file reads as empty.
    pub async fn load_iterations(&self) -> Result<Vec<Iteration>> {
        if !tokio::fs::try_exists(&self.progress_file)
            .await
            .map_err(|e| StepLedgerError::io(&self.progress_file, e))?
        {
            return Ok(Vec::new());
        }

        let iterations: Vec<Iteration> =
            json_file::read_json(&self.progress_file, &self.adapter).await?;
        validate_structure(&self.progress_file, &iterations)?;
        Ok(iterations)
    }

    /// `max(iteration) + 1`, or 1 for an empty file.
    pub async fn next_iteration_number(&self) -> Result<u32> {
        let iterations = self.load_iterations().await?;
        let max = iterations.iter().map(|i| i.iteration).max().unwrap_or(0);

        if max as usize != iterations.len() {
            warn!(
                path = %self.progress_file.display(),
                max,
                count = iterations.len(),
                "iteration numbering has gaps"
            );
        }
        Ok(max + 1)
    }

    /// Create and persist a fresh iteration with the next number.
    pub async fn create_iteration(&self) -> Result<Iteration> {
        let iteration = Iteration::new(self.next_iteration_number().await?);
        self.upsert_iteration(&iteration).await?;
        debug!(iteration = iteration.iteration, "created iteration");
        Ok(iteration)
    }

    pub async fn last_iteration(&self) -> Result<Option<Iteration>> {
        Ok(self.load_iterations().await?.pop())
    }

    /// Replace the iteration with the same number, or append it. Rewrites the
    /// whole file.
    pub async fn upsert_iteration(&self, iteration: &Iteration) -> Result<()> {
        let mut iterations = self.load_iterations().await?;
        match iterations
            .iter_mut()
            .find(|i| i.iteration == iteration.iteration)
        {
            Some(existing) => *existing = iteration.clone(),
            None => iterations.push(iteration.clone()),
        }
        json_file::write_json(&self.progress_file, &iterations, &self.adapter).await
    }

    // -----------------------------------------------------------------------
    // Step logs
    // -----------------------------------------------------------------------

    /// `<progress_dir>/<iteration>.<key>.log.json`
    pub fn step_log_path(&self, iteration: u32, key: &str) -> PathBuf {
        self.progress_dir.join(format!("{iteration}.{key}.log.json"))
    }

    /// Write (or overwrite) a step log and return its root-relative reference.
    pub async fn write_step_log(&self, iteration: u32, log: &StepLog) -> Result<String> {
        let path = self.step_log_path(iteration, &log.key);
        json_file::write_json(&path, log, &self.adapter).await?;
        Ok(relative_ref(&self.root, &path))
    }

    pub async fn read_step_log(&self, reference: &str) -> Result<StepLog> {
        json_file::read_json(&self.resolve_log_ref(reference), &self.adapter).await
    }

    pub fn resolve_log_ref(&self, reference: &str) -> PathBuf {
        resolve_ref(&self.root, reference)
    }

    /// Reference to the log of the first iteration whose record for the
    /// 1-based `step_number` is SUCCESS.
    pub async fn find_successful_step_log(&self, step_number: usize) -> Result<Option<String>> {
        if step_number == 0 {
            return Err(StepLedgerError::validation("step numbers start at 1"));
        }
        let index = step_number - 1;
        Ok(self
            .load_iterations()
            .await?
            .iter()
            .filter_map(|i| i.record(index))
            .find(|r| r.status.is_success())
            .map(|r| r.log_file.clone()))
    }
}

/// Iteration numbers strictly increase; record indices equal their positions.
fn validate_structure(path: &Path, iterations: &[Iteration]) -> Result<()> {
    let mut previous = 0;
    for iteration in iterations {
        if iteration.iteration <= previous {
            return Err(StepLedgerError::corrupt(
                path,
                format!(
                    "iteration {} follows iteration {previous}; numbers must strictly increase",
                    iteration.iteration
                ),
            ));
        }
        previous = iteration.iteration;

        for (position, record) in iteration.steps.iter().enumerate() {
            if record.step != position {
                return Err(StepLedgerError::corrupt(
                    path,
                    format!(
                        "iteration {}: record at position {position} has step index {}",
                        iteration.iteration, record.step
                    ),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value, json};
    use stepledger_shared::{StepRecord, StepStatus};

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("sl-store-{}", uuid::Uuid::now_v7()))
    }

    fn record(step: usize, status: StepStatus) -> StepRecord {
        StepRecord {
            step,
            log_file: format!("{step}.log.json"),
            status,
            key: Some(format!("k{step}")),
        }
    }

    #[tokio::test]
    async fn dotted_progress_dir_logs_resolve() {
        let tmp = temp_dir();
        let project = tmp.join("project");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(project.join("Cargo.toml"), "").unwrap();

        let store = ProgressStore::new(project.join("..").join("shared-progress"), "progress.json")
            .discover_root(&["Cargo.toml".into()]);
        assert_ne!(store.root(), project.as_path());
        store.initialize().await.unwrap();

        let log = StepLog::success("a", "Step 0 (a) completed.", Map::new());
        let reference = store.write_step_log(1, &log).await.unwrap();
        assert!(store.resolve_log_ref(&reference).exists());
        assert_eq!(store.read_step_log(&reference).await.unwrap().key, "a");

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn initialize_writes_empty_array() {
        let tmp = temp_dir();
        let store = ProgressStore::new(tmp.join("progress"), "progress.json");
        store.initialize().await.unwrap();

        let text = std::fs::read_to_string(store.progress_file()).unwrap();
        assert_eq!(serde_json::from_str::<Value>(&text).unwrap(), json!([]));
        assert_eq!(store.next_iteration_number().await.unwrap(), 1);
        assert!(store.last_iteration().await.unwrap().is_none());

        // Second initialize leaves existing content alone.
        store.create_iteration().await.unwrap();
        store.initialize().await.unwrap();
        assert_eq!(store.load_iterations().await.unwrap().len(), 1);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn upsert_replaces_or_appends() {
        let tmp = temp_dir();
        let store = ProgressStore::new(&tmp, "progress.json");
        store.initialize().await.unwrap();

        let mut first = store.create_iteration().await.unwrap();
        let second = store.create_iteration().await.unwrap();
        assert_eq!((first.iteration, second.iteration), (1, 2));

        first.upsert_record(record(0, StepStatus::Success));
        store.upsert_iteration(&first).await.unwrap();

        let all = store.load_iterations().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].steps.len(), 1);
        assert_eq!(store.last_iteration().await.unwrap().unwrap().iteration, 2);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn progress_file_uses_camel_envelope() {
        let tmp = temp_dir();
        let store = ProgressStore::new(&tmp, "progress.json");
        let mut it = store.create_iteration().await.unwrap();
        it.upsert_record(record(0, StepStatus::Partial));
        store.upsert_iteration(&it).await.unwrap();

        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(store.progress_file()).unwrap()).unwrap();
        assert!(raw[0].get("timeStamp").is_some());
        assert_eq!(raw[0]["steps"][0]["logFile"], "0.log.json");
        assert_eq!(raw[0]["steps"][0]["status"], "PARTIAL");

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn snake_case_files_are_readable() {
        let tmp = temp_dir();
        std::fs::create_dir_all(&tmp).unwrap();
        let snake = json!([{
            "iteration": 1,
            "timestamp": "2025-01-01T00:00:00Z",
            "steps": [{ "step": 0, "log_file": "a", "status": "SUCCESS" }]
        }]);
        std::fs::write(tmp.join("progress.json"), snake.to_string()).unwrap();

        let store = ProgressStore::new(&tmp, "progress.json");
        let all = store.load_iterations().await.unwrap();
        assert_eq!(all[0].steps[0].log_file, "a");
        assert_eq!(all[0].steps[0].key, None);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn structural_violations_are_corrupt() {
        let tmp = temp_dir();
        std::fs::create_dir_all(&tmp).unwrap();
        let store = ProgressStore::new(&tmp, "progress.json");

        let out_of_order = json!([
            { "iteration": 2, "timeStamp": "2025-01-01T00:00:00Z", "steps": [] },
            { "iteration": 1, "timeStamp": "2025-01-01T00:00:00Z", "steps": [] }
        ]);
        std::fs::write(store.progress_file(), out_of_order.to_string()).unwrap();
        let err = store.load_iterations().await.unwrap_err();
        assert!(matches!(err, StepLedgerError::Corrupt { .. }));

        let bad_index = json!([{
            "iteration": 1,
            "timeStamp": "2025-01-01T00:00:00Z",
            "steps": [{ "step": 1, "logFile": "a", "status": "SUCCESS" }]
        }]);
        std::fs::write(store.progress_file(), bad_index.to_string()).unwrap();
        assert!(store.load_iterations().await.is_err());

        let bad_status = json!([{
            "iteration": 1,
            "timeStamp": "2025-01-01T00:00:00Z",
            "steps": [{ "step": 0, "logFile": "a", "status": "DONE" }]
        }]);
        std::fs::write(store.progress_file(), bad_status.to_string()).unwrap();
        assert!(matches!(
            store.load_iterations().await.unwrap_err(),
            StepLedgerError::Corrupt { .. }
        ));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn next_number_is_max_plus_one_with_gaps() {
        let tmp = temp_dir();
        std::fs::create_dir_all(&tmp).unwrap();
        let store = ProgressStore::new(&tmp, "progress.json");
        let gappy = json!([
            { "iteration": 1, "timeStamp": "2025-01-01T00:00:00Z", "steps": [] },
            { "iteration": 4, "timeStamp": "2025-01-01T00:00:00Z", "steps": [] }
        ]);
        std::fs::write(store.progress_file(), gappy.to_string()).unwrap();

        assert_eq!(store.next_iteration_number().await.unwrap(), 5);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn step_log_roundtrip_and_reference() {
        let tmp = temp_dir();
        let progress = tmp.join("out").join("progress");
        std::fs::create_dir_all(&progress).unwrap();
        std::fs::write(tmp.join(".stepledger-root"), "").unwrap();

        let store = ProgressStore::new(&progress, "progress.json")
            .discover_root(&[".stepledger-root".to_string()]);

        let mut data = Map::new();
        data.insert("file_path".into(), json!("docs/a.pdf"));
        let log = StepLog::success("download", "Step 0 (download) completed.", data);

        let reference = store.write_step_log(3, &log).await.unwrap();
        assert_eq!(reference, "out/progress/3.download.log.json");

        let raw: Value = serde_json::from_str(
            &std::fs::read_to_string(progress.join("3.download.log.json")).unwrap(),
        )
        .unwrap();
        assert!(raw.get("timeStamp").is_some());
        assert_eq!(raw["data"]["file_path"], "docs/a.pdf");

        let back = store.read_step_log(&reference).await.unwrap();
        assert_eq!(back, log);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn find_first_successful_log() {
        let tmp = temp_dir();
        let store = ProgressStore::new(&tmp, "progress.json");

        let mut one = store.create_iteration().await.unwrap();
        one.upsert_record(record(0, StepStatus::Success));
        one.upsert_record(record(1, StepStatus::Failure));
        store.upsert_iteration(&one).await.unwrap();

        let mut two = store.create_iteration().await.unwrap();
        two.upsert_record(StepRecord {
            log_file: "two-0".into(),
            ..record(0, StepStatus::Success)
        });
        two.upsert_record(StepRecord {
            log_file: "two-1".into(),
            ..record(1, StepStatus::Success)
        });
        store.upsert_iteration(&two).await.unwrap();

        assert_eq!(
            store.find_successful_step_log(1).await.unwrap().as_deref(),
            Some("0.log.json")
        );
        assert_eq!(
            store.find_successful_step_log(2).await.unwrap().as_deref(),
            Some("two-1")
        );
        assert_eq!(store.find_successful_step_log(3).await.unwrap(), None);
        assert!(store.find_successful_step_log(0).await.is_err());

        let _ = std::fs::remove_dir_all(&tmp);
    }
}
