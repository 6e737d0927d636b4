//! One-off migration of legacy state files.
//!
//! Legacy files keep `states` as an object keyed by state name, so they hold
//! one row per state and no history. Migration rewrites them into the
//! append-only array form, with defaults for fields the legacy writer never
//! recorded and a chained `previous_state`.
//!
//! Runs synchronously (`std::fs`); it is a maintenance tool, not part of a run.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use stepledger_format::{FormatAdapter, KeyCase};
use stepledger_shared::{
    ProcessingState, ProcessingStatus, ProgressFileStructure, Result, StateEntry,
    StepLedgerError, TransitionReason, TriggerSource,
};
use stepledger_storage::json_file;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Options for a migration pass.
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    /// Report what would change without writing anything.
    pub dry_run: bool,
    /// Keep backups here. Without it, a temporary sibling backup is made and
    /// removed once the file is migrated.
    pub backup_dir: Option<PathBuf>,
    /// Remove backups from `backup_dir` after a verified migration.
    pub cleanup_backups: bool,
    pub skip_verification: bool,
    /// File name searched for when migrating a directory.
    pub file_name: String,
    /// Key casing of the rewritten files.
    pub key_case: KeyCase,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            backup_dir: None,
            cleanup_backups: false,
            skip_verification: false,
            file_name: "question.progress.json".into(),
            key_case: KeyCase::Snake,
        }
    }
}

/// Counters reported after a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStats {
    pub files_found: usize,
    pub files_migrated: usize,
    /// Already in the array format.
    pub files_skipped: usize,
    pub files_failed: usize,
    pub backups_created: usize,
    pub verifications_succeeded: usize,
    pub verifications_failed: usize,
}

/// What happened to one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Migrated,
    WouldMigrate { states: Vec<ProcessingState> },
    AlreadyMigrated,
    Failed(String),
}

// ---------------------------------------------------------------------------
// Discovery / detection
// ---------------------------------------------------------------------------

/// `search` itself if it is a file named `file_name`, otherwise every such
/// file below it. Unreadable directories are skipped with a warning.
pub fn find_progress_files(search: &Path, file_name: &str) -> Result<Vec<PathBuf>> {
    let meta = std::fs::metadata(search).map_err(|e| StepLedgerError::io(search, e))?;
    let mut found = Vec::new();

    if meta.is_file() {
        if search.file_name().is_some_and(|n| n == file_name) {
            found.push(search.to_path_buf());
        }
    } else if meta.is_dir() {
        walk(search, file_name, &mut found);
    }

    found.sort();
    info!(count = found.len(), search = %search.display(), "found progress files");
    Ok(found)
}

fn walk(dir: &Path, file_name: &str, found: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "could not read directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(ft) if ft.is_dir() => walk(&path, file_name, found),
            Ok(ft) if ft.is_file() && entry.file_name() == file_name => found.push(path),
            _ => {}
        }
    }
}

/// Legacy files have an object under `states`.
pub fn is_legacy_format(value: &Value) -> bool {
    match value.get("states") {
        Some(Value::Object(_)) => true,
        Some(Value::Array(_)) => false,
        other => {
            warn!(states = ?other.map(|v| v.to_string()), "unknown states format");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Conversion / verification
// ---------------------------------------------------------------------------

/// Convert a legacy document (snake_case keys) into the array form.
pub fn convert_legacy(legacy: &Value) -> std::result::Result<ProgressFileStructure, String> {
    let current_state = legacy
        .get("current_state")
        .and_then(Value::as_str)
        .ok_or("legacy file has no current_state")?
        .parse::<ProcessingState>()?;
    let empty = Map::new();
    let old_states = legacy
        .get("states")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let now = Utc::now();
    let mut states: Vec<StateEntry> = Vec::new();

    for state in ProcessingState::ORDER {
        let Some(old) = old_states.get(state.as_str()) else {
            continue;
        };
        let status = match old.get("status").and_then(Value::as_str) {
            Some(s) => s.parse::<ProcessingStatus>()?,
            None => ProcessingStatus::Success,
        };
        let previous_state = states.last().map(|prev| prev.state);
        states.push(StateEntry {
            status,
            timestamp: timestamp_or(old.get("timestamp"), now)?,
            data: object_or_empty(old.get("data")),
            state,
            meta: object_or_empty(old.get("meta")),
            errors: old
                .get("errors")
                .and_then(Value::as_array)
                .map(|errs| {
                    errs.iter()
                        .map(|e| e.as_str().map_or_else(|| e.to_string(), String::from))
                        .collect()
                })
                .unwrap_or_default(),
            transition_reason: Some(TransitionReason::AutomaticProgression),
            triggered_by: Some(TriggerSource::System),
            previous_state,
        });
    }

    Ok(ProgressFileStructure {
        current_state,
        states,
        created_at: timestamp_or(legacy.get("created_at"), now)?,
        updated_at: timestamp_or(legacy.get("updated_at"), now)?,
    })
}

fn timestamp_or(
    value: Option<&Value>,
    fallback: DateTime<Utc>,
) -> std::result::Result<DateTime<Utc>, String> {
    match value {
        None | Some(Value::Null) => Ok(fallback),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| format!("bad timestamp {v}: {e}")),
    }
}

fn object_or_empty(value: Option<&Value>) -> Map<String, Value> {
    value.and_then(Value::as_object).cloned().unwrap_or_default()
}

/// Compare a migrated document with the legacy original.
pub fn verify_migration(
    legacy: &Value,
    migrated: &ProgressFileStructure,
) -> std::result::Result<(), String> {
    let original_current = legacy.get("current_state").and_then(Value::as_str);
    if original_current != Some(migrated.current_state.as_str()) {
        return Err(format!(
            "current state mismatch: {original_current:?} became {}",
            migrated.current_state
        ));
    }

    let empty = Map::new();
    let old_states = legacy
        .get("states")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    for (name, old) in old_states {
        let Some(entry) = migrated.states.iter().find(|e| e.state.as_str() == name) else {
            return Err(format!("state {name} is missing after migration"));
        };
        if let Some(status) = old.get("status").and_then(Value::as_str) {
            if status.parse::<ProcessingStatus>().ok() != Some(entry.status) {
                return Err(format!("status mismatch for state {name}"));
            }
        }
        if let Some(data) = old.get("data").and_then(Value::as_object) {
            if *data != entry.data {
                return Err(format!("data mismatch for state {name}"));
            }
        }
    }

    for pair in migrated.states.windows(2) {
        if pair[1].previous_state != Some(pair[0].state) {
            return Err(format!("audit trail broken at state {}", pair[1].state));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Migrator
// ---------------------------------------------------------------------------

/// Runs a migration pass and keeps its counters.
#[derive(Debug)]
pub struct Migrator {
    options: MigrationOptions,
    adapter: FormatAdapter,
    /// Legacy `states` objects are keyed by state name; those keys stay as-is.
    legacy_adapter: FormatAdapter,
    stats: MigrationStats,
}

impl Migrator {
    pub fn new(options: MigrationOptions) -> Self {
        let adapter = FormatAdapter::new(options.key_case).with_opaque(["data", "meta"]);
        Self {
            options,
            adapter,
            legacy_adapter: FormatAdapter::new(KeyCase::Snake).with_opaque(["states"]),
            stats: MigrationStats::default(),
        }
    }

    pub fn stats(&self) -> &MigrationStats {
        &self.stats
    }

    /// Migrate every matching file under `search`.
    #[instrument(skip_all, fields(search = %search.display(), dry_run = self.options.dry_run))]
    pub fn migrate_all(&mut self, search: &Path) -> Result<MigrationStats> {
        let files = find_progress_files(search, &self.options.file_name)?;
        self.stats.files_found += files.len();

        for file in &files {
            match self.migrate_file(file) {
                FileOutcome::Failed(reason) => {
                    warn!(file = %file.display(), %reason, "migration failed")
                }
                outcome => debug!(file = %file.display(), ?outcome, "processed file"),
            }
        }

        info!(
            found = self.stats.files_found,
            migrated = self.stats.files_migrated,
            skipped = self.stats.files_skipped,
            failed = self.stats.files_failed,
            "migration pass finished"
        );
        Ok(self.stats.clone())
    }

    /// Migrate one file, updating the counters.
    pub fn migrate_file(&mut self, path: &Path) -> FileOutcome {
        let outcome = self.migrate_inner(path);
        match &outcome {
            FileOutcome::Migrated | FileOutcome::WouldMigrate { .. } => self.stats.files_migrated += 1,
            FileOutcome::AlreadyMigrated => self.stats.files_skipped += 1,
            FileOutcome::Failed(_) => self.stats.files_failed += 1,
        }
        outcome
    }

    fn migrate_inner(&mut self, path: &Path) -> FileOutcome {
        let legacy: Value = match json_file::read_json_blocking(path, &self.legacy_adapter) {
            Ok(v) => v,
            Err(e) => return FileOutcome::Failed(e.to_string()),
        };
        if !is_legacy_format(&legacy) {
            info!(file = %path.display(), "already in the array format");
            return FileOutcome::AlreadyMigrated;
        }

        let migrated = match convert_legacy(&legacy) {
            Ok(m) => m,
            Err(e) => return FileOutcome::Failed(e),
        };

        if self.options.dry_run {
            let states: Vec<ProcessingState> = migrated.states.iter().map(|e| e.state).collect();
            info!(file = %path.display(), ?states, "dry run: would migrate");
            return FileOutcome::WouldMigrate { states };
        }

        let (backup, temporary) = match &self.options.backup_dir {
            Some(dir) => match backup_into(path, dir) {
                Ok(b) => {
                    self.stats.backups_created += 1;
                    (b, false)
                }
                Err(e) => return FileOutcome::Failed(format!("backup failed, not migrating: {e}")),
            },
            None => {
                warn!(file = %path.display(), "no backup directory given, using a temporary backup");
                match temporary_backup(path) {
                    Ok(b) => (b, true),
                    Err(e) => return FileOutcome::Failed(format!("backup failed, not migrating: {e}")),
                }
            }
        };

        if let Err(e) = json_file::write_json_blocking(path, &migrated, &self.adapter) {
            restore(&backup, path);
            return FileOutcome::Failed(e.to_string());
        }

        if !self.options.skip_verification {
            let check = json_file::read_json_blocking::<ProgressFileStructure>(path, &self.adapter)
                .map_err(|e| e.to_string())
                .and_then(|written| verify_migration(&legacy, &written));
            match check {
                Ok(()) => self.stats.verifications_succeeded += 1,
                Err(reason) => {
                    self.stats.verifications_failed += 1;
                    restore(&backup, path);
                    return FileOutcome::Failed(format!("verification failed: {reason}"));
                }
            }
        }

        if temporary || self.options.cleanup_backups {
            if let Err(e) = std::fs::remove_file(&backup) {
                warn!(backup = %backup.display(), error = %e, "could not remove backup");
            }
        }

        info!(file = %path.display(), states = migrated.states.len(), "migrated");
        FileOutcome::Migrated
    }
}

fn backup_name(path: &Path, tag: &str) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "progress".into());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    format!("{stem}_{tag}{}{ext}", Uuid::now_v7().simple())
}

fn backup_into(path: &Path, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|e| StepLedgerError::io(dir, e))?;
    let backup = dir.join(backup_name(path, ""));
    std::fs::copy(path, &backup).map_err(|e| StepLedgerError::io(&backup, e))?;
    info!(backup = %backup.display(), "created backup");
    Ok(backup)
}

fn temporary_backup(path: &Path) -> Result<PathBuf> {
    let backup = path.with_file_name(backup_name(path, "temp_backup_"));
    std::fs::copy(path, &backup).map_err(|e| StepLedgerError::io(&backup, e))?;
    debug!(backup = %backup.display(), "created temporary backup");
    Ok(backup)
}

fn restore(backup: &Path, path: &Path) {
    match std::fs::copy(backup, path) {
        Ok(_) => info!(file = %path.display(), "restored from backup"),
        Err(e) => warn!(file = %path.display(), backup = %backup.display(), error = %e, "restore failed"),
    }
}
