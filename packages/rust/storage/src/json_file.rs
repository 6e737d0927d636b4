//! Whole-document JSON files with key-casing applied at the boundary.
//!
//! Writes go to `.<name>.tmp` next to the target and are renamed into place,
//! so a reader never sees a half-written document.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use stepledger_format::FormatAdapter;
use stepledger_shared::{Result, StepLedgerError};

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document.json".into());
    path.with_file_name(format!(".{name}.tmp"))
}

fn encode<T: Serialize>(path: &Path, value: &T, adapter: &FormatAdapter) -> Result<String> {
    let raw = serde_json::to_value(value).map_err(|e| {
        StepLedgerError::Storage(format!("failed to serialize {}: {e}", path.display()))
    })?;
    let mut text = serde_json::to_string_pretty(&adapter.to_disk(&raw)).map_err(|e| {
        StepLedgerError::Storage(format!("failed to serialize {}: {e}", path.display()))
    })?;
    text.push('\n');
    Ok(text)
}

fn decode<T: DeserializeOwned>(path: &Path, text: &str, adapter: &FormatAdapter) -> Result<T> {
    let raw: Value = serde_json::from_str(text)
        .map_err(|e| StepLedgerError::corrupt(path, format!("invalid JSON: {e}")))?;
    serde_json::from_value(adapter.from_disk(&raw))
        .map_err(|e| StepLedgerError::corrupt(path, e.to_string()))
}

// ---------------------------------------------------------------------------
// Async (tokio::fs)
// ---------------------------------------------------------------------------

/// Read and decode `path`, normalising keys to snake_case first.
pub async fn read_json<T: DeserializeOwned>(path: &Path, adapter: &FormatAdapter) -> Result<T> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| StepLedgerError::io(path, e))?;
    decode(path, &text, adapter)
}

/// Encode `value` with the adapter's disk casing and atomically replace `path`.
pub async fn write_json<T: Serialize>(
    path: &Path,
    value: &T,
    adapter: &FormatAdapter,
) -> Result<()> {
    let text = encode(path, value, adapter)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StepLedgerError::io(parent, e))?;
    }

    let temp = temp_path(path);
    tokio::fs::write(&temp, text)
        .await
        .map_err(|e| StepLedgerError::io(&temp, e))?;
    tokio::fs::rename(&temp, path)
        .await
        .map_err(|e| StepLedgerError::io(path, e))?;

    tracing::debug!(path = %path.display(), "wrote json document");
    Ok(())
}

// ---------------------------------------------------------------------------
// Blocking (std::fs), for tools that run outside a runtime
// ---------------------------------------------------------------------------

pub fn read_json_blocking<T: DeserializeOwned>(path: &Path, adapter: &FormatAdapter) -> Result<T> {
    let text = std::fs::read_to_string(path).map_err(|e| StepLedgerError::io(path, e))?;
    decode(path, &text, adapter)
}

pub fn write_json_blocking<T: Serialize>(
    path: &Path,
    value: &T,
    adapter: &FormatAdapter,
) -> Result<()> {
    let text = encode(path, value, adapter)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StepLedgerError::io(parent, e))?;
    }

    let temp = temp_path(path);
    std::fs::write(&temp, text).map_err(|e| StepLedgerError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| StepLedgerError::io(path, e))?;

    tracing::debug!(path = %path.display(), "wrote json document");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepledger_format::KeyCase;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("sl-json-{}", uuid::Uuid::now_v7()))
    }

    #[tokio::test]
    async fn write_then_read_applies_casing() {
        let tmp = temp_dir();
        let path = tmp.join("nested").join("doc.json");
        let adapter = FormatAdapter::new(KeyCase::Camel).with_opaque(["data"]);

        let doc = json!({ "log_file": "x", "data": { "page_count": 1 } });
        write_json(&path, &doc, &adapter).await.unwrap();

        let on_disk: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, json!({ "logFile": "x", "data": { "page_count": 1 } }));
        assert!(!temp_path(&path).exists());

        let back: Value = read_json(&path, &adapter).await.unwrap();
        assert_eq!(back, doc);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn invalid_json_is_corrupt() {
        let tmp = temp_dir();
        std::fs::create_dir_all(&tmp).unwrap();
        let path = tmp.join("bad.json");
        std::fs::write(&path, "[{\"iteration\": 1,").unwrap();

        let err = read_json::<Value>(&path, &FormatAdapter::new(KeyCase::Snake))
            .await
            .unwrap_err();
        assert!(matches!(err, StepLedgerError::Corrupt { .. }));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn blocking_roundtrip() {
        let tmp = temp_dir();
        let path = tmp.join("doc.json");
        let adapter = FormatAdapter::new(KeyCase::Snake);

        write_json_blocking(&path, &json!({ "currentState": "INITIALIZED" }), &adapter).unwrap();
        let back: Value = read_json_blocking(&path, &adapter).unwrap();
        assert_eq!(back, json!({ "current_state": "INITIALIZED" }));

        let _ = std::fs::remove_dir_all(&tmp);
    }
}
