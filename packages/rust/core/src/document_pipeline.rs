//! Download, checksum and describe one remote document as a resumable pipeline.
//!
//! Initial context: `url` (string) and `output_dir` (path string).

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use reqwest::Client;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use stepledger_shared::{Result, StepLedgerError};
use tracing::info;
use url::Url;

use crate::fetch::{self, FetchOptions};
use crate::step::{BoxError, Step, StepContext, StepOutcome};

/// Initial context for [`fetch_document_steps`].
pub fn initial_context(url: &Url, output_dir: &std::path::Path) -> Map<String, Value> {
    let mut ctx = Map::new();
    ctx.insert("url".into(), json!(url.as_str()));
    ctx.insert("output_dir".into(), json!(output_dir.to_string_lossy()));
    ctx
}

/// Build the three-step fetch pipeline: download, checksum, manifest.
pub fn fetch_document_steps(options: FetchOptions) -> Result<Vec<Step>> {
    let client = Arc::new(fetch::build_client()?);
    let options = Arc::new(options);

    let download = Step::new("Download document", "download", move |ctx: StepContext| {
        download_step(Arc::clone(&client), Arc::clone(&options), ctx)
    })
    .reads(["url", "output_dir"])
    .produces(["file_path", "bytes_written", "reused_existing"]);

    let checksum = Step::new("Checksum document", "checksum", checksum_step)
        .reads(["file_path"])
        .produces(["sha256", "size_bytes"]);

    let manifest = Step::new("Write manifest", "manifest", manifest_step)
        .reads(["url", "file_path", "sha256", "size_bytes"])
        .produces(["manifest_path"]);

    Ok(vec![download, checksum, manifest])
}

async fn download_step(
    client: Arc<Client>,
    options: Arc<FetchOptions>,
    ctx: StepContext,
) -> std::result::Result<Value, BoxError> {
    let raw: String = ctx.get_as("url")?;
    let url = Url::parse(&raw)
        .map_err(|e| StepLedgerError::validation(format!("invalid URL '{raw}': {e}")))?;
    let output_dir: PathBuf = ctx.get_as("output_dir")?;
    let destination = output_dir.join(fetch::file_name_for(&url));

    let result = fetch::download(&client, &url, &destination, &options).await?;

    StepOutcome::success()
        .with("file_path", result.path.to_string_lossy().into_owned())
        .with("bytes_written", result.bytes)
        .with("reused_existing", result.reused_existing)
        .into_result()
}

async fn checksum_step(ctx: StepContext) -> std::result::Result<Value, BoxError> {
    let path: PathBuf = ctx.get_as("file_path")?;
    let content = tokio::fs::read(&path)
        .await
        .map_err(|e| StepLedgerError::io(&path, e))?;

    let mut hasher = Sha256::new();
    hasher.update(&content);
    let hash = format!("{:x}", hasher.finalize());
    info!(path = %path.display(), sha256 = %hash, "checksummed");

    StepOutcome::success()
        .with("sha256", hash)
        .with("size_bytes", content.len() as u64)
        .into_result()
}

async fn manifest_step(ctx: StepContext) -> std::result::Result<Value, BoxError> {
    let path: PathBuf = ctx.get_as("file_path")?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| StepLedgerError::validation("file_path has no file name"))?;
    let manifest_path = path.with_file_name(format!("{name}.manifest.json"));

    let manifest = json!({
        "source_url": ctx.require("url")?,
        "file": name,
        "sha256": ctx.require("sha256")?,
        "size_bytes": ctx.require("size_bytes")?,
        "run_id": ctx.run_id.to_string(),
        "iteration": ctx.iteration,
        "written_at": Utc::now().to_rfc3339(),
    });
    let body = serde_json::to_string_pretty(&manifest)?;
    tokio::fs::write(&manifest_path, body)
        .await
        .map_err(|e| StepLedgerError::io(&manifest_path, e))?;

    StepOutcome::success()
        .with("manifest_path", manifest_path.to_string_lossy().into_owned())
        .into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{PipelineConfig, SilentProgress, run_pipeline};
    use std::time::Duration;
    use stepledger_format::KeyCase;
    use stepledger_shared::StepStatus;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sl-docpipe-{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(".stepledger-test-root"), "").unwrap();
        dir
    }

    fn config(dir: &std::path::Path) -> PipelineConfig {
        PipelineConfig {
            progress_dir: dir.join("progress"),
            progress_file: "progress.json".into(),
            resume_from_last_successful: true,
            key_case: KeyCase::Camel,
            root_markers: vec![".stepledger-test-root".into()],
        }
    }

    fn options() -> FetchOptions {
        FetchOptions {
            timeout: Duration::from_secs(5),
            retries: 2,
            retry_delay: Duration::from_millis(10),
            overwrite_existing: false,
        }
    }

    #[tokio::test]
    async fn fetches_checksums_and_describes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/paper.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_string("abc"))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = temp_dir();
        let url = Url::parse(&format!("{}/paper.pdf", server.uri())).unwrap();
        let initial = initial_context(&url, &tmp.join("docs"));
        let cfg = config(&tmp);

        let mut steps = fetch_document_steps(options()).unwrap();
        let run = run_pipeline(&mut steps, initial.clone(), &cfg, &SilentProgress)
            .await
            .unwrap();

        assert_eq!(run.executed, vec![0, 1, 2]);
        assert_eq!(
            run.context["sha256"],
            json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        assert_eq!(run.context["size_bytes"], json!(3));
        assert!(steps.iter().all(|s| s.status == Some(StepStatus::Success)));

        let manifest_path = tmp.join("docs").join("paper.pdf.manifest.json");
        let manifest: Value =
            serde_json::from_str(&std::fs::read_to_string(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest["file"], json!("paper.pdf"));
        assert_eq!(manifest["source_url"], json!(url.as_str()));

        // Second invocation replays; the mock's expect(1) catches a re-download.
        let mut again = fetch_document_steps(options()).unwrap();
        let replay = run_pipeline(&mut again, initial, &cfg, &SilentProgress)
            .await
            .unwrap();
        assert!(replay.replayed);
        assert!(replay.executed.is_empty());
        assert_eq!(replay.output, run.output);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn failed_download_stops_at_first_step() {
        let server = MockServer::start().await;
        Mock::given(path("/gone.pdf"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let tmp = temp_dir();
        let url = Url::parse(&format!("{}/gone.pdf", server.uri())).unwrap();
        let mut steps = fetch_document_steps(options()).unwrap();

        let err = run_pipeline(
            &mut steps,
            initial_context(&url, &tmp.join("docs")),
            &config(&tmp),
            &SilentProgress,
        )
        .await
        .unwrap_err();

        match err {
            StepLedgerError::StepExecution { index, key, .. } => {
                assert_eq!(index, 0);
                assert_eq!(key, "download");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(steps[1].status.is_none());

        let _ = std::fs::remove_dir_all(&tmp);
    }
}
