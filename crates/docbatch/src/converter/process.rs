use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{ConversionOutcome, ConversionRequest, Converter};
use crate::config::ConverterConfig;
use crate::error::StorageError;
use crate::sanitize::{key_base_name, redact_path};
use crate::storage::{ObjectLocator, StorageBackend};

/// Runs an external converter command on a staged copy of the input.
pub struct ProcessConverter {
    storage: Arc<dyn StorageBackend>,
    config: ConverterConfig,
}

/// Describes a failed run using whatever the process printed.
fn format_process_error(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

    match (stderr.is_empty(), stdout.is_empty()) {
        (true, true) => match output.status.code() {
            Some(code) => format!("converter exited with status {}", code),
            None => "converter was terminated by a signal".to_string(),
        },
        (true, false) => stdout,
        (false, _) => stderr,
    }
}

/// Storage errors become task retries when transient, final failures otherwise.
fn storage_failure(context: &str, err: StorageError) -> Result<ConversionOutcome, StorageError> {
    if err.is_retryable() {
        return Err(err);
    }
    Ok(ConversionOutcome::failed(format!("{}: {}", context, err)))
}

impl ProcessConverter {
    pub fn new(storage: Arc<dyn StorageBackend>, config: ConverterConfig) -> Self {
        Self { storage, config }
    }

    fn expand_args(&self, input: &Path, outdir: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let outdir = outdir.to_string_lossy();
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input)
                    .replace("{outdir}", &outdir)
                    .replace("{format}", &self.config.target_extension)
            })
            .collect()
    }

    /// Uses the backend's own path when it has one, otherwise downloads into `staging`.
    async fn stage_input(&self, key: &str, staging: &Path) -> Result<PathBuf, StorageError> {
        if let Some(path) = self.storage.local_path(key) {
            tokio::fs::metadata(&path)
                .await
                .map_err(|e| StorageError::from_io(key, &e))?;
            return Ok(path);
        }

        let dest = staging.join(key_base_name(key));
        self.storage.fetch_to(key, &dest).await?;
        Ok(dest)
    }

    /// The expected `<stem>.<ext>`, or the only file the converter wrote.
    async fn find_output(&self, outdir: &Path, stem: &str) -> Option<PathBuf> {
        let expected = outdir.join(format!("{}.{}", stem, self.config.target_extension));
        if tokio::fs::metadata(&expected).await.is_ok() {
            return Some(expected);
        }

        let mut entries = tokio::fs::read_dir(outdir).await.ok()?;
        let mut produced = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                produced.push(entry.path());
            }
        }
        if produced.len() == 1 {
            produced.pop()
        } else {
            None
        }
    }

    async fn run(&self, input: &Path, outdir: &Path) -> Result<(), String> {
        let timeout = Duration::from_secs(self.config.timeout_secs);

        let mut cmd = Command::new(&self.config.program);
        cmd.args(self.expand_args(input, outdir))
            .current_dir(outdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            format!(
                "failed to invoke converter '{}': {}",
                self.config.program, e
            )
        })?;

        // Dropping the timed-out future drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| format!("failed to wait for converter: {}", e))?,
            Err(_) => {
                return Err(format!(
                    "conversion timed out after {}s",
                    self.config.timeout_secs
                ))
            }
        };

        if output.status.success() {
            Ok(())
        } else {
            Err(format_process_error(&output))
        }
    }
}

#[async_trait]
impl Converter for ProcessConverter {
    async fn convert(
        &self,
        request: &ConversionRequest,
    ) -> Result<ConversionOutcome, StorageError> {
        let staging = match tempfile::Builder::new()
            .prefix("docbatch-convert-")
            .tempdir()
        {
            Ok(dir) => dir,
            Err(e) => {
                return Err(StorageError::Unavailable {
                    key: request.input_key.clone(),
                    reason: format!("cannot create staging directory: {}", e),
                })
            }
        };
        let outdir = staging.path().join("out");
        if let Err(e) = tokio::fs::create_dir(&outdir).await {
            return Err(StorageError::from_io(&request.input_key, &e));
        }

        let input = match self.stage_input(&request.input_key, staging.path()).await {
            Ok(path) => path,
            Err(e) => return storage_failure("cannot read input", e),
        };
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "document".to_string());

        log::debug!(
            "Converting {} for job {} with {}",
            redact_path(&input),
            request.job_id,
            self.config.program
        );

        if let Err(error) = self.run(&input, &outdir).await {
            log::warn!("Conversion of {} failed: {}", request.file_name, error);
            return Ok(ConversionOutcome::failed(error));
        }

        let Some(produced) = self.find_output(&outdir, &stem).await else {
            return Ok(ConversionOutcome::failed(format!(
                "converter produced no {} output",
                self.config.target_extension
            )));
        };

        let bytes = match tokio::fs::read(&produced).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return Ok(ConversionOutcome::failed(format!(
                    "cannot read converter output {}: {}",
                    redact_path(&produced),
                    e
                )))
            }
        };

        let name = format!(
            "converted/{}/{}.{}",
            request.file_id, stem, self.config.target_extension
        );
        let locator = match ObjectLocator::new(&request.job_id, &name) {
            Ok(locator) => locator,
            Err(e) => return storage_failure("invalid output location", e),
        };

        match self.storage.put(&locator, &bytes).await {
            Ok(key) => {
                log::info!("Converted {} -> {}", request.file_name, key);
                Ok(ConversionOutcome::succeeded(key))
            }
            Err(e) => storage_failure("cannot store output", e),
        }
    }
}
