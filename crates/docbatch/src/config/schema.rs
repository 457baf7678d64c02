use serde::{Deserialize, Serialize};

use crate::secrets::SecretSource;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub version: String,
    /// SQLite file; defaults to `~/.docbatch/data/docbatch.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Deliveries per task before a retryable failure becomes final.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base of download links handed out for local storage.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    #[serde(default = "default_storage_timeout_secs")]
    pub storage_timeout_secs: u64,
    /// How long an archive claim stays valid before another worker may take it over.
    #[serde(default = "default_archive_lease_secs")]
    pub archive_lease_secs: u64,
    pub storage: StorageConfig,
    #[serde(default)]
    pub converter: ConverterConfig,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_public_base_url() -> String {
    "http://localhost:8088".to_string()
}

fn default_storage_timeout_secs() -> u64 {
    30
}

fn default_archive_lease_secs() -> u64 {
    900
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
    Local(LocalStorageConfig),
    S3(S3StorageConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalStorageConfig {
    pub root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3StorageConfig {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint (MinIO, Garage, ...). Path-style addressing is used when set.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_access_key")]
    pub access_key: SecretSource,
    #[serde(default = "default_secret_key")]
    pub secret_key: SecretSource,
    /// Prefix for download links; defaults to `https://<bucket>.s3.amazonaws.com`.
    #[serde(default)]
    pub public_base_url: Option<String>,
}

fn default_access_key() -> SecretSource {
    SecretSource::from_env("AWS_ACCESS_KEY_ID")
}

fn default_secret_key() -> SecretSource {
    SecretSource::from_env("AWS_SECRET_ACCESS_KEY")
}

impl S3StorageConfig {
    pub fn download_base_url(&self) -> String {
        self.public_base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}.s3.amazonaws.com", self.bucket))
    }
}

/// External converter invocation.
///
/// `args` may contain the placeholders `{input}`, `{outdir}` and `{format}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverterConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default = "default_target_extension")]
    pub target_extension: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_program() -> String {
    "libreoffice".to_string()
}

fn default_args() -> Vec<String> {
    ["--headless", "--convert-to", "{format}", "--outdir", "{outdir}", "{input}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_target_extension() -> String {
    "pdf".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            target_extension: default_target_extension(),
            timeout_secs: default_timeout_secs(),
        }
    }
}
