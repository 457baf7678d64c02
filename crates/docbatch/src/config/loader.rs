use std::path::Path;

use crate::config::schema::{Config, StorageConfig};
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(invalid(format!(
            "Unsupported config version: {}",
            config.version
        )));
    }

    if config.worker_count == 0 {
        return Err(invalid("workerCount must be at least 1"));
    }
    if config.max_attempts == 0 {
        return Err(invalid("maxAttempts must be at least 1"));
    }
    if config.storage_timeout_secs == 0 {
        return Err(invalid("storageTimeoutSecs must be at least 1"));
    }
    if config.archive_lease_secs == 0 {
        return Err(invalid("archiveLeaseSecs must be at least 1"));
    }

    let converter = &config.converter;
    if converter.program.trim().is_empty() {
        return Err(invalid("converter.program must not be empty"));
    }
    if converter.timeout_secs == 0 {
        return Err(invalid("converter.timeoutSecs must be at least 1"));
    }
    if converter.target_extension.is_empty()
        || !converter
            .target_extension
            .chars()
            .all(|c| c.is_ascii_alphanumeric())
    {
        return Err(invalid(format!(
            "converter.targetExtension '{}' must be alphanumeric",
            converter.target_extension
        )));
    }
    if !converter.args.iter().any(|a| a.contains("{input}")) {
        return Err(invalid("converter.args must reference {input}"));
    }

    match &config.storage {
        StorageConfig::Local(local) => {
            if local.root.trim().is_empty() {
                return Err(invalid("storage.root must not be empty"));
            }
        }
        StorageConfig::S3(s3) => {
            if s3.bucket.trim().is_empty() {
                return Err(invalid("storage.bucket must not be empty"));
            }
            if s3.region.trim().is_empty() {
                return Err(invalid("storage.region must not be empty"));
            }
            if !s3.access_key.is_configured() || !s3.secret_key.is_configured() {
                return Err(invalid(
                    "storage.accessKey and storage.secretKey need a value, file or env source",
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config_json() -> String {
        r#"{
            "version": "1.0",
            "storage": { "kind": "local", "root": "/tmp/docbatch" }
        }"#
        .to_string()
    }

    #[test]
    fn test_load_minimal_local_config() {
        let config = load_config_from_str(&local_config_json()).unwrap();
        assert_eq!(config.version, "1.0");
        assert!(config.worker_count > 0);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.public_base_url, "http://localhost:8088");
        assert_eq!(config.converter.program, "libreoffice");
        assert_eq!(config.converter.target_extension, "pdf");
        assert!(matches!(config.storage, StorageConfig::Local(ref l) if l.root == "/tmp/docbatch"));
    }

    #[test]
    fn test_load_s3_config() {
        let json = r#"{
            "version": "1.0",
            "workerCount": 4,
            "storage": {
                "kind": "s3",
                "bucket": "upload",
                "region": "eu-west-1",
                "endpoint": "http://localhost:9000",
                "accessKey": { "value": "minio" },
                "secretKey": { "env": "MINIO_SECRET" }
            }
        }"#;
        let config = load_config_from_str(json).unwrap();
        assert_eq!(config.worker_count, 4);
        match config.storage {
            StorageConfig::S3(s3) => {
                assert_eq!(s3.bucket, "upload");
                assert_eq!(s3.endpoint.as_deref(), Some("http://localhost:9000"));
                assert_eq!(s3.download_base_url(), "https://upload.s3.amazonaws.com");
            }
            other => panic!("expected s3 storage, got {:?}", other),
        }
    }

    #[test]
    fn test_s3_defaults_to_aws_env_credentials() {
        let json = r#"{
            "version": "1.0",
            "storage": { "kind": "s3", "bucket": "b", "region": "us-east-1" }
        }"#;
        let config = load_config_from_str(json).unwrap();
        match config.storage {
            StorageConfig::S3(s3) => {
                assert_eq!(s3.access_key.env.as_deref(), Some("AWS_ACCESS_KEY_ID"));
                assert_eq!(s3.secret_key.env.as_deref(), Some("AWS_SECRET_ACCESS_KEY"));
            }
            _ => panic!("expected s3 storage"),
        }
    }

    #[test]
    fn test_rejects_unknown_version() {
        let json = local_config_json().replace("1.0", "2.0");
        let err = load_config_from_str(&json).unwrap_err();
        assert!(err.to_string().contains("Unsupported config version"));
    }

    #[test]
    fn test_rejects_zero_workers() {
        let json = r#"{
            "version": "1.0",
            "workerCount": 0,
            "storage": { "kind": "local", "root": "/tmp/x" }
        }"#;
        assert!(matches!(
            load_config_from_str(json),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn test_rejects_converter_without_input_placeholder() {
        let json = r#"{
            "version": "1.0",
            "storage": { "kind": "local", "root": "/tmp/x" },
            "converter": { "program": "soffice", "args": ["--headless"] }
        }"#;
        let err = load_config_from_str(json).unwrap_err();
        assert!(err.to_string().contains("{input}"));
    }

    #[test]
    fn test_rejects_bad_target_extension() {
        let json = r#"{
            "version": "1.0",
            "storage": { "kind": "local", "root": "/tmp/x" },
            "converter": { "targetExtension": "../pdf" }
        }"#;
        assert!(load_config_from_str(json).is_err());
    }

    #[test]
    fn test_rejects_invalid_json() {
        assert!(matches!(
            load_config_from_str("{ not json"),
            Err(ConfigError::ParseJson(_))
        ));
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config("/nonexistent/docbatch.json").unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }
}
