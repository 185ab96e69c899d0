use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::schema::Config;
use crate::error::ConfigError;

/// Serialization format of a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// Picks the format from the file extension; anything but
    /// `.yaml`/`.yml` is read as JSON.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Json,
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content, ConfigFormat::from_path(path))
}

pub fn load_config_from_str(content: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
    let config: Config = match format {
        ConfigFormat::Json => serde_json::from_str(content)?,
        ConfigFormat::Yaml => serde_yaml::from_str(content)?,
    };

    validate_config(&config)?;

    Ok(config)
}

impl Config {
    /// Overrides fields from `SCHEMAFORGE_*` environment variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Same as [`Config::apply_env`] with a custom variable source.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("SCHEMAFORGE_DATA_DIR") {
            self.data_directory = Some(PathBuf::from(v));
        }
        if let Some(v) = get("SCHEMAFORGE_UPLOADS_DIR") {
            self.uploads_directory = Some(PathBuf::from(v));
        }
        if let Some(v) = get("SCHEMAFORGE_OUTPUT_DIR") {
            self.output_directory = Some(PathBuf::from(v));
        }
        if let Some(v) = get("SCHEMAFORGE_ARCHIVE_DIR") {
            self.archive_directory = Some(PathBuf::from(v));
        }
        if let Some(v) = get("SCHEMAFORGE_QUEUE_DB") {
            self.queue.database_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("SCHEMAFORGE_MAX_ATTEMPTS") {
            self.queue.max_attempts = parse_env("SCHEMAFORGE_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("SCHEMAFORGE_LEASE_TIMEOUT_SECS") {
            self.queue.lease_timeout_secs = parse_env("SCHEMAFORGE_LEASE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("SCHEMAFORGE_WORKER_COUNT") {
            self.worker_count = parse_env("SCHEMAFORGE_WORKER_COUNT", &v)?;
        }
        if let Some(v) = get("SCHEMAFORGE_ARTIFACT_TTL_SECS") {
            self.artifact_ttl_secs = parse_env("SCHEMAFORGE_ARTIFACT_TTL_SECS", &v)?;
        }
        if let Some(v) = get("SCHEMAFORGE_GENERATOR") {
            let mut parts = v.split_whitespace().map(str::to_string);
            if let Some(program) = parts.next() {
                self.generator.program = program;
                self.generator.args = parts.collect();
            }
        }

        validate_config(self)
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name: name.to_string(),
        value: value.to_string(),
    })
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let invalid = |message: &str| {
        Err(ConfigError::Validation {
            message: message.to_string(),
        })
    };

    if config.worker_count == 0 {
        return invalid("workerCount must be at least 1");
    }
    if config.queue.max_attempts == 0 {
        return invalid("queue.maxAttempts must be at least 1");
    }
    if config.queue.lease_timeout_secs == 0 {
        return invalid("queue.leaseTimeoutSecs must be greater than 0");
    }
    if config.queue.poll_interval_ms == 0 {
        return invalid("queue.pollIntervalMs must be greater than 0");
    }
    if config.artifact_ttl_secs == 0 {
        return invalid("artifactTtlSecs must be greater than 0");
    }
    if config.sweep_interval_secs == 0 {
        return invalid("sweepIntervalSecs must be greater than 0");
    }
    if config.max_upload_bytes == 0 {
        return invalid("maxUploadBytes must be greater than 0");
    }
    if config.generator.program.trim().is_empty() {
        return invalid("generator.program must not be empty");
    }

    let extensions: Vec<&str> = config
        .accepted_extensions
        .iter()
        .map(|e| e.trim().trim_start_matches('.'))
        .collect();
    if extensions.is_empty() {
        return invalid("acceptedExtensions must not be empty");
    }
    if let Some(bad) = extensions
        .iter()
        .find(|e| e.is_empty() || e.contains(['.', '/', '\\']))
    {
        return Err(ConfigError::Validation {
            message: format!("Invalid accepted extension '{}'", bad),
        });
    }

    Ok(())
}
