use chrono::NaiveDate;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::storage::Location;

pub const DEFAULT_SONG_GLOB: &str = "song_data/A/A/A/*.json";
pub const DEFAULT_LOG_GLOB: &str = "log_data/2018/11/2018-11*.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("Missing required key: {0}")]
    MissingKey(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub iam: Option<IamConfig>,
    #[serde(default)]
    pub songs: SongsConfig,
    #[serde(default)]
    pub logs: LogsConfig,
    #[serde(default)]
    pub limits: RowLimits,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub input: String,
    pub output: String,
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services.
    pub endpoint: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
}

#[derive(Deserialize, Clone)]
pub struct IamConfig {
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub aws_session_token: Option<String>,
}

impl std::fmt::Debug for IamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IamConfig")
            .field("aws_access_key_id", &self.aws_access_key_id)
            .field("aws_secret_access_key", &"<redacted>")
            .field(
                "aws_session_token",
                &self.aws_session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SongsConfig {
    pub glob: String,
}

impl Default for SongsConfig {
    fn default() -> Self {
        Self {
            glob: DEFAULT_SONG_GLOB.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeZonePolicy {
    #[default]
    Utc,
    /// Wall clock of the host running the job.
    Local,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LogsConfig {
    pub glob: String,
    pub time_zone: TimeZonePolicy,
    pub from: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            glob: DEFAULT_LOG_GLOB.to_string(),
            time_zone: TimeZonePolicy::default(),
            from: None,
            until: None,
        }
    }
}

/// Row caps applied right before a table is written. `None` means unlimited.
#[derive(Debug, Deserialize, Clone, Copy, Default)]
#[serde(default)]
pub struct RowLimits {
    pub users: Option<u32>,
    pub time: Option<u32>,
    pub songplays: Option<u32>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn input_location(&self) -> Result<Location, ConfigError> {
        Location::parse(&self.storage.input).map_err(|reason| ConfigError::Invalid {
            key: "storage.input",
            reason,
        })
    }

    pub fn output_location(&self) -> Result<Location, ConfigError> {
        Location::parse(&self.storage.output).map_err(|reason| ConfigError::Invalid {
            key: "storage.output",
            reason,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let input = self.input_location()?;
        let output = self.output_location()?;

        if input.is_s3() || output.is_s3() {
            let iam = self.iam.as_ref().ok_or(ConfigError::MissingKey("iam"))?;
            if iam.aws_access_key_id.trim().is_empty() {
                return Err(ConfigError::MissingKey("iam.aws_access_key_id"));
            }
            if iam.aws_secret_access_key.trim().is_empty() {
                return Err(ConfigError::MissingKey("iam.aws_secret_access_key"));
            }
        }

        validate_glob("songs.glob", &self.songs.glob)?;
        validate_glob("logs.glob", &self.logs.glob)?;

        if let (Some(from), Some(until)) = (self.logs.from, self.logs.until) {
            if from > until {
                return Err(ConfigError::Invalid {
                    key: "logs.from",
                    reason: format!("{} is after logs.until {}", from, until),
                });
            }
        }

        for (key, limit) in [
            ("limits.users", self.limits.users),
            ("limits.time", self.limits.time),
            ("limits.songplays", self.limits.songplays),
        ] {
            if limit == Some(0) {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "row limit must be greater than zero".to_string(),
                });
            }
        }

        Ok(())
    }
}

fn validate_glob(key: &'static str, glob: &str) -> Result<(), ConfigError> {
    if glob.trim().is_empty() {
        return Err(ConfigError::MissingKey(key));
    }
    if glob.starts_with('/') {
        return Err(ConfigError::Invalid {
            key,
            reason: "pattern must be relative to the input location".to_string(),
        });
    }
    Ok(())
}
