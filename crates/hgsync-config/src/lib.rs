//! Configuration file handling for hgsync.
//!
//! The service is driven by a single TOML file: broker connection settings,
//! the clone directory, the repositories to track, and the branch/tag
//! mappings. Loading applies environment-variable overrides (every
//! `pulse.*` field via `PULSE_<FIELD>`, the Sentry DSN via `SENTRY_DSN`)
//! and then validates cross-references: every mapping must point at a
//! tracked repository and every pattern must compile.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! let config = hgsync_config::Config::from_file(Path::new("config.toml")).expect("load");
//! println!("queue: {}", config.pulse.queue);
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced while loading or validating a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("mapping references untracked repository {source_url}")]
    UntrackedMappingSource { source_url: String },
    #[error("invalid pattern {pattern:?}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: Box<regex::Error>,
    },
    #[error("environment override {name}={value:?} is not valid for this field")]
    InvalidEnvOverride { name: String, value: String },
}

/// Broker connection settings (`[pulse]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulseConfig {
    pub userid: String,
    pub host: String,
    pub port: u16,
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
    pub password: String,
    /// Connection heartbeat interval, seconds.
    #[serde(default = "default_heartbeat")]
    pub heartbeat: u16,
    /// Connect over TLS (`amqps`).
    #[serde(default = "default_ssl")]
    pub ssl: bool,
}

fn default_heartbeat() -> u16 {
    10
}

fn default_ssl() -> bool {
    true
}

/// Local clone storage (`[clones]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClonesConfig {
    /// Directory under which one clone per tracked repository is kept.
    pub directory: PathBuf,
}

/// A source repository whose push events are processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedRepository {
    pub name: String,
    pub url: String,
}

/// Maps branches of one source repository onto a destination.
///
/// `branch_pattern` is an anchored regular expression; `destination_url`
/// and `destination_branch` are substitution templates which may use `$n`
/// capture-group back-references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchMapping {
    pub source_url: String,
    pub branch_pattern: String,
    pub destination_url: String,
    pub destination_branch: String,
}

/// Maps tags of one source repository onto a destination tags branch.
///
/// `destination_url` is a substitution template like in [`BranchMapping`];
/// `tags_destination_branch` and `tag_message_suffix` are copied verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagMapping {
    pub source_url: String,
    pub tag_pattern: String,
    pub destination_url: String,
    pub tags_destination_branch: String,
    pub tag_message_suffix: String,
}

/// Optional error-reporting settings (`[sentry]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SentryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentry_dsn: Option<String>,
}

/// Complete hgsync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub pulse: PulseConfig,
    pub clones: ClonesConfig,
    #[serde(default)]
    pub tracked_repositories: Vec<TrackedRepository>,
    #[serde(default)]
    pub branch_mappings: Vec<BranchMapping>,
    #[serde(default)]
    pub tag_mappings: Vec<TagMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentry: Option<SentryConfig>,
}

impl Config {
    /// Load a configuration file, apply environment overrides, validate.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: Config =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `PULSE_<FIELD>` and `SENTRY_DSN` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_var("PULSE_USERID") {
            self.pulse.userid = v;
        }
        if let Some(v) = env_var("PULSE_HOST") {
            self.pulse.host = v;
        }
        if let Some(v) = env_var("PULSE_PORT") {
            self.pulse.port = parse_env("PULSE_PORT", &v)?;
        }
        if let Some(v) = env_var("PULSE_EXCHANGE") {
            self.pulse.exchange = v;
        }
        if let Some(v) = env_var("PULSE_ROUTING_KEY") {
            self.pulse.routing_key = v;
        }
        if let Some(v) = env_var("PULSE_QUEUE") {
            self.pulse.queue = v;
        }
        if let Some(v) = env_var("PULSE_PASSWORD") {
            self.pulse.password = v;
        }
        if let Some(v) = env_var("PULSE_HEARTBEAT") {
            self.pulse.heartbeat = parse_env("PULSE_HEARTBEAT", &v)?;
        }
        if let Some(v) = env_var("PULSE_SSL") {
            self.pulse.ssl = parse_env("PULSE_SSL", &v)?;
        }
        if let Some(v) = env_var("SENTRY_DSN") {
            self.sentry.get_or_insert_with(SentryConfig::default).sentry_dsn = Some(v);
        }
        Ok(())
    }

    /// Check cross-references and pattern syntax.
    ///
    /// Every mapping's `source_url` must be the URL of a tracked
    /// repository, and every pattern must be a valid regular expression.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tracked: HashSet<&str> = self
            .tracked_repositories
            .iter()
            .map(|repo| repo.url.as_str())
            .collect();

        for mapping in &self.branch_mappings {
            if !tracked.contains(mapping.source_url.as_str()) {
                return Err(ConfigError::UntrackedMappingSource {
                    source_url: mapping.source_url.clone(),
                });
            }
            check_pattern(&mapping.branch_pattern)?;
        }

        for mapping in &self.tag_mappings {
            if !tracked.contains(mapping.source_url.as_str()) {
                return Err(ConfigError::UntrackedMappingSource {
                    source_url: mapping.source_url.clone(),
                });
            }
            check_pattern(&mapping.tag_pattern)?;
        }

        Ok(())
    }

    /// A copy safe to print: the broker password is masked.
    pub fn redacted(&self) -> Config {
        let mut copy = self.clone();
        copy.pulse.password = "********".to_string();
        copy
    }

    /// The tracked repository with the given URL, if any.
    pub fn tracked_repository(&self, url: &str) -> Option<&TrackedRepository> {
        self.tracked_repositories.iter().find(|repo| repo.url == url)
    }

    /// Clone directory for one tracked repository.
    pub fn clone_path(&self, repo: &TrackedRepository) -> PathBuf {
        self.clones.directory.join(&repo.name)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidEnvOverride {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn check_pattern(pattern: &str) -> Result<(), ConfigError> {
    Regex::new(pattern).map(|_| ()).map_err(|source| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        source: Box::new(source),
    })
}
