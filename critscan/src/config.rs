use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://critscan.db?mode=rwc";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root of the subtree that staged clones and reports live under.
    pub sandbox_root: PathBuf,
    pub database_url: String,
    pub acquire: AcquireConfig,
    pub scanner: ScannerConfig,
    pub worker: WorkerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sandbox_root: PathBuf::from("tmp"),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            acquire: AcquireConfig::default(),
            scanner: ScannerConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file, or return defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        raw.parse::<Self>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }
}

impl std::str::FromStr for Config {
    type Err = toml::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AcquireConfig {
    pub allowed_schemes: Vec<String>,
    pub allowed_hosts: Vec<String>,
    pub timeout_secs: u64,
    pub git_program: String,
    pub capture_limit: usize,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            allowed_schemes: vec!["https".to_string()],
            allowed_hosts: vec!["github.com".to_string()],
            timeout_secs: 120,
            git_program: "git".to_string(),
            capture_limit: 16 * 1024,
        }
    }
}

impl AcquireConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// How the external scanner is launched.
///
/// `args` may contain `{source}`, `{reports}`, `{report_file}` and `{job_id}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScannerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub capture_limit: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        let args = [
            "compose",
            "run",
            "--rm",
            "-T",
            "-v",
            "{source}:/work:ro",
            "-v",
            "{reports}:/reports",
            "trivy",
            "fs",
            "--quiet",
            "--format",
            "json",
            "--output",
            "/reports/{report_file}",
            "/work",
        ];
        Self {
            program: "docker".to_string(),
            args: args.into_iter().map(String::from).collect(),
            timeout_secs: 15 * 60,
            capture_limit: 64 * 1024,
        }
    }
}

impl ScannerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    /// How often `work --follow` looks for newly queued jobs.
    pub poll_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            max_attempts: 1,
            poll_interval_secs: 5,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}
