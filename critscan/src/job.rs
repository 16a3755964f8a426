use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MAX_JOB_ID_LEN: usize = 64;

/// Identifier of a scan job. Always safe to use as a single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for JobId {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            bail!("job id is empty");
        }
        if raw.len() > MAX_JOB_ID_LEN {
            bail!("job id exceeds {MAX_JOB_ID_LEN} bytes");
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            bail!("job id contains invalid character {c:?}: {raw}");
        }
        Ok(Self(raw.to_string()))
    }
}

impl TryFrom<String> for JobId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanStatus {
    Queued,
    Scanning,
    Finished,
    Failed,
}

impl ScanStatus {
    pub const ALL: [ScanStatus; 4] = [
        ScanStatus::Queued,
        ScanStatus::Scanning,
        ScanStatus::Finished,
        ScanStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, ScanStatus::Finished | ScanStatus::Failed)
    }

    /// `Scanning -> Scanning` is allowed so a job whose previous attempt died
    /// mid-pipeline can be picked up again.
    pub fn can_transition_to(self, next: ScanStatus) -> bool {
        matches!(
            (self, next),
            (ScanStatus::Queued, ScanStatus::Scanning)
                | (ScanStatus::Scanning, ScanStatus::Scanning)
                | (ScanStatus::Scanning, ScanStatus::Finished)
                | (ScanStatus::Scanning, ScanStatus::Failed)
        )
    }

    /// Statuses from which `next` may be entered.
    pub fn predecessors(next: ScanStatus) -> Vec<ScanStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Queued => "Queued",
            ScanStatus::Scanning => "Scanning",
            ScanStatus::Finished => "Finished",
            ScanStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Queued" => Ok(ScanStatus::Queued),
            "Scanning" => Ok(ScanStatus::Scanning),
            "Finished" => Ok(ScanStatus::Finished),
            "Failed" => Ok(ScanStatus::Failed),
            other => bail!("unknown scan status: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[serde(alias = "Unknown")]
    Unknown,
    #[serde(alias = "Low")]
    Low,
    #[serde(alias = "Medium")]
    Medium,
    #[serde(alias = "High")]
    High,
    #[serde(alias = "Critical")]
    Critical,
}

impl Severity {
    pub const MAX: Severity = Severity::Critical;
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Unknown => write!(f, "UNKNOWN"),
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// A validated vulnerability record extracted from a scanner report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub vulnerability_id: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.vulnerability_id, self.severity)?;
        if let Some(pkg) = &self.package_name {
            write!(f, " {pkg}")?;
            if let Some(installed) = &self.installed_version {
                write!(f, "@{installed}")?;
            }
        }
        if let Some(fixed) = &self.fixed_version {
            write!(f, " fixed in {fixed}")?;
        }
        if let Some(title) = &self.title {
            write!(f, ": {title}")?;
        }
        Ok(())
    }
}

/// A job record as held by the persistence collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: JobId,
    pub repository: String,
    pub status: ScanStatus,
    pub findings: Vec<Finding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScanJob {
    pub fn queued(id: JobId, repository: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            repository: repository.into(),
            status: ScanStatus::Queued,
            findings: vec![],
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }
}
