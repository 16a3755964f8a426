//! Incremental extraction of critical findings from scanner reports.
//!
//! The report is walked with serde visitors straight off a buffered reader:
//! result entries and their vulnerability arrays are visited one element at a
//! time, and only a single vulnerability entry is ever materialized. Memory use
//! therefore tracks the largest entry, not the document.
//!
//! Expected shape (fields other than these are skipped unread):
//!
//! ```json
//! { "Results": [ { "Target": "...", "Vulnerabilities": [ { "VulnerabilityID": "...", "Severity": "CRITICAL" } ] } ] }
//! ```

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::PipelineError;
use crate::job::{Finding, Severity};

const READ_BUFFER: usize = 128 * 1024;
const RESULTS_FIELD: &str = "Results";
const VULNERABILITIES_FIELD: &str = "Vulnerabilities";

/// Counters gathered while walking a report.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionStats {
    pub results: usize,
    pub vulnerabilities: usize,
    pub below_threshold: usize,
    pub skipped_invalid: usize,
}

#[derive(Debug, Default)]
pub struct Extraction {
    pub findings: Vec<Finding>,
    pub stats: ExtractionStats,
}

/// Extract critical findings from the report at `path` on the blocking pool.
#[instrument(skip(path), fields(path = %path.display()))]
pub async fn extract_report(path: PathBuf) -> Result<Extraction, PipelineError> {
    let task_path = path.clone();
    let extraction = tokio::task::spawn_blocking(move || extract_file(&task_path))
        .await
        .map_err(|e| PipelineError::ReportParseFailed {
            path: path.clone(),
            source: Box::new(e),
        })??;
    debug!(
        findings = extraction.findings.len(),
        results = extraction.stats.results,
        vulnerabilities = extraction.stats.vulnerabilities,
        skipped = extraction.stats.skipped_invalid,
        "report extracted"
    );
    Ok(extraction)
}

pub fn extract_file(path: &Path) -> Result<Extraction, PipelineError> {
    let parse_failed = |source: Box<dyn std::error::Error + Send + Sync>| {
        PipelineError::ReportParseFailed {
            path: path.to_path_buf(),
            source,
        }
    };
    let file = File::open(path).map_err(|e| parse_failed(Box::new(e)))?;
    extract_from_reader(BufReader::with_capacity(READ_BUFFER, file))
        .map_err(|e| parse_failed(Box::new(e)))
}

/// Walk a report from any reader. Structural problems (bad framing,
/// truncation, trailing garbage) are errors; malformed vulnerability entries
/// are counted and skipped.
pub fn extract_from_reader<R: Read>(reader: R) -> Result<Extraction, serde_json::Error> {
    let mut extraction = Extraction::default();
    let mut de = serde_json::Deserializer::from_reader(reader);
    ReportSeed {
        out: &mut extraction,
    }
    .deserialize(&mut de)?;
    de.end()?;
    Ok(extraction)
}

/// Result of decoding one untrusted vulnerability entry.
#[derive(Debug)]
enum DecodedEntry {
    Valid(Finding),
    Invalid(String),
}

#[derive(Deserialize)]
struct RawVulnerability {
    #[serde(rename = "VulnerabilityID")]
    vulnerability_id: String,
    #[serde(rename = "Severity")]
    severity: Severity,
    #[serde(rename = "PkgName")]
    package_name: Option<String>,
    #[serde(rename = "PkgID")]
    package_id: Option<String>,
    #[serde(rename = "InstalledVersion")]
    installed_version: Option<String>,
    #[serde(rename = "FixedVersion")]
    fixed_version: Option<String>,
    #[serde(rename = "Status")]
    status: Option<String>,
    #[serde(rename = "Title")]
    title: Option<String>,
    #[serde(rename = "Description")]
    description: Option<String>,
    #[serde(rename = "PrimaryURL")]
    primary_url: Option<String>,
    #[serde(rename = "References")]
    references: Option<Vec<String>>,
}

fn decode_entry(value: Value) -> DecodedEntry {
    let raw: RawVulnerability = match serde_json::from_value(value) {
        Ok(raw) => raw,
        Err(e) => return DecodedEntry::Invalid(e.to_string()),
    };
    if raw.vulnerability_id.trim().is_empty() {
        return DecodedEntry::Invalid("empty vulnerability identifier".to_string());
    }
    DecodedEntry::Valid(Finding {
        vulnerability_id: raw.vulnerability_id,
        severity: raw.severity,
        package_name: raw.package_name,
        package_id: raw.package_id,
        installed_version: raw.installed_version,
        fixed_version: raw.fixed_version,
        status: raw.status,
        title: raw.title,
        description: raw.description,
        primary_url: raw.primary_url,
        references: raw.references.unwrap_or_default(),
    })
}

impl Extraction {
    fn offer(&mut self, value: Value) {
        self.stats.vulnerabilities += 1;
        match decode_entry(value) {
            DecodedEntry::Valid(finding) if finding.severity == Severity::MAX => {
                self.findings.push(finding);
            }
            DecodedEntry::Valid(_) => self.stats.below_threshold += 1,
            DecodedEntry::Invalid(reason) => {
                debug!(%reason, "skipping malformed vulnerability entry");
                self.stats.skipped_invalid += 1;
            }
        }
    }
}

/// Visitor methods that accept and discard any non-container value.
macro_rules! skip_scalars {
    ($value:expr) => {
        fn visit_bool<E: de::Error>(self, _: bool) -> Result<Self::Value, E> {
            Ok($value)
        }
        fn visit_i64<E: de::Error>(self, _: i64) -> Result<Self::Value, E> {
            Ok($value)
        }
        fn visit_u64<E: de::Error>(self, _: u64) -> Result<Self::Value, E> {
            Ok($value)
        }
        fn visit_f64<E: de::Error>(self, _: f64) -> Result<Self::Value, E> {
            Ok($value)
        }
        fn visit_str<E: de::Error>(self, _: &str) -> Result<Self::Value, E> {
            Ok($value)
        }
        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok($value)
        }
        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok($value)
        }
    };
}

/// Top level: an object whose `Results` field is streamed.
struct ReportSeed<'a> {
    out: &'a mut Extraction,
}

impl<'de> DeserializeSeed<'de> for ReportSeed<'_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for ReportSeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a scanner report object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while let Some(key) = map.next_key::<String>()? {
            if key == RESULTS_FIELD {
                map.next_value_seed(ResultsSeed {
                    out: &mut *self.out,
                })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}

/// `Results`: an array of result entries, or null.
struct ResultsSeed<'a> {
    out: &'a mut Extraction,
}

impl<'de> DeserializeSeed<'de> for ResultsSeed<'_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_option(self)
    }
}

impl<'de> Visitor<'de> for ResultsSeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of scan results")
    }

    fn visit_none<E: de::Error>(self) -> Result<(), E> {
        Ok(())
    }

    fn visit_unit<E: de::Error>(self) -> Result<(), E> {
        Ok(())
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while seq
            .next_element_seed(ResultEntrySeed {
                out: &mut *self.out,
            })?
            .is_some()
        {}
        Ok(())
    }
}

/// One result entry. Non-object entries are skipped.
struct ResultEntrySeed<'a> {
    out: &'a mut Extraction,
}

impl<'de> DeserializeSeed<'de> for ResultEntrySeed<'_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for ResultEntrySeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a scan result object")
    }

    skip_scalars!(());

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while seq.next_element::<IgnoredAny>()?.is_some() {}
        Ok(())
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        self.out.stats.results += 1;
        while let Some(key) = map.next_key::<String>()? {
            if key == VULNERABILITIES_FIELD {
                map.next_value_seed(VulnerabilitiesSeed {
                    out: &mut *self.out,
                })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}

/// `Vulnerabilities`: each element is decoded on its own and then dropped.
struct VulnerabilitiesSeed<'a> {
    out: &'a mut Extraction,
}

impl<'de> DeserializeSeed<'de> for VulnerabilitiesSeed<'_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for VulnerabilitiesSeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of vulnerabilities")
    }

    skip_scalars!(());

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while map.next_entry::<IgnoredAny, IgnoredAny>()?.is_some() {}
        Ok(())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while let Some(value) = seq.next_element::<Value>()? {
            self.out.offer(value);
        }
        Ok(())
    }
}
