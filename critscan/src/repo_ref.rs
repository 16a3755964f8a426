use std::fmt;

use serde::Serialize;
use url::Url;

use crate::config::AcquireConfig;
use crate::error::PipelineError;

const MIN_REFERENCE_LEN: usize = 10;
const MAX_REFERENCE_LEN: usize = 300;

/// A repository reference that passed the acquisition trust policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryRef {
    pub raw: String,
    pub scheme: String,
    pub host: String,
    pub owner: String,
    pub name: String,
}

impl RepositoryRef {
    /// Canonical URL handed to git, rebuilt from the validated parts.
    pub fn clone_url(&self) -> String {
        format!("{}://{}/{}/{}", self.scheme, self.host, self.owner, self.name)
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Allow-lists for transports and hosts. Anything not listed is denied.
#[derive(Debug, Clone)]
pub struct RepositoryPolicy {
    allowed_schemes: Vec<String>,
    allowed_hosts: Vec<String>,
}

impl RepositoryPolicy {
    pub fn new(
        schemes: impl IntoIterator<Item = impl Into<String>>,
        hosts: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            allowed_schemes: schemes
                .into_iter()
                .map(|s| s.into().to_ascii_lowercase())
                .collect(),
            allowed_hosts: hosts
                .into_iter()
                .map(|h| h.into().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &AcquireConfig) -> Self {
        Self::new(config.allowed_schemes.clone(), config.allowed_hosts.clone())
    }

    pub fn validate(&self, raw: &str) -> Result<RepositoryRef, PipelineError> {
        let reject = |reason: &str| PipelineError::invalid_reference(raw, reason);
        let trimmed = raw.trim();

        if trimmed.len() < MIN_REFERENCE_LEN || trimmed.len() > MAX_REFERENCE_LEN {
            return Err(reject(&format!(
                "length must be between {MIN_REFERENCE_LEN} and {MAX_REFERENCE_LEN} characters"
            )));
        }

        let url = Url::parse(trimmed).map_err(|e| reject(&format!("not a URL: {e}")))?;

        if !self.allowed_schemes.iter().any(|s| s == url.scheme()) {
            return Err(reject(&format!("transport {:?} is not allowed", url.scheme())));
        }
        let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
            return Err(reject("missing host"));
        };
        if !self.allowed_hosts.iter().any(|h| *h == host) {
            return Err(reject(&format!("host {host:?} is not allowed")));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(reject("credentials are not allowed"));
        }
        if url.port().is_some() {
            return Err(reject("explicit ports are not allowed"));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(reject("query strings and fragments are not allowed"));
        }

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();
        let [owner, name] = segments.as_slice() else {
            return Err(reject("expected a path of the form /owner/repository"));
        };
        for segment in [owner, name] {
            if !is_valid_segment(segment) {
                return Err(reject(&format!("invalid path segment {segment:?}")));
            }
        }

        Ok(RepositoryRef {
            raw: trimmed.to_string(),
            scheme: url.scheme().to_string(),
            host,
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

impl Default for RepositoryPolicy {
    fn default() -> Self {
        Self::from_config(&AcquireConfig::default())
    }
}

fn is_valid_segment(segment: &str) -> bool {
    segment != "."
        && segment != ".."
        && !segment.starts_with('-')
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(raw: &str) -> Result<RepositoryRef, PipelineError> {
        RepositoryPolicy::default().validate(raw)
    }

    fn assert_rejected(raw: &str) {
        match validate(raw) {
            Err(PipelineError::InvalidRepositoryReference { .. }) => {}
            other => panic!("{raw:?} should be rejected, got {other:?}"),
        }
    }

    #[test]
    fn accepts_plain_github_url() {
        let r = validate("https://github.com/mikiteek/NodeGoat").unwrap();
        assert_eq!(r.owner, "mikiteek");
        assert_eq!(r.name, "NodeGoat");
        assert_eq!(r.host, "github.com");
        assert_eq!(r.clone_url(), "https://github.com/mikiteek/NodeGoat");
        assert_eq!(r.full_name(), "mikiteek/NodeGoat");
    }

    #[test]
    fn trims_and_tolerates_trailing_slash_and_git_suffix() {
        let r = validate("  https://github.com/rust-lang/rust.git/ ").unwrap();
        assert_eq!(r.raw, "https://github.com/rust-lang/rust.git/");
        assert_eq!(r.name, "rust.git");
        assert_eq!(r.clone_url(), "https://github.com/rust-lang/rust.git");
    }

    #[test]
    fn host_comparison_is_case_insensitive() {
        let r = validate("https://GitHub.COM/owner/repo").unwrap();
        assert_eq!(r.host, "github.com");
    }

    #[test]
    fn rejects_disallowed_transports() {
        assert_rejected("http://github.com/owner/repo");
        assert_rejected("ssh://github.com/owner/repo");
        assert_rejected("file:///etc/passwd/owner/repo");
        assert_rejected("git://github.com/owner/repo");
        assert_rejected("ext::sh -c touch% /tmp/pwned");
    }

    #[test]
    fn rejects_other_hosts() {
        assert_rejected("https://gitlab.com/owner/repo");
        assert_rejected("https://github.com.evil.example/owner/repo");
        assert_rejected("https://127.0.0.1/owner/repo");
        assert_rejected("https://localhost/owner/repo");
        assert_rejected("https://169.254.169.254/latest/meta-data");
    }

    #[test]
    fn rejects_credentials_ports_queries_and_fragments() {
        assert_rejected("https://user:pw@github.com/owner/repo");
        assert_rejected("https://github.com:8443/owner/repo");
        assert_rejected("https://github.com/owner/repo?x=1");
        assert_rejected("https://github.com/owner/repo#readme");
    }

    #[test]
    fn rejects_bad_paths() {
        assert_rejected("https://github.com/owner");
        assert_rejected("https://github.com/owner/repo/tree/main");
        assert_rejected("https://github.com/owner/-repo");
        assert_rejected("https://github.com/owner/re%20po");
    }

    #[test]
    fn rejects_length_extremes() {
        assert_rejected("https://");
        let long = format!("https://github.com/owner/{}", "r".repeat(300));
        assert_rejected(&long);
    }

    #[test]
    fn custom_policy_allows_listed_hosts() {
        let policy = RepositoryPolicy::new(["https"], ["gitlab.com"]);
        assert!(policy.validate("https://gitlab.com/group/project").is_ok());
        assert!(policy.validate("https://github.com/owner/repo").is_err());
    }
}
