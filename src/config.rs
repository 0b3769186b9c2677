//! Configuration and shared value types for policy synchronization

use crate::error::{Result, WardenError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// File extensions recognized as policy documents
pub const POLICY_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Git repository configuration for one policy source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositoryConfig {
    /// Repository URL (HTTPS or SSH)
    pub url: String,

    /// Branch to track
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Path within the repository containing policy files
    #[serde(default = "default_policy_path")]
    pub policy_path: PathBuf,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Polling configuration
    #[serde(default)]
    pub poll: PollConfig,

    /// Clone configuration
    #[serde(default)]
    pub clone: CloneConfig,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_policy_path() -> PathBuf {
    PathBuf::from("policies")
}

impl RepositoryConfig {
    /// Validate the configuration. Fails before any network access.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(WardenError::Config(
                "repository url must not be empty".to_string(),
            ));
        }
        if self.branch.trim().is_empty() {
            return Err(WardenError::Config(
                "repository branch must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Load a configuration file, picking the format from the extension
    /// (`.toml` is parsed as TOML, everything else as YAML).
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            WardenError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;

        let config: RepositoryConfig = if path.extension().map(|e| e == "toml").unwrap_or(false) {
            toml::from_str(&content)
                .map_err(|e| WardenError::Config(format!("failed to parse TOML config: {}", e)))?
        } else {
            serde_yaml::from_str(&content)
                .map_err(|e| WardenError::Config(format!("failed to parse YAML config: {}", e)))?
        };

        config.validate()?;
        Ok(config)
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Authentication kind
    #[serde(default)]
    pub kind: AuthKind,

    /// Bearer token (for `token` auth)
    pub token: Option<String>,

    /// Private key path (for `key-pair` auth)
    pub key_path: Option<PathBuf>,

    /// Private key passphrase (for `key-pair` auth)
    pub key_passphrase: Option<String>,
}

/// Authentication kind. Closed set: an unrecognized kind string is rejected
/// when the configuration is deserialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthKind {
    /// No authentication (public repositories)
    #[default]
    None,
    /// Bearer token sent as an HTTP basic credential
    Token,
    /// SSH key pair
    KeyPair,
}

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollConfig {
    /// Enable the background poll loop
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between poll ticks
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Deadline for a single clone/pull/rollback operation
    #[serde(default = "default_op_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Window used to coalesce rapid successive policy changes
    #[serde(default = "default_debounce", with = "humantime_serde")]
    pub debounce: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_poll_interval(),
            timeout: default_op_timeout(),
            debounce: default_debounce(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_op_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_debounce() -> Duration {
    Duration::from_secs(2)
}

/// Clone configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloneConfig {
    /// Shallow clone depth (0 = full history)
    #[serde(default)]
    pub depth: u32,

    /// Local working-copy directory
    #[serde(default = "default_local_path")]
    pub local_path: PathBuf,

    /// Remove any existing working copy before cloning
    #[serde(default)]
    pub clean_on_start: bool,
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            depth: 0,
            local_path: default_local_path(),
            clean_on_start: false,
        }
    }
}

fn default_local_path() -> PathBuf {
    PathBuf::from("/var/lib/warden/policies")
}

/// Commit metadata read from the working copy. Never mutated after creation.
#[derive(Debug, Clone, Serialize)]
pub struct CommitInfo {
    /// Full revision identifier
    pub sha: String,
    /// Author name
    pub author: String,
    /// Author email
    pub email: String,
    /// Commit timestamp
    pub timestamp: DateTime<Utc>,
    /// Commit message (subject line)
    pub message: String,
    /// Branch the commit was read from
    pub branch: String,
    /// Source repository URL
    pub repo_url: String,
}

/// Summary of one synchronization attempt
#[derive(Debug, Clone, Serialize)]
pub struct PullResult {
    /// Revision before the pull
    pub from_sha: String,
    /// Revision after the pull
    pub to_sha: String,
    /// Paths that differ between the two revisions, relative to the repo root
    pub changed_files: Vec<String>,
    /// Whether the pull moved the working copy
    pub had_changes: bool,
}

/// Counters owned by the repository, read via a copying snapshot
#[derive(Debug, Clone, Default)]
pub struct RepositoryMetrics {
    /// Duration of the initial clone
    pub clone_duration: Option<Duration>,
    /// Duration of the most recent successful pull
    pub last_pull_duration: Option<Duration>,
    /// Last revision observed at the tip of the working copy
    pub last_known_revision: Option<String>,
    /// Timestamp of the last successful pull
    pub last_successful_pull: Option<DateTime<Utc>>,
    /// Cumulative successful pulls
    pub pulls_succeeded: u64,
    /// Cumulative failed pulls
    pub pulls_failed: u64,
}

/// Counters owned by the watcher, read via a copying snapshot
#[derive(Debug, Clone, Default)]
pub struct WatcherMetrics {
    /// Poll ticks executed
    pub polls: u64,
    /// Reloads that completed successfully
    pub successful_reloads: u64,
    /// Reloads rejected by the validation callback
    pub failed_reloads: u64,
    /// Timestamp of the last reload attempt that finished
    pub last_reload_at: Option<DateTime<Utc>>,
    /// Duration of the last reload attempt
    pub last_reload_duration: Option<Duration>,
    /// Polls whose changes touched no policy file
    pub skipped_polls: u64,
    /// Failed pulls since the last successful one
    pub consecutive_pull_failures: u32,
}

/// Whether a repo-relative path counts as a policy file: it must live under
/// `policy_path`, carry a recognized extension, and contain no path segment
/// starting with `.`.
pub fn is_policy_file(path: &str, policy_path: &Path) -> bool {
    let path = Path::new(path);

    let rest = if policy_path.as_os_str().is_empty() || policy_path == Path::new(".") {
        path
    } else {
        match path.strip_prefix(policy_path) {
            Ok(rest) => rest,
            Err(_) => return false,
        }
    };
    if rest.as_os_str().is_empty() {
        return false;
    }

    for component in path.components() {
        if let Component::Normal(seg) = component {
            if seg.to_string_lossy().starts_with('.') {
                return false;
            }
        }
    }

    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => POLICY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config(url: &str, branch: &str) -> RepositoryConfig {
        RepositoryConfig {
            url: url.to_string(),
            branch: branch.to_string(),
            policy_path: PathBuf::from("policies"),
            auth: AuthConfig::default(),
            poll: PollConfig::default(),
            clone: CloneConfig::default(),
        }
    }

    #[test]
    fn test_validate_rejects_empty_url() {
        let config = minimal_config("", "main");
        assert!(matches!(config.validate(), Err(WardenError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_branch() {
        let config = minimal_config("https://example.com/policies.git", "  ");
        assert!(matches!(config.validate(), Err(WardenError::Config(_))));
    }

    #[test]
    fn test_defaults_from_yaml() {
        let yaml = "url: https://example.com/policies.git\n";
        let config: RepositoryConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.branch, "main");
        assert_eq!(config.policy_path, PathBuf::from("policies"));
        assert_eq!(config.auth.kind, AuthKind::None);
        assert!(config.poll.enabled);
        assert_eq!(config.poll.interval, Duration::from_secs(60));
        assert_eq!(config.clone.depth, 0);
        assert!(!config.clone.clean_on_start);
    }

    #[test]
    fn test_humantime_durations_from_yaml() {
        let yaml = r#"
url: https://example.com/policies.git
poll:
  interval: 5s
  timeout: 2s
  debounce: 250ms
"#;
        let config: RepositoryConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.poll.interval, Duration::from_secs(5));
        assert_eq!(config.poll.timeout, Duration::from_secs(2));
        assert_eq!(config.poll.debounce, Duration::from_millis(250));
    }

    #[test]
    fn test_unknown_auth_kind_rejected() {
        let yaml = r#"
url: https://example.com/policies.git
auth:
  kind: kerberos
"#;
        let result: std::result::Result<RepositoryConfig, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_key_pair_kind_string() {
        let yaml = r#"
url: https://example.com/policies.git
auth:
  kind: key-pair
  key_path: /etc/warden/deploy_key
"#;
        let config: RepositoryConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.auth.kind, AuthKind::KeyPair);
    }

    #[test]
    fn test_is_policy_file_scoping() {
        let root = Path::new("policies");

        assert!(is_policy_file("policies/limits.yaml", root));
        assert!(is_policy_file("policies/teams/search.yml", root));
        assert!(is_policy_file("policies/routes.json", root));

        // Outside the policy path
        assert!(!is_policy_file("docs/limits.yaml", root));
        // Unrecognized extension
        assert!(!is_policy_file("policies/README.md", root));
        assert!(!is_policy_file("policies/limits", root));
        // Hidden segments anywhere in the path
        assert!(!is_policy_file("policies/.hidden.yaml", root));
        assert!(!is_policy_file("policies/.cache/limits.yaml", root));
        // The policy path itself is not a policy file
        assert!(!is_policy_file("policies", root));
    }

    #[test]
    fn test_is_policy_file_repo_root() {
        assert!(is_policy_file("limits.yaml", Path::new("")));
        assert!(is_policy_file("limits.yaml", Path::new(".")));
        assert!(!is_policy_file(".github/workflows/ci.yaml", Path::new(".")));
    }

    #[test]
    fn test_from_file_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(
            &path,
            "url = \"https://example.com/policies.git\"\nbranch = \"release\"\n",
        )
        .unwrap();

        let config = RepositoryConfig::from_file(&path).unwrap();
        assert_eq!(config.branch, "release");
    }
}
