//! Local working copy of the remote policy repository

use crate::auth::{mask_url, AuthStrategy, GitCredential};
use crate::config::{
    CommitInfo, PollConfig, PullResult, RepositoryConfig, RepositoryMetrics, POLICY_EXTENSIONS,
};
use crate::error::{Result, WardenError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Deadline for local-only git invocations (rev-parse, log, diff)
const LOCAL_GIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Field separator used in `git log --format` output
const LOG_FORMAT: &str = "%H%x1f%an%x1f%ae%x1f%aI%x1f%s";
const FIELD_SEP: char = '\u{1f}';

/// Manager for one local clone of the remote policy repository.
///
/// All operations that touch the working copy are serialized on an internal
/// lock; concurrent mutation of the same clone is never allowed.
pub struct GitRepository {
    config: RwLock<RepositoryConfig>,
    auth: AuthStrategy,
    state: RwLock<RepoState>,
    metrics: RwLock<RepositoryMetrics>,
    op_lock: Mutex<()>,
}

#[derive(Debug, Default)]
struct RepoState {
    cloned: bool,
}

impl GitRepository {
    /// Create a new repository manager. Validates the configuration and
    /// selects the authentication strategy; performs no network access.
    pub fn new(config: RepositoryConfig) -> Result<Self> {
        config.validate()?;
        let auth = AuthStrategy::from_config(&config.auth)?;

        Ok(Self {
            config: RwLock::new(config),
            auth,
            state: RwLock::new(RepoState::default()),
            metrics: RwLock::new(RepositoryMetrics::default()),
            op_lock: Mutex::new(()),
        })
    }

    /// Clone the configured branch into the local path. When a working copy
    /// already exists it is adopted, unless `clean_on_start` wipes it first.
    pub async fn clone_repo(&self, deadline: Duration) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let config = self.config.read().clone();
        let local = config.clone.local_path.clone();

        if config.clone.clean_on_start && local.exists() {
            info!(path = %local.display(), "Removing existing working copy");
            tokio::fs::remove_dir_all(&local).await?;
        }

        if local.join(".git").exists() {
            info!(path = %local.display(), "Adopting existing working copy");
            self.state.write().cloned = true;
            let head = self.rev_parse_inner(&local, "HEAD").await?;
            self.metrics.write().last_known_revision = Some(head);
            return Ok(());
        }

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                WardenError::Config(format!("failed to create clone directory: {}", e))
            })?;
        }

        let credential = self.auth.resolve()?;
        let url = credential.authenticated_url(&config.url);

        let mut args: Vec<String> = vec![
            "clone".to_string(),
            "--branch".to_string(),
            config.branch.clone(),
        ];
        if config.clone.depth > 0 {
            args.push("--depth".to_string());
            args.push(config.clone.depth.to_string());
            args.push("--single-branch".to_string());
        }
        args.push(url);
        args.push(local.display().to_string());

        info!(url = %mask_url(&config.url), branch = %config.branch, "Cloning policy repository");

        let start = Instant::now();
        self.run_git(&args, None, Some(&credential), deadline, "clone")
            .await?;
        let elapsed = start.elapsed();

        self.state.write().cloned = true;
        let head = self.rev_parse_inner(&local, "HEAD").await?;
        {
            let mut metrics = self.metrics.write();
            metrics.clone_duration = Some(elapsed);
            metrics.last_known_revision = Some(head.clone());
        }

        info!(commit = %head, duration_ms = elapsed.as_millis() as u64, "Repository cloned");
        Ok(())
    }

    /// Fetch and fast-forward the tracked branch to the remote tip.
    ///
    /// Fails with [`WardenError::NotCloned`] before a successful clone so
    /// callers can tell "not ready" from "remote down".
    pub async fn pull(&self, deadline: Duration) -> Result<PullResult> {
        let _guard = self.op_lock.lock().await;
        self.ensure_cloned()?;
        let config = self.config.read().clone();

        let start = Instant::now();
        let result = self.pull_inner(&config, deadline).await;

        let mut metrics = self.metrics.write();
        match &result {
            Ok(pull) => {
                metrics.pulls_succeeded += 1;
                metrics.last_pull_duration = Some(start.elapsed());
                metrics.last_successful_pull = Some(Utc::now());
                metrics.last_known_revision = Some(pull.to_sha.clone());
            }
            Err(_) => {
                metrics.pulls_failed += 1;
            }
        }
        result
    }

    async fn pull_inner(&self, config: &RepositoryConfig, deadline: Duration) -> Result<PullResult> {
        let local = &config.clone.local_path;
        let from = self.rev_parse_inner(local, "HEAD").await?;

        let credential = self.auth.resolve()?;
        self.run_git(
            &["pull", "--ff-only", "origin", &config.branch],
            Some(local),
            Some(&credential),
            deadline,
            "pull",
        )
        .await?;

        let to = self.rev_parse_inner(local, "HEAD").await?;
        let had_changes = from != to;
        let changed_files = if had_changes {
            self.changed_files_inner(local, &from, &to).await?
        } else {
            Vec::new()
        };

        if had_changes {
            info!(from = %from, to = %to, files = changed_files.len(), "Working copy updated");
        } else {
            debug!(commit = %to, "Remote tip unchanged");
        }

        Ok(PullResult {
            from_sha: from,
            to_sha: to,
            changed_files,
            had_changes,
        })
    }

    /// Read HEAD metadata from the working copy.
    pub async fn current_commit(&self) -> Result<CommitInfo> {
        let _guard = self.op_lock.lock().await;
        self.ensure_cloned()?;
        let config = self.config.read().clone();

        let out = self
            .run_git(
                &["log", "-1", &format!("--format={}", LOG_FORMAT), "HEAD"],
                Some(&config.clone.local_path),
                None,
                LOCAL_GIT_TIMEOUT,
                "log",
            )
            .await?;
        parse_commit_line(out.trim(), &config.branch, &config.url)
    }

    /// Return up to `limit` most recent commits, most recent first.
    pub async fn commit_history(&self, limit: usize) -> Result<Vec<CommitInfo>> {
        let _guard = self.op_lock.lock().await;
        self.ensure_cloned()?;
        let config = self.config.read().clone();

        let out = self
            .run_git(
                &[
                    "log",
                    "-n",
                    &limit.to_string(),
                    &format!("--format={}", LOG_FORMAT),
                ],
                Some(&config.clone.local_path),
                None,
                LOCAL_GIT_TIMEOUT,
                "log",
            )
            .await?;

        out.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| parse_commit_line(line.trim(), &config.branch, &config.url))
            .collect()
    }

    /// Paths that differ between two revisions reachable in local history.
    pub async fn changed_files(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let _guard = self.op_lock.lock().await;
        self.ensure_cloned()?;
        let local = self.config.read().clone.local_path.clone();
        self.changed_files_inner(&local, from, to).await
    }

    async fn changed_files_inner(&self, local: &Path, from: &str, to: &str) -> Result<Vec<String>> {
        let out = self
            .run_git(
                &["diff", "--name-only", from, to],
                Some(local),
                None,
                LOCAL_GIT_TIMEOUT,
                "diff",
            )
            .await?;

        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// List policy files under the configured policy path: recognized
    /// extensions only, hidden path segments excluded. A missing policy path
    /// is a configuration error, not an empty set.
    pub async fn list_policy_files(&self) -> Result<Vec<PathBuf>> {
        let _guard = self.op_lock.lock().await;
        self.ensure_cloned()?;
        let config = self.config.read().clone();
        let root = config.clone.local_path.join(&config.policy_path);

        if !root.is_dir() {
            return Err(WardenError::Config(format!(
                "policy path {} does not exist in the working copy",
                config.policy_path.display()
            )));
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&root)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
        {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let recognized = entry
                .path()
                .extension()
                .and_then(OsStr::to_str)
                .map(|ext| POLICY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if recognized {
                files.push(entry.into_path());
            }
        }
        files.sort();

        debug!(count = files.len(), path = %root.display(), "Listed policy files");
        Ok(files)
    }

    /// Check out a different branch; subsequent pulls track it. The target
    /// must be resolvable locally (present after a full clone, or fetched).
    pub async fn switch_branch(&self, branch: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.ensure_cloned()?;
        if branch.trim().is_empty() {
            return Err(WardenError::Config("branch must not be empty".to_string()));
        }
        let local = self.config.read().clone.local_path.clone();

        let local_ref = format!("refs/heads/{}", branch);
        let remote_ref = format!("refs/remotes/origin/{}", branch);
        let resolvable = self.rev_parse_inner(&local, &local_ref).await.is_ok()
            || self.rev_parse_inner(&local, &remote_ref).await.is_ok();
        if !resolvable {
            return Err(WardenError::Git(format!(
                "branch {} is not resolvable locally; shallow clones only carry the cloned branch",
                branch
            )));
        }

        self.run_git(
            &["checkout", branch],
            Some(&local),
            None,
            LOCAL_GIT_TIMEOUT,
            "checkout",
        )
        .await?;

        self.config.write().branch = branch.to_string();
        let head = self.rev_parse_inner(&local, "HEAD").await?;
        self.metrics.write().last_known_revision = Some(head);

        info!(branch = %branch, "Switched branch");
        Ok(())
    }

    /// Forcibly move the working copy back to an already-known revision.
    ///
    /// An unreachable revision means recovery is impossible from local state
    /// alone and surfaces as [`WardenError::Rollback`].
    pub async fn rollback(&self, deadline: Duration, revision: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.ensure_cloned()?;
        let local = self.config.read().clone.local_path.clone();

        let probe = format!("{}^{{commit}}", revision);
        if self
            .run_git(
                &["cat-file", "-e", &probe],
                Some(&local),
                None,
                LOCAL_GIT_TIMEOUT,
                "cat-file",
            )
            .await
            .is_err()
        {
            return Err(WardenError::Rollback(format!(
                "revision {} is not present in local history",
                revision
            )));
        }

        warn!(revision = %revision, "Rolling back working copy");
        self.run_git(
            &["reset", "--hard", revision],
            Some(&local),
            None,
            deadline,
            "reset",
        )
        .await
        .map_err(|e| WardenError::Rollback(e.to_string()))?;

        self.metrics.write().last_known_revision = Some(revision.to_string());
        Ok(())
    }

    /// Snapshot of the repository counters.
    pub fn metrics(&self) -> RepositoryMetrics {
        self.metrics.read().clone()
    }

    /// Local working-copy directory.
    pub fn local_path(&self) -> PathBuf {
        self.config.read().clone.local_path.clone()
    }

    /// Absolute path of the policy directory inside the working copy.
    pub fn policy_path(&self) -> PathBuf {
        let config = self.config.read();
        config.clone.local_path.join(&config.policy_path)
    }

    /// Policy directory relative to the repository root, as it appears in
    /// changed-file listings.
    pub fn policy_rel_path(&self) -> PathBuf {
        self.config.read().policy_path.clone()
    }

    /// Branch currently tracked.
    pub fn branch(&self) -> String {
        self.config.read().branch.clone()
    }

    /// Polling configuration this repository was constructed with.
    pub fn poll_config(&self) -> PollConfig {
        self.config.read().poll.clone()
    }

    /// Whether a successful clone has happened.
    pub fn is_cloned(&self) -> bool {
        self.state.read().cloned
    }

    fn ensure_cloned(&self) -> Result<()> {
        if !self.state.read().cloned {
            return Err(WardenError::NotCloned);
        }
        Ok(())
    }

    async fn rev_parse_inner(&self, local: &Path, rev: &str) -> Result<String> {
        let out = self
            .run_git(
                &["rev-parse", "--verify", rev],
                Some(local),
                None,
                LOCAL_GIT_TIMEOUT,
                "rev-parse",
            )
            .await?;
        Ok(out.trim().to_string())
    }

    async fn run_git<I, S>(
        &self,
        args: I,
        cwd: Option<&Path>,
        credential: Option<&GitCredential>,
        deadline: Duration,
        op: &str,
    ) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new("git");
        cmd.args(args);
        cmd.kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        if let Some(credential) = credential {
            credential.apply(&mut cmd)?;
        }

        let output = tokio::time::timeout(deadline, cmd.output())
            .await
            .map_err(|_| {
                WardenError::Timeout(format!("git {} exceeded {:?}", op, deadline))
            })?
            .map_err(|e| WardenError::Git(format!("failed to execute git {}: {}", op, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WardenError::Git(format!(
                "git {} failed: {}",
                op,
                self.redact(stderr.trim())
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Strip the token from subprocess output before it reaches a log line.
    fn redact(&self, text: &str) -> String {
        match &self.auth {
            AuthStrategy::Token { token } => text.replace(token.as_str(), "***"),
            _ => text.to_string(),
        }
    }
}

fn parse_commit_line(line: &str, branch: &str, url: &str) -> Result<CommitInfo> {
    let fields: Vec<&str> = line.split(FIELD_SEP).collect();
    if fields.len() != 5 {
        return Err(WardenError::Git(format!(
            "unexpected git log output: {}",
            line
        )));
    }

    let timestamp = DateTime::parse_from_rfc3339(fields[3])
        .map_err(|e| WardenError::Git(format!("unparsable commit timestamp {}: {}", fields[3], e)))?
        .with_timezone(&Utc);

    Ok(CommitInfo {
        sha: fields[0].to_string(),
        author: fields[1].to_string(),
        email: fields[2].to_string(),
        timestamp,
        message: fields[4].to_string(),
        branch: branch.to_string(),
        repo_url: url.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, CloneConfig, PollConfig};

    fn uncloned_repo() -> GitRepository {
        let dir = tempfile::tempdir().unwrap();
        let config = RepositoryConfig {
            url: "https://example.com/org/policies.git".to_string(),
            branch: "main".to_string(),
            policy_path: PathBuf::from("policies"),
            auth: AuthConfig::default(),
            poll: PollConfig::default(),
            clone: CloneConfig {
                depth: 0,
                local_path: dir.path().join("clone"),
                clean_on_start: false,
            },
        };
        GitRepository::new(config).unwrap()
    }

    #[test]
    fn test_new_rejects_empty_url() {
        let config = RepositoryConfig {
            url: String::new(),
            branch: "main".to_string(),
            policy_path: PathBuf::from("policies"),
            auth: AuthConfig::default(),
            poll: PollConfig::default(),
            clone: CloneConfig::default(),
        };
        assert!(matches!(
            GitRepository::new(config),
            Err(WardenError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_reads_fail_before_clone() {
        let repo = uncloned_repo();

        assert!(matches!(
            repo.current_commit().await,
            Err(WardenError::NotCloned)
        ));
        assert!(matches!(
            repo.pull(Duration::from_secs(1)).await,
            Err(WardenError::NotCloned)
        ));
        assert!(matches!(
            repo.list_policy_files().await,
            Err(WardenError::NotCloned)
        ));
        assert!(matches!(
            repo.commit_history(5).await,
            Err(WardenError::NotCloned)
        ));

        // Precondition failures never reach the pull counters
        assert_eq!(repo.metrics().pulls_failed, 0);
        assert_eq!(repo.metrics().pulls_succeeded, 0);
    }

    #[test]
    fn test_parse_commit_line() {
        let line = format!(
            "abc123{sep}Policy Admin{sep}policy@example.com{sep}2026-08-07T10:00:00+00:00{sep}tighten limits",
            sep = FIELD_SEP
        );
        let info =
            parse_commit_line(&line, "main", "https://example.com/org/policies.git").unwrap();
        assert_eq!(info.sha, "abc123");
        assert_eq!(info.author, "Policy Admin");
        assert_eq!(info.email, "policy@example.com");
        assert_eq!(info.message, "tighten limits");
        assert_eq!(info.branch, "main");
    }

    #[test]
    fn test_parse_commit_line_rejects_garbage() {
        assert!(parse_commit_line("not-a-log-line", "main", "url").is_err());
    }
}
