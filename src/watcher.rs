//! Change watcher: background polling, debounce, reload with rollback

use crate::config::{is_policy_file, WatcherMetrics};
use crate::error::{Result, WardenError};
use crate::repository::GitRepository;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Reload callback supplied by the policy engine. Receives the absolute
/// path of the policy directory; its failure triggers automatic rollback.
pub type ReloadFn = Arc<dyn Fn(&Path) -> Result<()> + Send + Sync>;

/// Consecutive failed pulls before tick logging escalates to error level
const PULL_FAILURE_ALERT_THRESHOLD: u32 = 3;

/// Watches one repository for policy-relevant changes and drives the
/// reload-with-rollback cycle.
///
/// Lifecycle: `Stopped` until [`PolicyWatcher::start`], then a background
/// poll loop runs until [`PolicyWatcher::stop`]. A debounce timer coalesces
/// bursts of commits into a single reload against the final revision.
pub struct PolicyWatcher {
    repository: Arc<GitRepository>,
    reload: ReloadFn,
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<WatcherState>,
    metrics: RwLock<WatcherMetrics>,
}

#[derive(Default)]
struct WatcherState {
    running: bool,
    /// Most recent revision whose policy set was applied (or intentionally
    /// skipped as not policy-relevant)
    last_applied: Option<String>,
    /// Bumped on every (re)arm and on stop; a sleeping debounce task only
    /// fires if its generation is still current
    debounce_generation: u64,
    poll_task: Option<JoinHandle<()>>,
    shutdown: Option<Arc<Notify>>,
}

impl PolicyWatcher {
    /// Bind a watcher to one repository and one reload callback.
    pub fn new<F>(repository: Arc<GitRepository>, reload: F) -> Self
    where
        F: Fn(&Path) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            repository,
            reload: Arc::new(reload),
            shared: Arc::new(Shared {
                state: Mutex::new(WatcherState::default()),
                metrics: RwLock::new(WatcherMetrics::default()),
            }),
        }
    }

    /// Record the current revision as the baseline and launch the poll loop.
    /// Fails if already running or if no baseline commit can be read.
    pub async fn start(&self, deadline: Duration) -> Result<()> {
        if self.shared.state.lock().running {
            return Err(WardenError::Watcher(
                "watcher is already running".to_string(),
            ));
        }

        let head = tokio::time::timeout(deadline, self.repository.current_commit())
            .await
            .map_err(|_| WardenError::Timeout("watcher start".to_string()))??;

        let poll = self.repository.poll_config();
        let mut state = self.shared.state.lock();
        if state.running {
            return Err(WardenError::Watcher(
                "watcher is already running".to_string(),
            ));
        }
        state.running = true;
        state.last_applied = Some(head.sha.clone());
        if poll.enabled {
            let shutdown = Arc::new(Notify::new());
            state.shutdown = Some(shutdown.clone());
            state.poll_task = Some(self.spawn_poll_loop(poll.interval, shutdown));
        }
        drop(state);

        info!(commit = %head.sha, interval = ?poll.interval, "Policy watcher started");
        Ok(())
    }

    /// Signal the poll loop to exit and cancel any pending debounce timer.
    /// In-flight reload or rollback work is allowed to finish on its own
    /// task; this call does not block on it.
    pub fn stop(&self) -> Result<()> {
        let (task, shutdown) = {
            let mut state = self.shared.state.lock();
            if !state.running {
                return Err(WardenError::Watcher("watcher is not running".to_string()));
            }
            state.running = false;
            state.debounce_generation += 1;
            (state.poll_task.take(), state.shutdown.take())
        };

        if let Some(shutdown) = shutdown {
            shutdown.notify_one();
        }
        drop(task);

        info!("Policy watcher stopped");
        Ok(())
    }

    /// Execute one poll tick outside the regular cadence. Requires the
    /// watcher to be running; tick errors are returned to the caller.
    pub async fn force_check(&self, deadline: Duration) -> Result<()> {
        if !self.is_running() {
            return Err(WardenError::Watcher("watcher is not running".to_string()));
        }
        tokio::time::timeout(
            deadline,
            run_tick(&self.repository, &self.reload, &self.shared),
        )
        .await
        .map_err(|_| WardenError::Timeout("force check".to_string()))?
    }

    /// Last revision applied (or intentionally skipped).
    pub fn last_commit_sha(&self) -> Option<String> {
        self.shared.state.lock().last_applied.clone()
    }

    /// Snapshot of the watcher counters.
    pub fn metrics(&self) -> WatcherMetrics {
        self.shared.metrics.read().clone()
    }

    /// Whether the poll loop is active.
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    fn spawn_poll_loop(&self, interval: Duration, shutdown: Arc<Notify>) -> JoinHandle<()> {
        let repository = self.repository.clone();
        let reload = self.reload.clone();
        let shared = self.shared.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = ticker.tick() => {
                        if !shared.state.lock().running {
                            break;
                        }
                        // Transient errors are logged inside the tick and
                        // never stop the loop
                        let _ = run_tick(&repository, &reload, &shared).await;
                    }
                }
            }
            debug!("Poll loop exited");
        })
    }
}

/// One poll tick: pull, classify, and arm the debounce timer when a policy
/// file changed.
async fn run_tick(
    repository: &Arc<GitRepository>,
    reload: &ReloadFn,
    shared: &Arc<Shared>,
) -> Result<()> {
    shared.metrics.write().polls += 1;
    let poll = repository.poll_config();

    let pull = match repository.pull(poll.timeout).await {
        Ok(pull) => {
            shared.metrics.write().consecutive_pull_failures = 0;
            pull
        }
        Err(e) => {
            let failures = {
                let mut metrics = shared.metrics.write();
                metrics.consecutive_pull_failures += 1;
                metrics.consecutive_pull_failures
            };
            if failures >= PULL_FAILURE_ALERT_THRESHOLD {
                error!(error = %e, failures, "Pull keeps failing; remote may be unreachable");
            } else {
                warn!(error = %e, failures, "Pull failed; retrying on the next tick");
            }
            return Err(e);
        }
    };

    if !pull.had_changes {
        return Ok(());
    }

    let policy_rel = repository.policy_rel_path();
    let relevant = pull
        .changed_files
        .iter()
        .any(|f| is_policy_file(f, &policy_rel));

    if !relevant {
        // Advance the baseline so the same commit is not re-classified on
        // every subsequent tick
        shared.state.lock().last_applied = Some(pull.to_sha.clone());
        shared.metrics.write().skipped_polls += 1;
        debug!(commit = %pull.to_sha, "Change touches no policy file; skipping reload");
        return Ok(());
    }

    info!(
        from = %pull.from_sha,
        to = %pull.to_sha,
        files = pull.changed_files.len(),
        "Policy change detected"
    );
    arm_debounce(repository, reload, shared, pull.to_sha);
    Ok(())
}

/// (Re)arm the single pending debounce timer. Only the most recent target
/// revision survives: older sleeping timers see a newer generation and bow
/// out, so a burst of commits collapses to exactly one reload.
fn arm_debounce(
    repository: &Arc<GitRepository>,
    reload: &ReloadFn,
    shared: &Arc<Shared>,
    target: String,
) {
    let generation = {
        let mut state = shared.state.lock();
        state.debounce_generation += 1;
        state.debounce_generation
    };
    let window = repository.poll_config().debounce;
    debug!(commit = %target, window = ?window, "Debounce timer armed");

    let repository = repository.clone();
    let reload = reload.clone();
    let shared = shared.clone();
    tokio::spawn(async move {
        tokio::time::sleep(window).await;
        {
            let state = shared.state.lock();
            if state.debounce_generation != generation || !state.running {
                return;
            }
        }

        if let Err(e) = execute_reload(&repository, &reload, &shared, &target).await {
            if e.is_unrecoverable() {
                error!(error = %e, commit = %target, "Reload and rollback both failed; manual intervention required");
            } else {
                warn!(error = %e, commit = %target, "Policy change rejected; previous policy restored");
            }
        }
    });
}

/// Invoke the reload callback; on failure roll back to the last known-good
/// revision and re-invoke it against the restored policy set.
///
/// No internal lock is held while the callback runs, so the accessors stay
/// responsive during a slow reload.
async fn execute_reload(
    repository: &Arc<GitRepository>,
    reload: &ReloadFn,
    shared: &Arc<Shared>,
    target: &str,
) -> Result<()> {
    let known_good = shared.state.lock().last_applied.clone();
    let policy_path = repository.policy_path();
    let op_timeout = repository.poll_config().timeout;
    let start = Instant::now();

    let outcome = (reload)(&policy_path);
    {
        let mut metrics = shared.metrics.write();
        metrics.last_reload_at = Some(Utc::now());
        metrics.last_reload_duration = Some(start.elapsed());
        match outcome {
            Ok(()) => metrics.successful_reloads += 1,
            Err(_) => metrics.failed_reloads += 1,
        }
    }

    let validation_err = match outcome {
        Ok(()) => {
            shared.state.lock().last_applied = Some(target.to_string());
            info!(commit = %target, "Policy reloaded");
            return Ok(());
        }
        Err(e) => e,
    };

    let known_good = match known_good {
        Some(sha) => sha,
        None => {
            return Err(WardenError::Unrecoverable(format!(
                "validation failed with no known-good revision to restore: {}",
                validation_err
            )))
        }
    };

    warn!(error = %validation_err, rejected = %target, restoring = %known_good, "Reload failed; rolling back");

    match repository.rollback(op_timeout, &known_good).await {
        Ok(()) => match (reload)(&policy_path) {
            // The system is healthy again on the known-good set; the
            // attempted change is still reported as rejected
            Ok(()) => Err(validation_err),
            Err(second) => Err(WardenError::Unrecoverable(format!(
                "validation failed ({}); reload of restored revision {} also failed ({})",
                validation_err, known_good, second
            ))),
        },
        Err(rollback_err) => Err(WardenError::Unrecoverable(format!(
            "validation failed ({}); rollback to {} failed ({})",
            validation_err, known_good, rollback_err
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, CloneConfig, PollConfig, RepositoryConfig};
    use std::path::PathBuf;

    fn uncloned_watcher() -> PolicyWatcher {
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
        let repository = Arc::new(GitRepository::new(config).unwrap());
        PolicyWatcher::new(repository, |_| Ok(()))
    }

    #[tokio::test]
    async fn test_start_requires_baseline() {
        let watcher = uncloned_watcher();
        let err = watcher.start(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, WardenError::NotCloned));
        assert!(!watcher.is_running());
    }

    #[tokio::test]
    async fn test_stop_requires_running() {
        let watcher = uncloned_watcher();
        assert!(matches!(watcher.stop(), Err(WardenError::Watcher(_))));
    }

    #[tokio::test]
    async fn test_force_check_requires_running() {
        let watcher = uncloned_watcher();
        assert!(matches!(
            watcher.force_check(Duration::from_secs(1)).await,
            Err(WardenError::Watcher(_))
        ));
    }
}
