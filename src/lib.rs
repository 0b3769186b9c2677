//! Warden - Policy Synchronization Core
//!
//! The policy-synchronization core of the Warden LLM request gateway. It
//! keeps a local clone of an operator-maintained policy repository in sync
//! with its remote source of truth and safely reloads the running policy
//! engine whenever that source changes:
//!
//! - **Repository**: clone, incremental pull, commit introspection, file-set
//!   diffing, branch switching, rollback
//! - **Authentication**: pluggable token / key-pair / anonymous strategies
//! - **Watcher**: background polling, change classification, debounced
//!   reloads, automatic rollback when validation rejects a change
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use warden::{GitRepository, PolicyWatcher, RepositoryConfig};
//!
//! #[tokio::main]
//! async fn main() -> warden::Result<()> {
//!     let config = RepositoryConfig::from_file("warden.yaml".as_ref())?;
//!     let repository = Arc::new(GitRepository::new(config)?);
//!     repository.clone_repo(Duration::from_secs(60)).await?;
//!
//!     let watcher = PolicyWatcher::new(repository, |path| {
//!         // hand the policy directory to the policy engine
//!         println!("reload policies from {}", path.display());
//!         Ok(())
//!     });
//!     watcher.start(Duration::from_secs(10)).await?;
//!     tokio::signal::ctrl_c().await?;
//!     watcher.stop()
//! }
//! ```
//!
//! # Configuration
//!
//! ```yaml
//! url: https://git.example.com/org/policies.git
//! branch: main
//! policy_path: policies
//! auth:
//!   kind: token
//!   token: "<personal-access-token>"
//! poll:
//!   interval: 60s
//!   timeout: 30s
//! clone:
//!   local_path: /var/lib/warden/policies
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod repository;
pub mod watcher;

pub use config::{
    AuthConfig, AuthKind, CloneConfig, CommitInfo, PollConfig, PullResult, RepositoryConfig,
    RepositoryMetrics, WatcherMetrics,
};
pub use error::{Result, WardenError};
pub use repository::GitRepository;
pub use watcher::PolicyWatcher;

/// Warden version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Warden name
pub const NAME: &str = env!("CARGO_PKG_NAME");
