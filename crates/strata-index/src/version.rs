use std::sync::Arc;

use strata_storage::version::{IndexVersion, IndexVersionStore};

use crate::error::IndexError;

/// Parameters for deciding whether an index version is usable.
#[derive(Debug, Clone)]
pub struct StalenessPolicy {
    pub max_age_minutes: u64,
    pub allow_commit_mismatch: bool,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self {
            max_age_minutes: 60,
            allow_commit_mismatch: false,
        }
    }
}

fn short_commit(commit: &str) -> &str {
    &commit[..commit.len().min(8)]
}

/// Checks index version consistency and staleness ahead of queries.
pub struct IndexVersionChecker {
    store: Arc<IndexVersionStore>,
    policy: StalenessPolicy,
}

impl IndexVersionChecker {
    pub fn new(store: Arc<IndexVersionStore>, policy: StalenessPolicy) -> Self {
        Self { store, policy }
    }

    /// Resolve and validate a version. Returns `(is_valid, reason, version)`.
    ///
    /// A requested version must exist and be completed; otherwise the latest
    /// completed version is used. Staleness is commit mismatch (unless
    /// allowed) or age beyond the policy maximum.
    pub fn check_version(
        &self,
        repo_id: &str,
        current_commit: &str,
        requested_version_id: Option<i64>,
    ) -> Result<(bool, String, Option<IndexVersion>), IndexError> {
        let version = match requested_version_id {
            Some(version_id) => {
                let Some(version) = self.store.get_version(repo_id, version_id)? else {
                    return Ok((false, format!("Version {version_id} not found"), None));
                };
                if !version.is_completed() {
                    return Ok((
                        false,
                        format!("Version {version_id} not completed"),
                        Some(version),
                    ));
                }
                version
            }
            None => match self.store.get_latest_version(repo_id)? {
                Some(version) => version,
                None => {
                    return Ok((false, "No completed index version found".to_string(), None));
                }
            },
        };

        let (is_valid, reason) = self.evaluate_staleness(&version, current_commit);
        Ok((is_valid, reason, Some(version)))
    }

    /// Staleness verdict for one version against the current commit.
    pub fn evaluate_staleness(
        &self,
        version: &IndexVersion,
        current_commit: &str,
    ) -> (bool, String) {
        if version.git_commit != current_commit {
            if !self.policy.allow_commit_mismatch {
                return (
                    false,
                    format!(
                        "Commit mismatch: index={}, current={}",
                        short_commit(&version.git_commit),
                        short_commit(current_commit)
                    ),
                );
            }
            tracing::warn!(
                repo_id = %version.repo_id,
                index_commit = short_commit(&version.git_commit),
                current_commit = short_commit(current_commit),
                "index commit mismatch allowed by policy"
            );
        }

        let age_minutes = version.age_secs() as f64 / 60.0;
        if age_minutes > self.policy.max_age_minutes as f64 {
            return (
                false,
                format!(
                    "Index too old: {:.1}min (max {}min)",
                    age_minutes, self.policy.max_age_minutes
                ),
            );
        }

        (true, "OK".to_string())
    }

    /// Whether a fresh index build is needed.
    pub fn require_reindex(&self, repo_id: &str, current_commit: &str) -> Result<bool, IndexError> {
        let (is_valid, reason, _) = self.check_version(repo_id, current_commit, None)?;
        if !is_valid {
            tracing::info!(repo_id, reason, "reindex required");
        }
        Ok(!is_valid)
    }
}

/// Outcome of the pre-request version check.
#[derive(Debug, Clone)]
pub struct VersionCheckResult {
    pub is_valid: bool,
    pub version_id: Option<i64>,
    pub staleness_seconds: f64,
    pub reason: String,
    pub auto_reindex_triggered: bool,
}

/// Callback that kicks off a rebuild for (repo_id, current_commit); returns
/// whether one was actually started.
pub type ReindexTrigger = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Staleness gate ahead of agent/IDE requests: records metrics, optionally
/// alerts, and optionally triggers an automatic rebuild.
pub struct VersionCheckMiddleware {
    checker: IndexVersionChecker,
    auto_reindex: bool,
    alert_on_stale: bool,
    reindex_trigger: Option<ReindexTrigger>,
}

impl VersionCheckMiddleware {
    pub fn new(checker: IndexVersionChecker, auto_reindex: bool, alert_on_stale: bool) -> Self {
        Self {
            checker,
            auto_reindex,
            alert_on_stale,
            reindex_trigger: None,
        }
    }

    pub fn with_reindex_trigger(mut self, trigger: ReindexTrigger) -> Self {
        self.reindex_trigger = Some(trigger);
        self
    }

    pub fn check_before_request(
        &self,
        repo_id: &str,
        current_commit: &str,
    ) -> Result<VersionCheckResult, IndexError> {
        let (is_valid, reason, version) =
            self.checker.check_version(repo_id, current_commit, None)?;

        let Some(version) = version else {
            tracing::info!(
                monotonic_counter.index_version_check_total = 1u64,
                status = "no_version",
                repo_id
            );
            return Ok(VersionCheckResult {
                is_valid: false,
                version_id: None,
                staleness_seconds: f64::INFINITY,
                reason,
                auto_reindex_triggered: false,
            });
        };

        let staleness_seconds = version.age_secs() as f64;
        tracing::info!(histogram.index_staleness_seconds = staleness_seconds, repo_id);

        if !is_valid {
            tracing::info!(
                monotonic_counter.index_version_check_total = 1u64,
                status = "stale",
                repo_id
            );
            tracing::warn!(
                repo_id,
                version_id = version.version_id,
                staleness_seconds,
                reason,
                "stale index detected"
            );
            if self.alert_on_stale {
                self.send_alert(repo_id, version.version_id, staleness_seconds, &reason);
            }
            let auto_reindex_triggered = if self.auto_reindex {
                self.trigger_reindex(repo_id, current_commit)
            } else {
                false
            };
            return Ok(VersionCheckResult {
                is_valid: false,
                version_id: Some(version.version_id),
                staleness_seconds,
                reason,
                auto_reindex_triggered,
            });
        }

        tracing::info!(
            monotonic_counter.index_version_check_total = 1u64,
            status = "valid",
            repo_id
        );
        Ok(VersionCheckResult {
            is_valid: true,
            version_id: Some(version.version_id),
            staleness_seconds,
            reason: "OK".to_string(),
            auto_reindex_triggered: false,
        })
    }

    fn send_alert(&self, repo_id: &str, version_id: i64, staleness_seconds: f64, reason: &str) {
        tracing::warn!(
            repo_id,
            version_id,
            staleness_minutes = staleness_seconds / 60.0,
            reason,
            "stale index alert"
        );
    }

    fn trigger_reindex(&self, repo_id: &str, current_commit: &str) -> bool {
        let triggered = match &self.reindex_trigger {
            Some(trigger) => trigger(repo_id, current_commit),
            None => false,
        };
        if triggered {
            tracing::info!(
                repo_id,
                commit = short_commit(current_commit),
                "auto reindex triggered"
            );
        }
        triggered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strata_storage::version::IndexVersionStatus;

    fn checker(store: Arc<IndexVersionStore>, policy: StalenessPolicy) -> IndexVersionChecker {
        IndexVersionChecker::new(store, policy)
    }

    fn old_version(repo: &str, commit: &str, age_secs: i64) -> IndexVersion {
        IndexVersion {
            repo_id: repo.to_string(),
            version_id: 1,
            git_commit: commit.to_string(),
            indexed_at: (std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_secs() as i64)
                - age_secs,
            file_count: 10,
            status: IndexVersionStatus::Completed,
            duration_ms: 100.0,
            error_message: None,
            metadata: None,
        }
    }

    #[test]
    fn fresh_matching_version_is_valid() {
        let store = Arc::new(IndexVersionStore::open_in_memory().unwrap());
        let v = store.create_version("r1", "commit-a", 5).unwrap();
        store.complete_version("r1", v.version_id, 10.0, None).unwrap();

        let c = checker(store, StalenessPolicy::default());
        let (is_valid, reason, version) = c.check_version("r1", "commit-a", None).unwrap();
        assert!(is_valid);
        assert_eq!(reason, "OK");
        assert_eq!(version.unwrap().version_id, v.version_id);
    }

    #[test]
    fn no_version_is_invalid() {
        let store = Arc::new(IndexVersionStore::open_in_memory().unwrap());
        let c = checker(store, StalenessPolicy::default());
        let (is_valid, reason, version) = c.check_version("r1", "commit-a", None).unwrap();
        assert!(!is_valid);
        assert_eq!(reason, "No completed index version found");
        assert!(version.is_none());
    }

    #[test]
    fn commit_mismatch_is_invalid_by_default() {
        let store = Arc::new(IndexVersionStore::open_in_memory().unwrap());
        let v = store.create_version("r1", "commit-aaaaaaaa", 5).unwrap();
        store.complete_version("r1", v.version_id, 10.0, None).unwrap();

        let c = checker(store.clone(), StalenessPolicy::default());
        let (is_valid, reason, _) = c.check_version("r1", "commit-bbbbbbbb", None).unwrap();
        assert!(!is_valid);
        assert!(reason.starts_with("Commit mismatch"));

        let lenient = checker(
            store,
            StalenessPolicy {
                allow_commit_mismatch: true,
                ..Default::default()
            },
        );
        let (is_valid, _, _) = lenient.check_version("r1", "commit-bbbbbbbb", None).unwrap();
        assert!(is_valid);
    }

    #[test]
    fn two_hour_old_index_is_stale() {
        // Latest completed version: commit A, indexed 2h ago; current commit
        // A; max age 60min.
        let c = checker(
            Arc::new(IndexVersionStore::open_in_memory().unwrap()),
            StalenessPolicy::default(),
        );
        let version = old_version("r1", "commit-a", 2 * 3600);
        let (is_valid, reason) = c.evaluate_staleness(&version, "commit-a");
        assert!(!is_valid);
        assert!(reason.starts_with("Index too old:"), "reason = {reason}");
        assert!(reason.contains("120.0min"));
    }

    #[test]
    fn requested_version_must_exist_and_be_completed() {
        let store = Arc::new(IndexVersionStore::open_in_memory().unwrap());
        let v = store.create_version("r1", "commit-a", 5).unwrap(); // still indexing

        let c = checker(store, StalenessPolicy::default());
        let (is_valid, reason, _) = c.check_version("r1", "commit-a", Some(999)).unwrap();
        assert!(!is_valid);
        assert_eq!(reason, "Version 999 not found");

        let (is_valid, reason, _) = c.check_version("r1", "commit-a", Some(v.version_id)).unwrap();
        assert!(!is_valid);
        assert!(reason.ends_with("not completed"));
    }

    #[test]
    fn middleware_triggers_auto_reindex_when_configured() {
        let store = Arc::new(IndexVersionStore::open_in_memory().unwrap());
        let v = store.create_version("r1", "commit-old", 5).unwrap();
        store.complete_version("r1", v.version_id, 10.0, None).unwrap();

        let triggered = Arc::new(AtomicUsize::new(0));
        let counter = triggered.clone();
        let middleware = VersionCheckMiddleware::new(
            checker(store, StalenessPolicy::default()),
            true,
            true,
        )
        .with_reindex_trigger(Arc::new(move |_repo, _commit| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        }));

        let result = middleware.check_before_request("r1", "commit-new").unwrap();
        assert!(!result.is_valid);
        assert!(result.auto_reindex_triggered);
        assert_eq!(triggered.load(Ordering::SeqCst), 1);
        assert!(result.reason.starts_with("Commit mismatch"));
        assert_eq!(result.version_id, Some(v.version_id));
    }

    #[test]
    fn middleware_valid_path() {
        let store = Arc::new(IndexVersionStore::open_in_memory().unwrap());
        let v = store.create_version("r1", "commit-a", 5).unwrap();
        store.complete_version("r1", v.version_id, 10.0, None).unwrap();

        let middleware =
            VersionCheckMiddleware::new(checker(store, StalenessPolicy::default()), false, false);
        let result = middleware.check_before_request("r1", "commit-a").unwrap();
        assert!(result.is_valid);
        assert_eq!(result.reason, "OK");
        assert!(!result.auto_reindex_triggered);
        assert!(result.staleness_seconds < 60.0);
    }

    #[test]
    fn middleware_no_version_path() {
        let store = Arc::new(IndexVersionStore::open_in_memory().unwrap());
        let middleware =
            VersionCheckMiddleware::new(checker(store, StalenessPolicy::default()), false, false);
        let result = middleware.check_before_request("r1", "commit-a").unwrap();
        assert!(!result.is_valid);
        assert!(result.version_id.is_none());
        assert!(result.staleness_seconds.is_infinite());
    }
}
