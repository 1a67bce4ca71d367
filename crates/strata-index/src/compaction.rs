use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strata_storage::delta::DeltaLexicalStore;
use strata_storage::freeze::{FreezeBuffer, FreezeEvent};
use strata_storage::lock::RepoLockStore;

use crate::error::IndexError;
use crate::ports::LexicalIndexPort;

/// Per-repo compaction phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionState {
    Normal,
    Frozen,
    FrozenRebuilding,
}

/// Consolidates the lexical delta into the base in three phases:
/// Freeze (delta writes redirect to the freeze buffer) → Rebuild (full base
/// reindex from the working set) → Promote (replay buffered writes into the
/// fresh delta, drop pre-freeze delta rows and tombstones, unfreeze).
///
/// A rebuild failure aborts without promoting: buffered writes replay into
/// the existing delta and the frozen flag lifts. At most one compaction runs
/// per repo; `compact` serializes on the repo-scoped lock.
pub struct CompactionManager {
    delta: Arc<DeltaLexicalStore>,
    freeze: Arc<FreezeBuffer>,
    base: Arc<dyn LexicalIndexPort>,
    locks: Arc<RepoLockStore>,
    trigger_file_count: usize,
    trigger_age: Duration,
    states: Mutex<HashMap<String, CompactionState>>,
}

impl CompactionManager {
    pub fn new(
        delta: Arc<DeltaLexicalStore>,
        freeze: Arc<FreezeBuffer>,
        base: Arc<dyn LexicalIndexPort>,
        locks: Arc<RepoLockStore>,
    ) -> Self {
        Self {
            delta,
            freeze,
            base,
            locks,
            trigger_file_count: 200,
            trigger_age: Duration::from_secs(24 * 3600),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_triggers(mut self, trigger_file_count: usize, trigger_age: Duration) -> Self {
        self.trigger_file_count = trigger_file_count;
        self.trigger_age = trigger_age;
        self
    }

    pub fn state(&self, repo_id: &str) -> CompactionState {
        self.states
            .lock()
            .expect("compaction states lock poisoned")
            .get(repo_id)
            .copied()
            .unwrap_or(CompactionState::Normal)
    }

    fn set_state(&self, repo_id: &str, state: CompactionState) {
        self.states
            .lock()
            .expect("compaction states lock poisoned")
            .insert(repo_id.to_string(), state);
    }

    /// True when the delta row count or delta age crosses its trigger.
    pub fn should_compact(&self, repo_id: &str) -> Result<bool, IndexError> {
        let delta_count = self.delta.count(repo_id)?;
        let age = self.delta.age_secs(repo_id)?;

        let by_count = delta_count >= self.trigger_file_count;
        let by_age = age.is_some_and(|a| a >= self.trigger_age.as_secs());

        if by_count || by_age {
            tracing::info!(
                repo_id,
                delta_count,
                age_secs = age,
                by_count,
                by_age,
                "compaction triggered"
            );
        }
        Ok(by_count || by_age)
    }

    /// Run one compaction cycle. Returns `Ok(true)` when the base was
    /// rebuilt and the delta promoted, `Ok(false)` when the rebuild failed
    /// and the cycle aborted cleanly.
    #[tracing::instrument(skip(self))]
    pub fn compact(&self, repo_id: &str, snapshot_id: &str) -> Result<bool, IndexError> {
        let lock_key = format!("compaction:{repo_id}");
        let token = self
            .locks
            .try_acquire(&lock_key)?
            .ok_or_else(|| IndexError::CompactionInProgress {
                repo_id: repo_id.to_string(),
            })?;

        let result = self.compact_locked(repo_id, snapshot_id);

        if let Err(e) = self.locks.release(&lock_key, &token) {
            tracing::warn!(repo_id, error = %e, "compaction lock release failed");
        }
        result
    }

    fn compact_locked(&self, repo_id: &str, snapshot_id: &str) -> Result<bool, IndexError> {
        // Phase 1: freeze. New delta writes go to the buffer from here on.
        tracing::info!(repo_id, "compaction phase 1: freeze");
        self.freeze.set_frozen(repo_id, true)?;
        self.set_state(repo_id, CompactionState::Frozen);

        // Phase 2: rebuild the base from the current working set.
        tracing::info!(repo_id, "compaction phase 2: rebuild");
        self.set_state(repo_id, CompactionState::FrozenRebuilding);
        let rebuild = self.base.reindex_repo(repo_id, snapshot_id);

        match rebuild {
            Ok(()) => {
                // Phase 3: promote. The pre-freeze delta is now part of the
                // base; buffered writes replay into the fresh delta.
                tracing::info!(repo_id, "compaction phase 3: promote");
                self.delta.clear(repo_id)?;
                self.delta.tombstones().clear(repo_id)?;
                let events = self.freeze.replay(repo_id)?;
                let replayed = events.len();
                self.replay_into_delta(repo_id, events)?;
                self.freeze.clear(repo_id)?;
                self.freeze.set_frozen(repo_id, false)?;
                self.set_state(repo_id, CompactionState::Normal);
                tracing::info!(repo_id, replayed, "compaction promoted");
                Ok(true)
            }
            Err(e) => {
                // Abort: keep the existing delta, fold the buffered writes
                // back into it, lift the freeze. Next trigger retries.
                tracing::error!(repo_id, error = %e, "compaction rebuild failed, aborting");
                let events = self.freeze.replay(repo_id)?;
                self.replay_into_delta(repo_id, events)?;
                self.freeze.clear(repo_id)?;
                self.freeze.set_frozen(repo_id, false)?;
                self.set_state(repo_id, CompactionState::Normal);
                Ok(false)
            }
        }
    }

    fn replay_into_delta(
        &self,
        repo_id: &str,
        events: Vec<FreezeEvent>,
    ) -> Result<(), IndexError> {
        for event in events {
            match event {
                FreezeEvent::Index { file_path, content } => {
                    self.delta.index_file(repo_id, &file_path, &content, None)?;
                }
                FreezeEvent::Delete { file_path } => {
                    self.delta.delete_file(repo_id, &file_path, None)?;
                }
            }
        }
        Ok(())
    }
}
