//! In-process [`StateStore`] backed by a `HashMap` and two ordered indexes.
//!
//! All mutations take the single write lock, which makes each operation an
//! atomic conditional write. When a state file is configured the full table is
//! written through (temp file + rename) before the write lock is dropped, so a
//! successful return means the change is on disk.

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    Cursor, FailureRecord, LockOutcome, NewWorkset, Page, Priority, QueueStats, RefreshOutcome,
    ReleaseOutcome, StateStore, Workset, WorksetState,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{RetryConfig, StoreConfig};
use crate::error::{Result, UrsaError};
use crate::retry::Backoff;

const STORE_ACTOR: &str = "store";

type PriorityKey = (WorksetState, Priority, DateTime<Utc>, String);
type CreatedKey = (WorksetState, DateTime<Utc>, String);

#[derive(Debug, Default)]
struct Tables {
    worksets: HashMap<String, Workset>,
    by_priority: BTreeSet<PriorityKey>,
    by_created: BTreeSet<CreatedKey>,
}

impl Tables {
    fn index(&mut self, ws: &Workset) {
        self.by_priority.insert((
            ws.state,
            ws.priority,
            ws.created_at,
            ws.workset_id.clone(),
        ));
        self.by_created
            .insert((ws.state, ws.created_at, ws.workset_id.clone()));
    }

    fn unindex(&mut self, ws: &Workset) {
        self.by_priority.remove(&(
            ws.state,
            ws.priority,
            ws.created_at,
            ws.workset_id.clone(),
        ));
        self.by_created
            .remove(&(ws.state, ws.created_at, ws.workset_id.clone()));
    }

    fn insert(&mut self, ws: Workset) {
        self.index(&ws);
        self.worksets.insert(ws.workset_id.clone(), ws);
    }

    /// Applies `f` to one workset, keeping both indexes in step with any
    /// state change. `f` decides whether anything was written.
    fn update<T>(&mut self, workset_id: &str, f: impl FnOnce(&mut Workset) -> T) -> Option<T> {
        let mut ws = self.worksets.remove(workset_id)?;
        self.unindex(&ws);
        let out = f(&mut ws);
        self.insert(ws);
        Some(out)
    }

    fn scan_ids(
        &self,
        state: WorksetState,
        priority: Option<Priority>,
        after: Option<&Cursor>,
        limit: usize,
    ) -> Vec<String> {
        match priority {
            Some(p) => {
                let lower = match after {
                    Some(c) => Bound::Excluded((state, p, c.created_at, c.workset_id.clone())),
                    None => Bound::Included((state, p, DateTime::<Utc>::MIN_UTC, String::new())),
                };
                self.by_priority
                    .range((lower, Bound::Unbounded))
                    .take_while(|(s, pr, _, _)| *s == state && *pr == p)
                    .take(limit)
                    .map(|(_, _, _, id)| id.clone())
                    .collect()
            }
            None => {
                let lower = match after {
                    Some(c) => Bound::Excluded((state, c.created_at, c.workset_id.clone())),
                    None => Bound::Included((state, DateTime::<Utc>::MIN_UTC, String::new())),
                };
                self.by_created
                    .range((lower, Bound::Unbounded))
                    .take_while(|(s, _, _)| *s == state)
                    .take(limit)
                    .map(|(_, _, id)| id.clone())
                    .collect()
            }
        }
    }

    fn in_state(&self, state: WorksetState) -> impl Iterator<Item = &Workset> {
        self.by_created
            .range((
                Bound::Included((state, DateTime::<Utc>::MIN_UTC, String::new())),
                Bound::Unbounded,
            ))
            .take_while(move |(s, _, _)| *s == state)
            .filter_map(move |(_, _, id)| self.worksets.get(id))
    }
}

pub struct InMemoryStateStore {
    tables: RwLock<Tables>,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
    default_max_retries: u32,
    backoff: Backoff,
}

impl std::fmt::Debug for InMemoryStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStateStore")
            .field("config", &self.config)
            .field("default_max_retries", &self.default_max_retries)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new(StoreConfig::default(), &RetryConfig::default())
    }
}

impl InMemoryStateStore {
    pub fn new(config: StoreConfig, retry: &RetryConfig) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            clock: Arc::new(SystemClock),
            config,
            default_max_retries: retry.default_max_retries,
            backoff: Backoff::from_config(retry),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Builds a store and loads the configured state file, if it exists.
    pub async fn open(config: StoreConfig, retry: &RetryConfig) -> Result<Self> {
        let store = Self::new(config, retry);
        if let Some(path) = store.config.state_file.clone() {
            store.load(&path).await?;
        }
        Ok(store)
    }

    async fn load(&self, path: &Path) -> Result<()> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No state file yet, starting empty");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let worksets: Vec<Workset> = serde_json::from_slice(&bytes)?;
        let mut tables = self.tables.write().await;
        for ws in worksets {
            tables.insert(ws);
        }
        tracing::info!(
            path = %path.display(),
            worksets = tables.worksets.len(),
            "Loaded workset state"
        );
        Ok(())
    }

    async fn persist(&self, tables: &Tables) -> Result<()> {
        let Some(path) = self.config.state_file.as_ref() else {
            return Ok(());
        };
        let mut all: Vec<&Workset> = tables.worksets.values().collect();
        all.sort_by(|a, b| a.workset_id.cmp(&b.workset_id));
        let bytes = serde_json::to_vec(&all)?;

        let tmp = tmp_path(path);
        let persistence = |e: std::io::Error, at: &Path| {
            UrsaError::Persistence(format!("{}: {e}", at.display()))
        };
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| persistence(e, tmp.as_path()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| persistence(e, path.as_path()))
    }

    fn initial_state(&self) -> WorksetState {
        if self.config.register_as_ready {
            WorksetState::Ready
        } else {
            WorksetState::Registered
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn ensure_owner(ws: &Workset, actor: &str) -> Result<()> {
    if ws.lock_owner.as_deref() == Some(actor) {
        return Ok(());
    }
    Err(UrsaError::NotOwner {
        workset_id: ws.workset_id.clone(),
        owner: ws.lock_owner.clone(),
        actor: actor.to_string(),
    })
}

pub(crate) fn ttl_expiry(now: DateTime<Utc>, ttl_seconds: u64) -> DateTime<Utc> {
    let ttl = chrono::Duration::try_seconds(ttl_seconds.min(i64::MAX as u64) as i64)
        .unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn register(&self, new: NewWorkset) -> Result<Workset> {
        if new.workset_id.trim().is_empty() {
            return Err(UrsaError::InvalidArgument("workset_id is empty".into()));
        }
        let mut tables = self.tables.write().await;
        if tables.worksets.contains_key(&new.workset_id) {
            return Err(UrsaError::AlreadyExists(new.workset_id));
        }

        let ws = Workset::from_registration(
            new,
            self.initial_state(),
            self.default_max_retries,
            self.clock.now(),
        );
        tables.insert(ws.clone());
        self.persist(&tables).await?;

        tracing::info!(
            workset_id = %ws.workset_id,
            state = %ws.state,
            priority = %ws.priority,
            "Workset registered"
        );
        Ok(ws)
    }

    async fn get(&self, workset_id: &str) -> Result<Workset> {
        self.tables
            .read()
            .await
            .worksets
            .get(workset_id)
            .cloned()
            .ok_or_else(|| UrsaError::WorksetNotFound(workset_id.to_string()))
    }

    async fn list_by_state(
        &self,
        state: WorksetState,
        priority: Option<Priority>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page> {
        if limit == 0 {
            return Ok(Page::default());
        }
        let after = cursor.map(str::parse::<Cursor>).transpose()?;
        let tables = self.tables.read().await;

        // One extra item tells us whether another page exists.
        let ids = tables.scan_ids(state, priority, after.as_ref(), limit + 1);
        let has_more = ids.len() > limit;
        let items: Vec<Workset> = ids
            .iter()
            .take(limit)
            .filter_map(|id| tables.worksets.get(id).cloned())
            .collect();
        let next_cursor = if has_more {
            items.last().map(|ws| Cursor::after(ws).to_string())
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    async fn list_by_customer(&self, customer_id: &str) -> Result<Vec<Workset>> {
        let tables = self.tables.read().await;
        let mut found: Vec<Workset> = tables
            .worksets
            .values()
            .filter(|ws| ws.customer_id.as_deref() == Some(customer_id))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.workset_id.cmp(&b.workset_id))
        });
        Ok(found)
    }

    async fn acquire_lock(
        &self,
        workset_id: &str,
        owner_id: &str,
        ttl_seconds: u64,
    ) -> Result<LockOutcome> {
        let mut tables = self.tables.write().await;
        let now = self.clock.now();

        let outcome = tables.update(workset_id, |ws| {
            if !matches!(ws.state, WorksetState::Ready) && !ws.state.is_lockable() {
                return (LockOutcome::NotLockable { state: ws.state }, false);
            }
            if ws.has_live_lock(now) {
                let expires_at = ws.lock_expires_at().unwrap_or(now);
                let owner = ws.lock_owner.clone().unwrap_or_default();
                if owner == owner_id {
                    return (LockOutcome::Acquired { expires_at }, false);
                }
                return (LockOutcome::AlreadyLocked { owner, expires_at }, false);
            }
            if let Some(previous) = ws.lock_owner.as_deref() {
                tracing::info!(
                    workset_id = %ws.workset_id,
                    previous_owner = previous,
                    owner = owner_id,
                    "Reclaiming stale lock"
                );
            }
            ws.lock_owner = Some(owner_id.to_string());
            ws.lock_acquired_at = Some(now);
            ws.lock_ttl_seconds = Some(ttl_seconds);
            ws.updated_at = now;
            (
                LockOutcome::Acquired {
                    expires_at: ttl_expiry(now, ttl_seconds),
                },
                true,
            )
        });

        match outcome {
            None => Ok(LockOutcome::NotFound),
            Some((outcome, written)) => {
                if written {
                    self.persist(&tables).await?;
                }
                Ok(outcome)
            }
        }
    }

    async fn refresh_lock(&self, workset_id: &str, owner_id: &str) -> Result<RefreshOutcome> {
        let mut tables = self.tables.write().await;
        let now = self.clock.now();

        let outcome = tables.update(workset_id, |ws| match ws.lock_owner.as_deref() {
            None => RefreshOutcome::NotLocked,
            Some(owner) if owner != owner_id => RefreshOutcome::NotOwner {
                owner: owner.to_string(),
            },
            Some(_) => {
                ws.lock_acquired_at = Some(now);
                ws.updated_at = now;
                RefreshOutcome::Refreshed {
                    expires_at: ttl_expiry(now, ws.lock_ttl_seconds.unwrap_or(0)),
                }
            }
        });

        match outcome {
            None => Ok(RefreshOutcome::NotFound),
            Some(outcome) => {
                if matches!(outcome, RefreshOutcome::Refreshed { .. }) {
                    self.persist(&tables).await?;
                }
                Ok(outcome)
            }
        }
    }

    async fn release_lock(&self, workset_id: &str, owner_id: &str) -> Result<ReleaseOutcome> {
        let mut tables = self.tables.write().await;
        let now = self.clock.now();

        let outcome = tables.update(workset_id, |ws| match ws.lock_owner.as_deref() {
            None => ReleaseOutcome::NotLocked,
            Some(owner) if owner != owner_id => ReleaseOutcome::NotOwner {
                owner: owner.to_string(),
            },
            Some(_) => {
                ws.clear_lock();
                ws.updated_at = now;
                ReleaseOutcome::Released
            }
        });

        match outcome {
            None => Ok(ReleaseOutcome::NotFound),
            Some(outcome) => {
                if outcome == ReleaseOutcome::Released {
                    self.persist(&tables).await?;
                }
                Ok(outcome)
            }
        }
    }

    async fn update_state(
        &self,
        workset_id: &str,
        new_state: WorksetState,
        reason: &str,
        actor: &str,
        expected_current_state: Option<WorksetState>,
    ) -> Result<Workset> {
        let mut tables = self.tables.write().await;
        let now = self.clock.now();

        let updated = tables
            .update(workset_id, |ws| {
                if let Some(expected) = expected_current_state {
                    if ws.state != expected {
                        return Err(UrsaError::Conflict {
                            workset_id: ws.workset_id.clone(),
                            expected,
                            actual: ws.state,
                        });
                    }
                    // Leaving a held state is reserved for the lock holder.
                    if expected.is_lockable() {
                        ensure_owner(ws, actor)?;
                    }
                }
                let from = ws.state;
                ws.transition(new_state, reason, actor, now);
                if new_state == WorksetState::Ready {
                    ws.retry_after = None;
                }
                tracing::debug!(
                    workset_id = %ws.workset_id,
                    from = %from,
                    to = %new_state,
                    actor,
                    reason,
                    "State updated"
                );
                Ok(ws.clone())
            })
            .ok_or_else(|| UrsaError::WorksetNotFound(workset_id.to_string()))??;

        self.persist(&tables).await?;
        Ok(updated)
    }

    async fn record_failure(
        &self,
        workset_id: &str,
        failure: &FailureRecord,
        actor: &str,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let now = self.clock.now();
        let backoff = self.backoff;

        let should_retry = tables
            .update(workset_id, |ws| {
                if ws.state != WorksetState::InProgress {
                    return Err(UrsaError::Conflict {
                        workset_id: ws.workset_id.clone(),
                        expected: WorksetState::InProgress,
                        actual: ws.state,
                    });
                }
                ensure_owner(ws, actor)?;

                ws.error_category = Some(failure.error_category);
                ws.error_details = Some(failure.error_details.clone());
                ws.failed_step = failure.failed_step.clone();

                let retry = failure.error_category.is_retryable() && ws.retry_count < ws.max_retries;
                if retry {
                    let delay = backoff.delay(ws.retry_count);
                    ws.retry_count += 1;
                    ws.retry_after = Some(
                        chrono::Duration::from_std(delay)
                            .ok()
                            .and_then(|d| now.checked_add_signed(d))
                            .unwrap_or(DateTime::<Utc>::MAX_UTC),
                    );
                    let reason = format!(
                        "{} failure, retry {}/{} in {}s",
                        failure.error_category,
                        ws.retry_count,
                        ws.max_retries,
                        delay.as_secs()
                    );
                    ws.transition(WorksetState::Retrying, reason, actor, now);
                } else {
                    ws.retry_after = None;
                    let reason = if failure.error_category.is_retryable() {
                        format!(
                            "{} failure, retries exhausted ({}/{})",
                            failure.error_category, ws.retry_count, ws.max_retries
                        )
                    } else {
                        format!("{} failure", failure.error_category)
                    };
                    ws.transition(WorksetState::Failed, reason, actor, now);
                }
                Ok(retry)
            })
            .ok_or_else(|| UrsaError::WorksetNotFound(workset_id.to_string()))??;

        self.persist(&tables).await?;
        Ok(should_retry)
    }

    async fn get_retryable(&self, now: DateTime<Utc>) -> Result<Vec<Workset>> {
        let tables = self.tables.read().await;
        Ok(tables
            .in_state(WorksetState::Retrying)
            .filter(|ws| ws.retry_after.map_or(true, |at| at <= now))
            .cloned()
            .collect())
    }

    async fn reset_for_retry(&self, workset_id: &str) -> Result<Workset> {
        let mut tables = self.tables.write().await;
        let now = self.clock.now();

        let updated = tables
            .update(workset_id, |ws| {
                if ws.state != WorksetState::Retrying {
                    return Err(UrsaError::Conflict {
                        workset_id: ws.workset_id.clone(),
                        expected: WorksetState::Retrying,
                        actual: ws.state,
                    });
                }
                ws.transition(WorksetState::Ready, "retry delay elapsed", STORE_ACTOR, now);
                ws.clear_lock();
                ws.retry_after = None;
                Ok(ws.clone())
            })
            .ok_or_else(|| UrsaError::WorksetNotFound(workset_id.to_string()))??;

        self.persist(&tables).await?;
        Ok(updated)
    }

    async fn get_stale_locked(&self, now: DateTime<Utc>) -> Result<Vec<Workset>> {
        let tables = self.tables.read().await;
        Ok([WorksetState::Locked, WorksetState::InProgress]
            .into_iter()
            .flat_map(|state| tables.in_state(state))
            .filter(|ws| ws.has_stale_lock(now))
            .cloned()
            .collect())
    }

    async fn count_by_state(&self) -> Result<QueueStats> {
        let tables = self.tables.read().await;
        let mut stats = QueueStats::default();
        for ws in tables.worksets.values() {
            *stats.by_state.entry(ws.state).or_insert(0) += 1;
        }
        stats.total = tables.worksets.len();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;

    fn store() -> InMemoryStateStore {
        InMemoryStateStore::new(
            StoreConfig {
                register_as_ready: true,
                state_file: None,
            },
            &RetryConfig::default(),
        )
    }

    #[tokio::test]
    async fn indexes_follow_state_changes() {
        let store = store();
        store
            .register(NewWorkset::new("ws-1", "s3://b/1", Priority::Normal))
            .await
            .unwrap();
        store
            .update_state("ws-1", WorksetState::Ignored, "skip", "admin", None)
            .await
            .unwrap();

        let tables = store.tables.read().await;
        assert_eq!(tables.by_priority.len(), 1);
        assert_eq!(tables.by_created.len(), 1);
        assert!(tables
            .by_created
            .iter()
            .all(|(state, _, _)| *state == WorksetState::Ignored));
    }

    #[tokio::test]
    async fn register_rejects_empty_id() {
        let err = store()
            .register(NewWorkset::new("  ", "s3://b/x", Priority::Low))
            .await
            .unwrap_err();
        assert!(matches!(err, UrsaError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn refresh_extends_lock() {
        let clock = Arc::new(SimulatedClock::default());
        let store = store().with_clock(clock.clone());
        store
            .register(NewWorkset::new("ws-1", "s3://b/1", Priority::Normal))
            .await
            .unwrap();
        assert!(store.acquire_lock("ws-1", "a", 10).await.unwrap().is_acquired());

        clock.advance(std::time::Duration::from_secs(8));
        assert!(matches!(
            store.refresh_lock("ws-1", "a").await.unwrap(),
            RefreshOutcome::Refreshed { .. }
        ));

        clock.advance(std::time::Duration::from_secs(8));
        assert!(matches!(
            store.acquire_lock("ws-1", "b", 10).await.unwrap(),
            LockOutcome::AlreadyLocked { .. }
        ));
        assert_eq!(
            store.refresh_lock("ws-1", "b").await.unwrap(),
            RefreshOutcome::NotOwner {
                owner: "a".to_string()
            }
        );
    }

    #[test]
    fn tmp_path_sits_next_to_target() {
        let p = tmp_path(Path::new("/var/lib/ursa/state.json"));
        assert_eq!(p, PathBuf::from("/var/lib/ursa/state.json.tmp"));
    }
}
