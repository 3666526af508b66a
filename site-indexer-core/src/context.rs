//! Per-invocation state threaded through every pipeline stage.
//!
//! Nothing here is process-wide: a fresh [`IndexContext`] is built for each `index-site` run,
//! and the [`PendingWritesHandle`] is the only piece shared with the local proxy.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::IndexRequest;
use crate::error::IndexError;
use crate::record::PageIndexRecord;

/// Cancellation and deadline applied to every suspension point of a run.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, within: Duration) -> Self {
        self.deadline = Some(Instant::now() + within);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Runs `fut` unless the run is cancelled or its deadline passes first.
    pub async fn guard<T, E, F>(&self, what: &str, fut: F) -> Result<T, IndexError>
    where
        E: Into<IndexError>,
        F: Future<Output = Result<T, E>>,
    {
        self.guard_until(what, self.deadline, fut).await
    }

    /// Same as [`RunControl::guard`] with an explicit deadline (the earlier of the two wins).
    pub async fn guard_until<T, E, F>(
        &self,
        what: &str,
        deadline: Option<Instant>,
        fut: F,
    ) -> Result<T, IndexError>
    where
        E: Into<IndexError>,
        F: Future<Output = Result<T, E>>,
    {
        if self.cancel.is_cancelled() {
            return Err(IndexError::Cancelled);
        }
        let deadline = earliest(self.deadline, deadline);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(IndexError::Cancelled),
            _ = sleep_until(deadline) => {
                Err(IndexError::Timeout(format!("deadline reached while waiting for {what}")))
            }
            result = fut => result.map_err(Into::into),
        }
    }

    /// A cancellable poll tick.
    pub async fn tick(&self, interval: Duration, deadline: Option<Instant>) -> Result<(), IndexError> {
        self.guard_until("poll interval", deadline, async {
            tokio::time::sleep(interval).await;
            Ok::<_, IndexError>(())
        })
        .await
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Target of the current locale pass, as needed by the proxy to build write payloads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassTarget {
    pub repository_id: String,
    pub content_type: String,
    pub language: String,
    pub is_master: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCreate {
    pub record: PageIndexRecord,
    /// Master item this locale record translates.
    pub source_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    pub item_id: String,
    pub record: PageIndexRecord,
}

/// Writes the orchestrator has queued for the proxy.
#[derive(Debug, Clone, Default)]
pub struct PendingWrites {
    pub target: Option<PassTarget>,
    pub creates: Vec<PendingCreate>,
    pub updates: Vec<PendingUpdate>,
    /// Every item id to include in the publish job.
    pub publish_ids: Vec<String>,
}

/// Shared handle on [`PendingWrites`]. The lock is never held across an await.
#[derive(Debug, Clone, Default)]
pub struct PendingWritesHandle(Arc<RwLock<PendingWrites>>);

impl PendingWritesHandle {
    pub fn read<T>(&self, f: impl FnOnce(&PendingWrites) -> T) -> T {
        let guard = self.0.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    pub fn update<T>(&self, f: impl FnOnce(&mut PendingWrites) -> T) -> T {
        let mut guard = self.0.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Replaces the queued creates/updates with those of a new pass. The publish set is kept.
    pub fn begin_pass(
        &self,
        target: PassTarget,
        creates: Vec<PendingCreate>,
        updates: Vec<PendingUpdate>,
    ) {
        self.update(|p| {
            p.target = Some(target);
            p.creates = creates;
            p.updates = updates;
        });
    }

    pub fn add_publish_ids<I: IntoIterator<Item = String>>(&self, ids: I) {
        self.update(|p| {
            for id in ids {
                if !p.publish_ids.contains(&id) {
                    p.publish_ids.push(id);
                }
            }
        });
    }

    pub fn publish_ids(&self) -> Vec<String> {
        self.read(|p| p.publish_ids.clone())
    }
}

/// Bare page id → master index item id, filled by the master pass.
#[derive(Debug, Clone, Default)]
pub struct MasterItemRegistry {
    items: HashMap<String, String>,
    order: Vec<String>,
}

impl MasterItemRegistry {
    pub fn insert(&mut self, pageid: &str, item_id: &str) {
        if self.items.insert(pageid.to_string(), item_id.to_string()).is_none() {
            self.order.push(pageid.to_string());
        }
    }

    pub fn get(&self, pageid: &str) -> Option<&str> {
        self.items.get(pageid).map(String::as_str)
    }

    /// Item ids in registration order.
    pub fn item_ids(&self) -> Vec<String> {
        self.order
            .iter()
            .filter_map(|p| self.items.get(p).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Everything one invocation carries from stage to stage.
#[derive(Debug, Clone)]
pub struct IndexContext {
    pub request: IndexRequest,
    pub control: RunControl,
    pub pending: PendingWritesHandle,
    pub registry: MasterItemRegistry,
}

impl IndexContext {
    pub fn new(request: IndexRequest, control: RunControl) -> Self {
        IndexContext {
            request,
            control,
            pending: PendingWritesHandle::default(),
            registry: MasterItemRegistry::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guard_reports_cancellation() {
        let control = RunControl::new();
        control.cancel_token().cancel();
        let result = control
            .guard("never", async { Ok::<_, IndexError>(1) })
            .await;
        assert!(matches!(result, Err(IndexError::Cancelled)));
    }

    #[tokio::test]
    async fn guard_times_out_at_deadline() {
        let control = RunControl::new().with_deadline(Duration::from_millis(10));
        let result = control
            .guard("slow call", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, IndexError>(())
            })
            .await;
        assert!(matches!(result, Err(IndexError::Timeout(msg)) if msg.contains("slow call")));
    }

    #[test]
    fn registry_keeps_first_registration_order() {
        let mut registry = MasterItemRegistry::default();
        registry.insert("2", "B");
        registry.insert("1", "A");
        registry.insert("2", "B2");
        assert_eq!(registry.item_ids(), vec!["B2", "A"]);
        assert_eq!(registry.get("1"), Some("A"));
    }

    #[test]
    fn publish_ids_are_deduplicated() {
        let pending = PendingWritesHandle::default();
        pending.add_publish_ids(vec!["a".to_string(), "b".to_string()]);
        pending.add_publish_ids(vec!["a".to_string()]);
        assert_eq!(pending.publish_ids(), vec!["a", "b"]);
    }
}
