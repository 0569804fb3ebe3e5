use std::sync::Arc;

use crate::error::Result;
use crate::store::{Priority, StateStore, Workset, WorksetState};

/// Read-side view of the READY queue.
///
/// Order is priority descending, then `created_at` ascending, then
/// `workset_id`. The store's `(state, priority, created_at, id)` index gives
/// that order directly, so each tier costs one bounded scan.
#[derive(Clone)]
pub struct ReadyQueue {
    store: Arc<dyn StateStore>,
}

impl ReadyQueue {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Head of the queue, if any.
    pub async fn next(&self) -> Result<Option<Workset>> {
        Ok(self.peek(1).await?.into_iter().next())
    }

    /// Up to `limit` worksets from the head of the queue, in dispatch order.
    pub async fn peek(&self, limit: usize) -> Result<Vec<Workset>> {
        let mut out = Vec::with_capacity(limit);
        for priority in Priority::DESCENDING {
            if out.len() >= limit {
                break;
            }
            let page = self
                .store
                .list_by_state(WorksetState::Ready, Some(priority), limit - out.len(), None)
                .await?;
            out.extend(page.items);
        }
        Ok(out)
    }

    /// Number of READY worksets dispatched before `workset_id`, or `None` if it
    /// is not READY.
    pub async fn position(&self, workset_id: &str) -> Result<Option<usize>> {
        let target = self.store.get(workset_id).await?;
        if target.state != WorksetState::Ready {
            return Ok(None);
        }

        let mut ahead = 0;
        for priority in Priority::DESCENDING {
            let mut cursor: Option<String> = None;
            loop {
                let page = self
                    .store
                    .list_by_state(WorksetState::Ready, Some(priority), 256, cursor.as_deref())
                    .await?;
                for ws in &page.items {
                    if ws.workset_id == target.workset_id {
                        return Ok(Some(ahead));
                    }
                    ahead += 1;
                }
                match page.next_cursor {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        }
        Ok(None)
    }
}
