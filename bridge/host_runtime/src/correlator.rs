use crate::context::HandlerContext;
use crate::error::{BusError, BusResult};
use crate::message::{Message, NO_REPLY};
use std::collections::HashMap;

pub type ReplyCallback =
    Box<dyn FnOnce(&mut HandlerContext<'_>, &Message) -> anyhow::Result<()> + Send>;

/// Pending one-shot reply callbacks keyed by correlation id.
///
/// Ids start at 1 and only grow; [`NO_REPLY`] is never handed out. Clearing
/// the table keeps the counter, so an id from before a relaunch can never
/// name a callback registered after it.
pub struct ReplyCorrelator<C = ReplyCallback> {
    next_id: i64,
    pending: HashMap<i64, C>,
    max_pending: usize,
}

impl<C> ReplyCorrelator<C> {
    pub fn new(max_pending: usize) -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
            max_pending,
        }
    }

    pub fn register(&mut self, callback: C) -> BusResult<i64> {
        if self.pending.len() >= self.max_pending {
            return Err(BusError::TooManyPendingReplies {
                limit: self.max_pending,
            });
        }

        let id = self.allocate_id();
        self.pending.insert(id, callback);
        Ok(id)
    }

    /// Removes the pending entry; a second call for the same id returns `None`.
    pub fn take(&mut self, id: i64) -> Option<C> {
        if id == NO_REPLY {
            return None;
        }
        self.pending.remove(&id)
    }

    /// Removes the entry and hands it to `invoke`. Absent ids are a no-op.
    pub fn resolve<R>(&mut self, id: i64, invoke: impl FnOnce(C) -> R) -> Option<R> {
        self.take(id).map(invoke)
    }

    pub fn is_pending(&self, id: i64) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn allocate_id(&mut self) -> i64 {
        loop {
            let id = self.next_id;
            self.next_id = if id == i64::MAX { 1 } else { id + 1 };
            // Only reachable after a wrap; the ceiling keeps this loop short.
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }
}
