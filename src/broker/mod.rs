//! Generic correlation engine: admits a unit of work, lets exactly one poller
//! claim it, and lets exactly one result-submission complete it, waking the
//! caller suspended in `submit`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{BackhaulError, Result};

/// Lifecycle state of a live work item.
///
/// Terminal outcomes are delivered to the waiting caller and the item is
/// removed; `Approved`/`Rejected` only appear transiently on approval items,
/// between the human response and the waiter's cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Dispatched,
    Approved,
    Rejected,
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemStatus::Pending => write!(f, "pending"),
            ItemStatus::Dispatched => write!(f, "dispatched"),
            ItemStatus::Approved => write!(f, "approved"),
            ItemStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// One unit of work awaiting remote execution.
#[derive(Debug, Clone)]
pub struct WorkItem<P> {
    pub id: String,
    pub payload: P,
    pub status: ItemStatus,
    pub queued_at: DateTime<Utc>,
}

/// How a `submit` call resolved.
#[derive(Debug, PartialEq, Eq)]
pub enum SubmitOutcome<R> {
    /// A poller completed the item before the deadline.
    Completed(R),
    /// No result arrived within the timeout budget.
    TimedOut,
    /// The caller's cancellation token fired first.
    Cancelled,
}

/// Table sizes, for tests and the monitoring log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrokerStats {
    pub live_items: usize,
    pub registered_waiters: usize,
}

/// The rendezvous engine. One instance per domain (commands, file operations,
/// approvals), each owning its own pair of tables.
///
/// `submit` is the only suspending operation; `poll_next` and `complete` are
/// non-blocking and safe to call from any number of concurrent tasks.
pub struct Broker<P, R> {
    items: DashMap<String, WorkItem<P>>,
    waiters: DashMap<String, oneshot::Sender<R>>,
    prefix: &'static str,
    next_seq: AtomicU64,
}

impl<P, R> Broker<P, R>
where
    P: Clone,
{
    pub fn new(prefix: &'static str) -> Self {
        Self {
            items: DashMap::new(),
            waiters: DashMap::new(),
            prefix,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Identifiers are opaque to callers but deliberately monotonic: the
    /// zero-padded counter makes lexicographic order equal admission order,
    /// so the smallest-id dispatch rule in `poll_next` is true FIFO.
    fn next_id(&self) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{:012}", self.prefix, seq)
    }

    /// Admit `payload` and suspend until a result arrives, the timeout
    /// elapses, or `cancel` fires.
    ///
    /// The waiter and the work item are registered as a pair; if either
    /// registration collides the other is rolled back and the call fails with
    /// an admission error. Both entries are removed on every exit path --
    /// including the caller dropping this future mid-wait -- so an abandoned
    /// item can never be dispatched to a poller afterwards.
    pub async fn submit(
        &self,
        payload: P,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<SubmitOutcome<R>> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();

        match self.waiters.entry(id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
            Entry::Occupied(_) => {
                error!(id = %id, "admission failed: waiter already registered");
                return Err(BackhaulError::Admission { id });
            }
        }

        let item = WorkItem {
            id: id.clone(),
            payload,
            status: ItemStatus::Pending,
            queued_at: Utc::now(),
        };
        match self.items.entry(id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(item);
            }
            Entry::Occupied(_) => {
                self.waiters.remove(&id);
                error!(id = %id, "admission failed: work item already registered");
                return Err(BackhaulError::Admission { id });
            }
        }

        let _cleanup = Cleanup {
            items: &self.items,
            waiters: &self.waiters,
            id: &id,
        };

        tokio::select! {
            res = rx => match res {
                Ok(result) => Ok(SubmitOutcome::Completed(result)),
                Err(_) => {
                    error!(id = %id, "waiter dropped without a result");
                    Err(BackhaulError::WaiterLost { id: id.clone() })
                }
            },
            _ = tokio::time::sleep(timeout) => {
                warn!(id = %id, timeout_secs = timeout.as_secs(), "timed out waiting for result");
                Ok(SubmitOutcome::TimedOut)
            }
            _ = cancel.cancelled() => {
                warn!(id = %id, "submit cancelled by caller");
                Ok(SubmitOutcome::Cancelled)
            }
        }
    }

    /// Claim the pending item with the smallest identifier, transitioning it
    /// pending -> dispatched. A lost race (another poller claimed it between
    /// the scan and the swap) returns `None` for this cycle; the item stays
    /// claimable on the next poll.
    pub fn poll_next(&self) -> Option<WorkItem<P>> {
        let candidate = self
            .items
            .iter()
            .filter(|entry| entry.status == ItemStatus::Pending)
            .map(|entry| entry.id.clone())
            .min()?;

        let mut entry = self.items.get_mut(&candidate)?;
        if entry.status != ItemStatus::Pending {
            warn!(id = %candidate, "dispatch race lost, item no longer pending");
            return None;
        }
        entry.status = ItemStatus::Dispatched;
        debug!(id = %candidate, "dispatched work item");
        Some(entry.value().clone())
    }

    /// Resolve the waiter for `id` with `result` and drop the work item.
    ///
    /// Returns whether a waiter was actually resolved. A duplicate or late
    /// completion (the caller already timed out or cancelled) is a no-op;
    /// the item, if still present, is removed regardless.
    pub fn complete(&self, id: &str, result: R) -> bool {
        let resolved = match self.waiters.remove(id) {
            Some((_, tx)) => {
                // The receiver can disappear between remove and send; that
                // caller has already given up, so a send failure is not an
                // error.
                let _ = tx.send(result);
                true
            }
            None => {
                debug!(id = %id, "no waiter registered (already resolved or expired)");
                false
            }
        };
        self.items.remove(id);
        resolved
    }

    /// Read-only scan: the lowest-id pending item matching `pred`, without
    /// claiming it. Used by the approval gate, where items are resolved by a
    /// human decision rather than remote dispatch.
    pub fn find_pending<F>(&self, pred: F) -> Option<WorkItem<P>>
    where
        F: Fn(&P) -> bool,
    {
        let id = self
            .items
            .iter()
            .filter(|entry| entry.status == ItemStatus::Pending && pred(&entry.payload))
            .map(|entry| entry.id.clone())
            .min()?;
        self.items.get(&id).map(|entry| entry.value().clone())
    }

    /// Overwrite the stored status of a live item. Returns false if the item
    /// is gone.
    pub fn mark_status(&self, id: &str, status: ItemStatus) -> bool {
        match self.items.get_mut(id) {
            Some(mut entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    pub fn status_of(&self, id: &str) -> Option<ItemStatus> {
        self.items.get(id).map(|entry| entry.status)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            live_items: self.items.len(),
            registered_waiters: self.waiters.len(),
        }
    }
}

/// Removes the waiter/item pair for one identifier when dropped. Shared exit
/// path for result delivery, timeout, cancellation, and a dropped submit
/// future.
struct Cleanup<'a, P, R> {
    items: &'a DashMap<String, WorkItem<P>>,
    waiters: &'a DashMap<String, oneshot::Sender<R>>,
    id: &'a str,
}

impl<P, R> Drop for Cleanup<'_, P, R> {
    fn drop(&mut self) {
        self.waiters.remove(self.id);
        self.items.remove(self.id);
    }
}
