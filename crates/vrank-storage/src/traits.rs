use std::collections::BTreeSet;

use vrank_core::{
    Event, ItemId, ItemRef, JobId, ListKey, OrgId, OrgSnapshot, RankEntry, RankError, RankResult, ReconcileJob, UserId,
    WorkItem,
};

/// One user's list for one kind, open inside a transaction.
///
/// Every rank mutation in the engine goes through these primitives; callers
/// never write ranks any other way.
pub trait RankList {
    fn key(&self) -> &ListKey;

    /// All entries, active ones by ascending rank followed by pinned ones.
    fn entries(&self) -> RankResult<Vec<RankEntry>>;

    fn get(&self, item: &ItemId) -> RankResult<Option<RankEntry>>;

    /// The active entry at `rank`. Rank 0 never matches.
    fn at_rank(&self, rank: u32) -> RankResult<Option<RankEntry>>;

    /// Fails with `DuplicateEntry` if the item is already in the list.
    fn insert(&mut self, entry: RankEntry) -> RankResult<()>;

    fn remove(&mut self, item: &ItemId) -> RankResult<Option<RankEntry>>;

    fn set_rank(&mut self, item: &ItemId, rank: u32) -> RankResult<()>;

    fn set_favorite(&mut self, item: &ItemId, flag: bool) -> RankResult<()>;

    /// Adds `delta` to every active entry with `lo <= rank <= hi`
    /// (`hi = None` is unbounded). Returns the number of entries moved.
    fn shift(&mut self, lo: u32, hi: Option<u32>, delta: i32) -> RankResult<usize>;

    /// `max(active rank) + 1`, or 1 for an empty list.
    fn next_rank(&self) -> RankResult<u32>;

    fn favorites(&self) -> RankResult<Vec<RankEntry>> {
        Ok(self.entries()?.into_iter().filter(|e| e.is_favorite).collect())
    }

    /// Highest rank among active favorites, 0 when there are none.
    fn max_favorite_rank(&self) -> RankResult<u32> {
        Ok(self
            .entries()?
            .iter()
            .filter(|e| e.is_favorite && !e.is_pinned())
            .map(|e| e.rank)
            .max()
            .unwrap_or(0))
    }
}

pub trait RankStore: Send + Sync {
    /// Runs `f` against the list for `key` with exclusive access. If `f`
    /// returns an error nothing it did is kept.
    fn with_list<T, F>(&self, key: &ListKey, f: F) -> RankResult<T>
    where
        F: FnOnce(&mut dyn RankList) -> RankResult<T>;

    /// Committed entries for one list, ordered like [`RankList::entries`].
    fn entries(&self, key: &ListKey) -> RankResult<Vec<RankEntry>>;

    /// Users that currently hold an entry for the item.
    fn holders(&self, item: &ItemRef) -> RankResult<BTreeSet<UserId>>;

    fn list_keys(&self) -> RankResult<Vec<ListKey>>;
}

/// Authorization facts owned by the request layer. The engine reads them;
/// `record` exists so the request layer (or a replay) can persist an event.
pub trait Directory: Send + Sync {
    fn load_org(&self, org_id: &OrgId) -> RankResult<OrgSnapshot>;

    fn item(&self, item: &ItemRef) -> RankResult<Option<WorkItem>>;

    fn record(&self, event: &Event) -> RankResult<()>;
}

/// Durable queue of background reconciliation batches.
pub trait JobQueue: Send + Sync {
    /// Returns false when a not-yet-leased job with the same idempotency key
    /// is already waiting; that job will read fresh state anyway.
    fn enqueue(&self, job: ReconcileJob) -> RankResult<bool>;

    /// Leases the oldest visible job. Jobs whose lease expired are visible again.
    fn try_acquire_lease(&self, worker_id: &str, now_unix: i64, ttl_secs: i64) -> RankResult<Option<ReconcileJob>>;

    fn complete(&self, job_id: &JobId, worker_id: &str) -> RankResult<()>;

    /// Records a failed attempt and makes the job visible again at `visible_at_unix`.
    fn reschedule(&self, job_id: &JobId, worker_id: &str, visible_at_unix: i64, error: &str) -> RankResult<()>;

    fn dead_letter(&self, job_id: &JobId, worker_id: &str, reason: &str) -> RankResult<()>;

    fn pending_jobs(&self) -> RankResult<Vec<ReconcileJob>>;

    fn dead_jobs(&self) -> RankResult<Vec<ReconcileJob>>;
}

/// Everything the engine needs from a backend.
pub trait Storage: RankStore + Directory + JobQueue {}

impl<T: RankStore + Directory + JobQueue> Storage for T {}

/// Rejects shifts that would push an active entry to rank 0 or below.
pub fn validate_shift(key: &ListKey, lo: u32, delta: i32) -> RankResult<()> {
    if delta == 0 {
        return Err(RankError::invalid_rank(key, "shift by zero"));
    }
    if lo == 0 || i64::from(lo) + i64::from(delta) < 1 {
        return Err(RankError::invalid_rank(key, format!("shift from {lo} by {delta} leaves the active range")));
    }
    Ok(())
}

/// Active entries by rank, then pinned entries by item id.
pub fn sort_entries(entries: &mut [RankEntry]) {
    entries.sort_by(|a, b| {
        a.is_pinned()
            .cmp(&b.is_pinned())
            .then(a.rank.cmp(&b.rank))
            .then(a.item_id.cmp(&b.item_id))
    });
}

pub fn apply_delta(rank: u32, delta: i32) -> u32 {
    (i64::from(rank) + i64::from(delta)).max(0) as u32
}
