use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use vrank_core::{
    Event, Group, GroupId, ItemId, ItemRef, JobId, ListKey, MembershipChange, OrgId, OrgSnapshot, RankEntry, RankError,
    RankResult, ReconcileJob, UserId, WorkItem,
};

use crate::traits::{apply_delta, sort_entries, validate_shift, Directory, JobQueue, RankList, RankStore};

type ListCell = Arc<Mutex<BTreeMap<ItemId, RankEntry>>>;

/// In-memory storage for tests. Not durable, but each (user, kind) list has
/// its own lock so unrelated lists proceed in parallel.
#[derive(Default)]
pub struct InMemoryStorage {
    lists: Mutex<HashMap<ListKey, ListCell>>,
    orgs: Mutex<HashMap<OrgId, OrgSnapshot>>,
    jobs: Mutex<Vec<StoredJob>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum JobState {
    Pending,
    Leased { worker_id: String, expires_at_unix: i64 },
    Dead,
}

#[derive(Clone, Debug)]
struct StoredJob {
    job: ReconcileJob,
    state: JobState,
}

fn lock<T>(m: &Mutex<T>) -> RankResult<MutexGuard<'_, T>> {
    m.lock().map_err(|_| RankError::Backend(anyhow!("in-memory storage lock poisoned")))
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, key: &ListKey) -> RankResult<ListCell> {
        let mut lists = lock(&self.lists)?;
        Ok(lists.entry(key.clone()).or_default().clone())
    }
}

/// Working copy of one list; written back only when the closure succeeds.
struct MemoryList {
    key: ListKey,
    entries: BTreeMap<ItemId, RankEntry>,
}

impl MemoryList {
    fn entry_mut(&mut self, item: &ItemId) -> RankResult<&mut RankEntry> {
        let key = &self.key;
        self.entries
            .get_mut(item)
            .ok_or_else(|| RankError::invalid_rank(key, format!("item {item} is not ranked")))
    }
}

impl RankList for MemoryList {
    fn key(&self) -> &ListKey {
        &self.key
    }

    fn entries(&self) -> RankResult<Vec<RankEntry>> {
        let mut out: Vec<RankEntry> = self.entries.values().cloned().collect();
        sort_entries(&mut out);
        Ok(out)
    }

    fn get(&self, item: &ItemId) -> RankResult<Option<RankEntry>> {
        Ok(self.entries.get(item).cloned())
    }

    fn at_rank(&self, rank: u32) -> RankResult<Option<RankEntry>> {
        if rank == 0 {
            return Ok(None);
        }
        Ok(self.entries.values().find(|e| e.rank == rank).cloned())
    }

    fn insert(&mut self, entry: RankEntry) -> RankResult<()> {
        if entry.key() != self.key {
            return Err(RankError::invalid_rank(&self.key, format!("entry belongs to list {}", entry.key())));
        }
        if self.entries.contains_key(&entry.item_id) {
            return Err(RankError::DuplicateEntry {
                user_id: entry.user_id.clone(),
                item: ItemRef::new(entry.kind, entry.item_id.clone()),
            });
        }
        self.entries.insert(entry.item_id.clone(), entry);
        Ok(())
    }

    fn remove(&mut self, item: &ItemId) -> RankResult<Option<RankEntry>> {
        Ok(self.entries.remove(item))
    }

    fn set_rank(&mut self, item: &ItemId, rank: u32) -> RankResult<()> {
        self.entry_mut(item)?.rank = rank;
        Ok(())
    }

    fn set_favorite(&mut self, item: &ItemId, flag: bool) -> RankResult<()> {
        self.entry_mut(item)?.is_favorite = flag;
        Ok(())
    }

    fn shift(&mut self, lo: u32, hi: Option<u32>, delta: i32) -> RankResult<usize> {
        validate_shift(&self.key, lo, delta)?;
        let hi = hi.unwrap_or(u32::MAX);
        let mut moved = 0;
        for e in self.entries.values_mut() {
            if e.rank != 0 && e.rank >= lo && e.rank <= hi {
                e.rank = apply_delta(e.rank, delta);
                moved += 1;
            }
        }
        Ok(moved)
    }

    fn next_rank(&self) -> RankResult<u32> {
        Ok(self.entries.values().map(|e| e.rank).max().unwrap_or(0) + 1)
    }
}

impl RankStore for InMemoryStorage {
    fn with_list<T, F>(&self, key: &ListKey, f: F) -> RankResult<T>
    where
        F: FnOnce(&mut dyn RankList) -> RankResult<T>,
    {
        let cell = self.cell(key)?;
        let mut committed = lock(&cell)?;
        let mut list = MemoryList {
            key: key.clone(),
            entries: committed.clone(),
        };
        let out = f(&mut list)?;
        *committed = list.entries;
        Ok(out)
    }

    fn entries(&self, key: &ListKey) -> RankResult<Vec<RankEntry>> {
        let cell = self.cell(key)?;
        let committed = lock(&cell)?;
        let mut out: Vec<RankEntry> = committed.values().cloned().collect();
        sort_entries(&mut out);
        Ok(out)
    }

    fn holders(&self, item: &ItemRef) -> RankResult<BTreeSet<UserId>> {
        let cells: Vec<(ListKey, ListCell)> = lock(&self.lists)?
            .iter()
            .filter(|(k, _)| k.kind == item.kind)
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect();
        let mut out = BTreeSet::new();
        for (key, cell) in cells {
            if lock(&cell)?.contains_key(&item.id) {
                out.insert(key.user_id);
            }
        }
        Ok(out)
    }

    fn list_keys(&self) -> RankResult<Vec<ListKey>> {
        let mut keys: Vec<ListKey> = lock(&self.lists)?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

fn group_mut<'a>(snap: &'a mut OrgSnapshot, org_id: &OrgId, group_id: &GroupId) -> &'a mut Group {
    snap.groups.entry(group_id.clone()).or_insert_with(|| Group {
        id: group_id.clone(),
        org_id: org_id.clone(),
        members: BTreeSet::new(),
    })
}

impl Directory for InMemoryStorage {
    fn load_org(&self, org_id: &OrgId) -> RankResult<OrgSnapshot> {
        let orgs = lock(&self.orgs)?;
        Ok(orgs.get(org_id).cloned().unwrap_or_else(|| OrgSnapshot::new(org_id.clone())))
    }

    fn item(&self, item: &ItemRef) -> RankResult<Option<WorkItem>> {
        let orgs = lock(&self.orgs)?;
        Ok(orgs.values().find_map(|snap| snap.items.get(item).cloned()))
    }

    fn record(&self, event: &Event) -> RankResult<()> {
        let mut orgs = lock(&self.orgs)?;
        let org_id = event.org_id().clone();
        let snap = orgs
            .entry(org_id.clone())
            .or_insert_with(|| OrgSnapshot::new(org_id.clone()));
        match event {
            Event::ItemCreated { item } => {
                snap.items.insert(item.item_ref(), item.clone());
            }
            Event::ItemStatusChanged { item, new, .. } => {
                let mut item = item.clone();
                item.status = *new;
                snap.items.insert(item.item_ref(), item);
            }
            Event::ItemAssignmentChanged { item, new_assignees, .. } => {
                let mut item = item.clone();
                item.assignees = new_assignees.clone();
                snap.items.insert(item.item_ref(), item);
            }
            Event::GroupMembershipChanged {
                group_id,
                user_id,
                change,
                ..
            } => {
                let group = group_mut(snap, &org_id, group_id);
                match change {
                    MembershipChange::Added => group.members.insert(user_id.clone()),
                    MembershipChange::Removed => group.members.remove(user_id),
                };
            }
            Event::PermissionGrantChanged {
                group_id,
                slug,
                has_permission,
                ..
            } => {
                group_mut(snap, &org_id, group_id);
                snap.grants.insert((group_id.clone(), *slug), *has_permission);
            }
        }
        Ok(())
    }
}

impl JobQueue for InMemoryStorage {
    fn enqueue(&self, job: ReconcileJob) -> RankResult<bool> {
        let mut jobs = lock(&self.jobs)?;
        let waiting = jobs
            .iter()
            .any(|j| j.state == JobState::Pending && j.job.idempotency_key == job.idempotency_key);
        if waiting {
            return Ok(false);
        }
        jobs.push(StoredJob {
            job,
            state: JobState::Pending,
        });
        Ok(true)
    }

    fn try_acquire_lease(&self, worker_id: &str, now_unix: i64, ttl_secs: i64) -> RankResult<Option<ReconcileJob>> {
        let mut jobs = lock(&self.jobs)?;
        let next = jobs
            .iter_mut()
            .filter(|j| match &j.state {
                JobState::Pending => j.job.visible_at_unix <= now_unix,
                JobState::Leased { expires_at_unix, .. } => *expires_at_unix <= now_unix,
                JobState::Dead => false,
            })
            .min_by_key(|j| j.job.visible_at_unix);
        Ok(next.map(|j| {
            j.state = JobState::Leased {
                worker_id: worker_id.to_string(),
                expires_at_unix: now_unix + ttl_secs,
            };
            j.job.clone()
        }))
    }

    fn complete(&self, job_id: &JobId, worker_id: &str) -> RankResult<()> {
        let mut jobs = lock(&self.jobs)?;
        jobs.retain(|j| !(j.job.id == *job_id && leased_by(&j.state, worker_id)));
        Ok(())
    }

    fn reschedule(&self, job_id: &JobId, worker_id: &str, visible_at_unix: i64, error: &str) -> RankResult<()> {
        let mut jobs = lock(&self.jobs)?;
        if let Some(j) = jobs
            .iter_mut()
            .find(|j| j.job.id == *job_id && leased_by(&j.state, worker_id))
        {
            j.job.attempts += 1;
            j.job.visible_at_unix = visible_at_unix;
            j.job.last_error = Some(error.to_string());
            j.state = JobState::Pending;
        }
        Ok(())
    }

    fn dead_letter(&self, job_id: &JobId, worker_id: &str, reason: &str) -> RankResult<()> {
        let mut jobs = lock(&self.jobs)?;
        if let Some(j) = jobs
            .iter_mut()
            .find(|j| j.job.id == *job_id && leased_by(&j.state, worker_id))
        {
            j.job.attempts += 1;
            j.job.last_error = Some(reason.to_string());
            j.state = JobState::Dead;
        }
        Ok(())
    }

    fn pending_jobs(&self) -> RankResult<Vec<ReconcileJob>> {
        let jobs = lock(&self.jobs)?;
        Ok(jobs
            .iter()
            .filter(|j| j.state != JobState::Dead)
            .map(|j| j.job.clone())
            .collect())
    }

    fn dead_jobs(&self) -> RankResult<Vec<ReconcileJob>> {
        let jobs = lock(&self.jobs)?;
        Ok(jobs
            .iter()
            .filter(|j| j.state == JobState::Dead)
            .map(|j| j.job.clone())
            .collect())
    }
}

fn leased_by(state: &JobState, worker: &str) -> bool {
    matches!(state, JobState::Leased { worker_id, .. } if worker_id == worker)
}
