use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;
use vrank_core::{
    Event, Group, GroupId, ItemId, ItemKind, ItemRef, JobId, JobScope, ListKey, MembershipChange, OrgId, OrgSnapshot,
    RankEntry, RankError, RankResult, ReconcileJob, Slug, UserId, WorkItem,
};
use vrank_storage::{sort_entries, validate_shift, Directory, JobQueue, RankList, RankStore};

/// SQLite-backed storage. A single connection behind a mutex; list
/// transactions open with `BEGIN IMMEDIATE` so writers on the same database
/// file never interleave.
///
/// Closures passed to [`RankStore::with_list`] must not call back into the
/// same `SqliteStorage`.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

trait BackendExt<T> {
    fn backend(self) -> RankResult<T>;
}

impl<T, E> BackendExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn backend(self) -> RankResult<T> {
        self.map_err(|e| RankError::Backend(e.into()))
    }
}

impl SqliteStorage {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create db dir {}", parent.display()))?;
        }
        let conn = Connection::open(db_path).with_context(|| format!("open sqlite db {}", db_path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory sqlite db")?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let init_sql = include_str!("../migrations/0001_init.sql");
        conn.execute_batch(init_sql).context("apply schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> RankResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| RankError::Backend(anyhow!("sqlite connection lock poisoned")))
    }
}

struct SqliteList<'c> {
    conn: &'c Connection,
    key: ListKey,
}

impl SqliteList<'_> {
    fn read_entry(&self, r: &Row<'_>) -> rusqlite::Result<RankEntry> {
        Ok(RankEntry {
            user_id: self.key.user_id.clone(),
            item_id: ItemId::from_str(r.get::<_, String>(0)?),
            kind: self.key.kind,
            rank: r.get::<_, i64>(1)? as u32,
            is_favorite: r.get::<_, i64>(2)? != 0,
        })
    }

    fn missing(&self, item: &ItemId) -> RankError {
        RankError::invalid_rank(&self.key, format!("item {item} is not ranked"))
    }
}

impl RankList for SqliteList<'_> {
    fn key(&self) -> &ListKey {
        &self.key
    }

    fn entries(&self) -> RankResult<Vec<RankEntry>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT item_id, rank, is_favorite FROM rank_entry WHERE user_id=?1 AND item_kind=?2")
            .backend()?;
        let rows = stmt
            .query_map(params![self.key.user_id.0, self.key.kind.as_str()], |r| self.read_entry(r))
            .backend()?;
        let mut out = vec![];
        for row in rows {
            out.push(row.backend()?);
        }
        sort_entries(&mut out);
        Ok(out)
    }

    fn get(&self, item: &ItemId) -> RankResult<Option<RankEntry>> {
        self.conn
            .query_row(
                "SELECT item_id, rank, is_favorite FROM rank_entry WHERE user_id=?1 AND item_kind=?2 AND item_id=?3",
                params![self.key.user_id.0, self.key.kind.as_str(), item.0],
                |r| self.read_entry(r),
            )
            .optional()
            .backend()
    }

    fn at_rank(&self, rank: u32) -> RankResult<Option<RankEntry>> {
        if rank == 0 {
            return Ok(None);
        }
        self.conn
            .query_row(
                "SELECT item_id, rank, is_favorite FROM rank_entry WHERE user_id=?1 AND item_kind=?2 AND rank=?3 LIMIT 1",
                params![self.key.user_id.0, self.key.kind.as_str(), rank as i64],
                |r| self.read_entry(r),
            )
            .optional()
            .backend()
    }

    fn insert(&mut self, entry: RankEntry) -> RankResult<()> {
        if entry.key() != self.key {
            return Err(RankError::invalid_rank(&self.key, format!("entry belongs to list {}", entry.key())));
        }
        let res = self.conn.execute(
            "INSERT INTO rank_entry(user_id, item_id, item_kind, rank, is_favorite) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.user_id.0,
                entry.item_id.0,
                entry.kind.as_str(),
                entry.rank as i64,
                entry.is_favorite as i64
            ],
        );
        match res {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(RankError::DuplicateEntry {
                    user_id: entry.user_id,
                    item: ItemRef::new(entry.kind, entry.item_id),
                })
            }
            Err(e) => Err(RankError::Backend(e.into())),
        }
    }

    fn remove(&mut self, item: &ItemId) -> RankResult<Option<RankEntry>> {
        let existing = self.get(item)?;
        if existing.is_some() {
            self.conn
                .execute(
                    "DELETE FROM rank_entry WHERE user_id=?1 AND item_kind=?2 AND item_id=?3",
                    params![self.key.user_id.0, self.key.kind.as_str(), item.0],
                )
                .backend()?;
        }
        Ok(existing)
    }

    fn set_rank(&mut self, item: &ItemId, rank: u32) -> RankResult<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE rank_entry SET rank=?1 WHERE user_id=?2 AND item_kind=?3 AND item_id=?4",
                params![rank as i64, self.key.user_id.0, self.key.kind.as_str(), item.0],
            )
            .backend()?;
        if changed == 0 {
            return Err(self.missing(item));
        }
        Ok(())
    }

    fn set_favorite(&mut self, item: &ItemId, flag: bool) -> RankResult<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE rank_entry SET is_favorite=?1 WHERE user_id=?2 AND item_kind=?3 AND item_id=?4",
                params![flag as i64, self.key.user_id.0, self.key.kind.as_str(), item.0],
            )
            .backend()?;
        if changed == 0 {
            return Err(self.missing(item));
        }
        Ok(())
    }

    fn shift(&mut self, lo: u32, hi: Option<u32>, delta: i32) -> RankResult<usize> {
        validate_shift(&self.key, lo, delta)?;
        let hi = hi.map(i64::from).unwrap_or(i64::MAX);
        self.conn
            .execute(
                "UPDATE rank_entry SET rank = rank + ?1
                 WHERE user_id=?2 AND item_kind=?3 AND rank != 0 AND rank >= ?4 AND rank <= ?5",
                params![delta as i64, self.key.user_id.0, self.key.kind.as_str(), lo as i64, hi],
            )
            .backend()
    }

    fn next_rank(&self) -> RankResult<u32> {
        let max: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(rank), 0) FROM rank_entry WHERE user_id=?1 AND item_kind=?2",
                params![self.key.user_id.0, self.key.kind.as_str()],
                |r| r.get(0),
            )
            .backend()?;
        Ok(max as u32 + 1)
    }
}

impl RankStore for SqliteStorage {
    fn with_list<T, F>(&self, key: &ListKey, f: F) -> RankResult<T>
    where
        F: FnOnce(&mut dyn RankList) -> RankResult<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).backend()?;
        let out = {
            let mut list = SqliteList {
                conn: &tx,
                key: key.clone(),
            };
            // dropping `tx` on error rolls back
            f(&mut list)?
        };
        tx.commit().backend()?;
        Ok(out)
    }

    fn entries(&self, key: &ListKey) -> RankResult<Vec<RankEntry>> {
        let conn = self.lock()?;
        SqliteList {
            conn: &conn,
            key: key.clone(),
        }
        .entries()
    }

    fn holders(&self, item: &ItemRef) -> RankResult<BTreeSet<UserId>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached("SELECT user_id FROM rank_entry WHERE item_kind=?1 AND item_id=?2")
            .backend()?;
        let rows = stmt
            .query_map(params![item.kind.as_str(), item.id.0], |r| r.get::<_, String>(0))
            .backend()?;
        let mut out = BTreeSet::new();
        for row in rows {
            out.insert(UserId::from_str(row.backend()?));
        }
        Ok(out)
    }

    fn list_keys(&self) -> RankResult<Vec<ListKey>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT user_id, item_kind FROM rank_entry ORDER BY user_id, item_kind")
            .backend()?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .backend()?;
        let mut out = vec![];
        for row in rows {
            let (user, kind) = row.backend()?;
            out.push(ListKey::new(UserId::from_str(user), parse_kind(&kind)?));
        }
        out.sort();
        Ok(out)
    }
}

fn parse_kind(s: &str) -> RankResult<ItemKind> {
    ItemKind::parse(s).ok_or_else(|| RankError::Backend(anyhow!("unknown item kind in database: {s}")))
}

fn upsert_item(conn: &Connection, item: &WorkItem) -> RankResult<()> {
    let body = serde_json::to_string(item).backend()?;
    conn.execute(
        "INSERT INTO work_items(item_kind, id, org_id, body_json) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(item_kind, id) DO UPDATE SET org_id=excluded.org_id, body_json=excluded.body_json",
        params![item.kind().as_str(), item.id.0, item.org_id.0, body],
    )
    .backend()?;
    Ok(())
}

fn ensure_group(conn: &Connection, org_id: &OrgId, group_id: &GroupId) -> RankResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO groups(id, org_id) VALUES (?1, ?2)",
        params![group_id.0, org_id.0],
    )
    .backend()?;
    Ok(())
}

impl Directory for SqliteStorage {
    fn load_org(&self, org_id: &OrgId) -> RankResult<OrgSnapshot> {
        let conn = self.lock()?;
        let mut snap = OrgSnapshot::new(org_id.clone());

        {
            let mut stmt = conn.prepare("SELECT id FROM groups WHERE org_id=?1").backend()?;
            let rows = stmt.query_map([&org_id.0], |r| r.get::<_, String>(0)).backend()?;
            for row in rows {
                let id = GroupId::from_str(row.backend()?);
                snap.groups.insert(
                    id.clone(),
                    Group {
                        id,
                        org_id: org_id.clone(),
                        members: BTreeSet::new(),
                    },
                );
            }
        }

        {
            let mut stmt = conn
                .prepare(
                    "SELECT m.group_id, m.user_id FROM group_members m
                     JOIN groups g ON g.id = m.group_id WHERE g.org_id=?1",
                )
                .backend()?;
            let rows = stmt
                .query_map([&org_id.0], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
                .backend()?;
            for row in rows {
                let (group, user) = row.backend()?;
                if let Some(g) = snap.groups.get_mut(&GroupId::from_str(group)) {
                    g.members.insert(UserId::from_str(user));
                }
            }
        }

        {
            let mut stmt = conn
                .prepare(
                    "SELECT p.group_id, p.slug, p.has_permission FROM permission_grants p
                     JOIN groups g ON g.id = p.group_id WHERE g.org_id=?1",
                )
                .backend()?;
            let rows = stmt
                .query_map([&org_id.0], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, i64>(2)?))
                })
                .backend()?;
            for row in rows {
                let (group, slug, has) = row.backend()?;
                let Some(slug) = Slug::parse(&slug) else {
                    debug!(%slug, "ignoring unknown permission slug");
                    continue;
                };
                snap.grants.insert((GroupId::from_str(group), slug), has != 0);
            }
        }

        {
            let mut stmt = conn.prepare("SELECT body_json FROM work_items WHERE org_id=?1").backend()?;
            let rows = stmt.query_map([&org_id.0], |r| r.get::<_, String>(0)).backend()?;
            for row in rows {
                let item: WorkItem = serde_json::from_str(&row.backend()?).backend()?;
                snap.items.insert(item.item_ref(), item);
            }
        }

        Ok(snap)
    }

    fn item(&self, item: &ItemRef) -> RankResult<Option<WorkItem>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body_json FROM work_items WHERE item_kind=?1 AND id=?2",
                params![item.kind.as_str(), item.id.0],
                |r| r.get(0),
            )
            .optional()
            .backend()?;
        body.map(|b| serde_json::from_str(&b).backend()).transpose()
    }

    fn record(&self, event: &Event) -> RankResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).backend()?;
        match event {
            Event::ItemCreated { item } => upsert_item(&tx, item)?,
            Event::ItemStatusChanged { item, new, .. } => {
                let mut item = item.clone();
                item.status = *new;
                upsert_item(&tx, &item)?;
            }
            Event::ItemAssignmentChanged { item, new_assignees, .. } => {
                let mut item = item.clone();
                item.assignees = new_assignees.clone();
                upsert_item(&tx, &item)?;
            }
            Event::GroupMembershipChanged {
                org_id,
                group_id,
                user_id,
                change,
            } => {
                ensure_group(&tx, org_id, group_id)?;
                let sql = match change {
                    MembershipChange::Added => "INSERT OR IGNORE INTO group_members(group_id, user_id) VALUES (?1, ?2)",
                    MembershipChange::Removed => "DELETE FROM group_members WHERE group_id=?1 AND user_id=?2",
                };
                tx.execute(sql, params![group_id.0, user_id.0]).backend()?;
            }
            Event::PermissionGrantChanged {
                org_id,
                group_id,
                slug,
                has_permission,
            } => {
                ensure_group(&tx, org_id, group_id)?;
                tx.execute(
                    "INSERT INTO permission_grants(group_id, slug, has_permission) VALUES (?1, ?2, ?3)
                     ON CONFLICT(group_id, slug) DO UPDATE SET has_permission=excluded.has_permission",
                    params![group_id.0, slug.to_string(), *has_permission as i64],
                )
                .backend()?;
            }
        }
        tx.commit().backend()
    }
}

const JOB_COLUMNS: &str =
    "id, org_id, item_kind, scope_json, users_json, visible_at, attempts, max_attempts, idempotency_key, last_error";

struct JobRow {
    id: String,
    org_id: String,
    kind: String,
    scope_json: String,
    users_json: String,
    visible_at: i64,
    attempts: i64,
    max_attempts: i64,
    idempotency_key: String,
    last_error: Option<String>,
}

impl JobRow {
    fn read(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            org_id: r.get(1)?,
            kind: r.get(2)?,
            scope_json: r.get(3)?,
            users_json: r.get(4)?,
            visible_at: r.get(5)?,
            attempts: r.get(6)?,
            max_attempts: r.get(7)?,
            idempotency_key: r.get(8)?,
            last_error: r.get(9)?,
        })
    }

    fn into_job(self) -> RankResult<ReconcileJob> {
        let scope: JobScope = serde_json::from_str(&self.scope_json).backend()?;
        let users: Vec<UserId> = serde_json::from_str(&self.users_json).backend()?;
        Ok(ReconcileJob {
            id: JobId::from_str(self.id),
            org_id: OrgId::from_str(self.org_id),
            kind: parse_kind(&self.kind)?,
            scope,
            users,
            visible_at_unix: self.visible_at,
            attempts: self.attempts as u32,
            max_attempts: self.max_attempts as u32,
            idempotency_key: self.idempotency_key,
            last_error: self.last_error,
        })
    }
}

fn query_jobs(conn: &Connection, filter: &str) -> RankResult<Vec<ReconcileJob>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM reconcile_jobs WHERE {filter} ORDER BY seq");
    let mut stmt = conn.prepare(&sql).backend()?;
    let rows = stmt.query_map([], JobRow::read).backend()?;
    let mut out = vec![];
    for row in rows {
        out.push(row.backend()?.into_job()?);
    }
    Ok(out)
}

impl JobQueue for SqliteStorage {
    fn enqueue(&self, job: ReconcileJob) -> RankResult<bool> {
        let conn = self.lock()?;
        let waiting: i64 = conn
            .query_row(
                "SELECT COUNT(1) FROM reconcile_jobs WHERE idempotency_key=?1 AND state='pending'",
                params![job.idempotency_key],
                |r| r.get(0),
            )
            .backend()?;
        if waiting > 0 {
            return Ok(false);
        }
        let scope_json = serde_json::to_string(&job.scope).backend()?;
        let users_json = serde_json::to_string(&job.users).backend()?;
        conn.execute(
            "INSERT INTO reconcile_jobs(id, org_id, item_kind, scope_json, users_json, visible_at, attempts, max_attempts, idempotency_key, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                job.id.0,
                job.org_id.0,
                job.kind.as_str(),
                scope_json,
                users_json,
                job.visible_at_unix,
                job.attempts as i64,
                job.max_attempts as i64,
                job.idempotency_key,
                job.last_error
            ],
        )
        .backend()?;
        Ok(true)
    }

    fn try_acquire_lease(&self, worker_id: &str, now_unix: i64, ttl_secs: i64) -> RankResult<Option<ReconcileJob>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).backend()?;
        let row = tx
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM reconcile_jobs
                     WHERE (state='pending' AND visible_at <= ?1) OR (state='leased' AND lease_expires_at <= ?1)
                     ORDER BY visible_at, seq LIMIT 1"
                ),
                params![now_unix],
                JobRow::read,
            )
            .optional()
            .backend()?;
        let Some(row) = row else {
            tx.commit().backend()?;
            return Ok(None);
        };
        tx.execute(
            "UPDATE reconcile_jobs SET state='leased', leased_by=?1, lease_expires_at=?2 WHERE id=?3",
            params![worker_id, now_unix + ttl_secs, row.id],
        )
        .backend()?;
        tx.commit().backend()?;
        row.into_job().map(Some)
    }

    fn complete(&self, job_id: &JobId, worker_id: &str) -> RankResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM reconcile_jobs WHERE id=?1 AND state='leased' AND leased_by=?2",
            params![job_id.0, worker_id],
        )
        .backend()?;
        Ok(())
    }

    fn reschedule(&self, job_id: &JobId, worker_id: &str, visible_at_unix: i64, error: &str) -> RankResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE reconcile_jobs
             SET state='pending', attempts=attempts+1, visible_at=?1, last_error=?2, leased_by=NULL, lease_expires_at=NULL
             WHERE id=?3 AND state='leased' AND leased_by=?4",
            params![visible_at_unix, error, job_id.0, worker_id],
        )
        .backend()?;
        Ok(())
    }

    fn dead_letter(&self, job_id: &JobId, worker_id: &str, reason: &str) -> RankResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE reconcile_jobs
             SET state='dead', attempts=attempts+1, last_error=?1, leased_by=NULL, lease_expires_at=NULL
             WHERE id=?2 AND state='leased' AND leased_by=?3",
            params![reason, job_id.0, worker_id],
        )
        .backend()?;
        Ok(())
    }

    fn pending_jobs(&self) -> RankResult<Vec<ReconcileJob>> {
        let conn = self.lock()?;
        query_jobs(&conn, "state != 'dead'")
    }

    fn dead_jobs(&self) -> RankResult<Vec<ReconcileJob>> {
        let conn = self.lock()?;
        query_jobs(&conn, "state = 'dead'")
    }
}

pub fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use vrank_core::{ItemStatus, TaskStatus};

    fn key(user: &str) -> ListKey {
        ListKey::new(UserId::from_str(user), ItemKind::Task)
    }

    fn seed(store: &SqliteStorage, user: &str, items: &[&str]) {
        let k = key(user);
        store
            .with_list(&k, |list| {
                for id in items {
                    let rank = list.next_rank()?;
                    list.insert(RankEntry::new(&k, ItemId::from_str(*id), rank))?;
                }
                Ok(())
            })
            .unwrap();
    }

    fn ranks(store: &SqliteStorage, user: &str) -> Vec<(String, u32)> {
        store
            .entries(&key(user))
            .unwrap()
            .into_iter()
            .map(|e| (e.item_id.0, e.rank))
            .collect()
    }

    fn job(idem: &str) -> ReconcileJob {
        ReconcileJob {
            id: JobId::new(),
            org_id: OrgId::from_str("org"),
            kind: ItemKind::Task,
            scope: JobScope::Grant {
                group_id: GroupId::from_str("g"),
            },
            users: vec![UserId::from_str("a"), UserId::from_str("b")],
            visible_at_unix: now_unix(),
            attempts: 0,
            max_attempts: 3,
            idempotency_key: idem.into(),
            last_error: None,
        }
    }

    #[test]
    fn sqlite_open_and_migrate() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("vrank.db");
        let _ = SqliteStorage::open(&db_path).unwrap();
        // reopening applies the schema idempotently
        let _ = SqliteStorage::open(&db_path).unwrap();
    }

    #[test]
    fn open_reports_unusable_parent_dir() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let Err(err) = SqliteStorage::open(&blocker.join("nested").join("vrank.db")) else {
            panic!("open under a regular file must fail");
        };
        assert!(format!("{err:#}").contains("create db dir"), "{err:#}");
    }

    #[test]
    fn insert_shift_and_remove() {
        let store = SqliteStorage::open_in_memory().unwrap();
        seed(&store, "a", &["t1", "t2", "t3", "t4"]);
        let k = key("a");
        store
            .with_list(&k, |list| {
                let removed = list.remove(&ItemId::from_str("t2"))?.unwrap();
                list.shift(removed.rank + 1, None, -1)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(ranks(&store, "a"), vec![("t1".into(), 1), ("t3".into(), 2), ("t4".into(), 3)]);
        let next = store.with_list(&k, |list| list.next_rank()).unwrap();
        assert_eq!(next, 4);
    }

    #[test]
    fn duplicate_entry_maps_to_domain_error() {
        let store = SqliteStorage::open_in_memory().unwrap();
        seed(&store, "a", &["t1"]);
        let k = key("a");
        let err = store
            .with_list(&k, |list| list.insert(RankEntry::new(&k, ItemId::from_str("t1"), 9)))
            .unwrap_err();
        assert!(matches!(err, RankError::DuplicateEntry { .. }));
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let store = SqliteStorage::open_in_memory().unwrap();
        seed(&store, "a", &["t1", "t2"]);
        let k = key("a");
        let res: RankResult<()> = store.with_list(&k, |list| {
            list.shift(1, None, 1)?;
            Err(RankError::invalid_rank(&k, "abort"))
        });
        assert!(res.is_err());
        assert_eq!(ranks(&store, "a"), vec![("t1".into(), 1), ("t2".into(), 2)]);
    }

    #[test]
    fn set_rank_on_missing_item_is_invalid() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let err = store
            .with_list(&key("a"), |list| list.set_rank(&ItemId::from_str("nope"), 1))
            .unwrap_err();
        assert!(matches!(err, RankError::InvalidRank { .. }));
    }

    #[test]
    fn holders_and_list_keys() {
        let store = SqliteStorage::open_in_memory().unwrap();
        seed(&store, "a", &["x", "y"]);
        seed(&store, "b", &["x"]);
        let holders = store
            .holders(&ItemRef::new(ItemKind::Task, ItemId::from_str("x")))
            .unwrap();
        assert_eq!(holders, [UserId::from_str("a"), UserId::from_str("b")].into_iter().collect());
        assert_eq!(store.list_keys().unwrap(), vec![key("a"), key("b")]);
    }

    #[test]
    fn directory_round_trip() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let org = OrgId::from_str("org");
        let item = WorkItem {
            id: ItemId::from_str("t1"),
            org_id: org.clone(),
            status: ItemStatus::Task(TaskStatus::Todo),
            is_private: true,
            assignees: [UserId::from_str("a")].into_iter().collect(),
            groups: [GroupId::from_str("g")].into_iter().collect(),
            creator: UserId::from_str("a"),
            owner: None,
        };
        store.record(&Event::ItemCreated { item: item.clone() }).unwrap();
        store
            .record(&Event::GroupMembershipChanged {
                org_id: org.clone(),
                group_id: GroupId::from_str("g"),
                user_id: UserId::from_str("b"),
                change: MembershipChange::Added,
            })
            .unwrap();
        store
            .record(&Event::PermissionGrantChanged {
                org_id: org.clone(),
                group_id: GroupId::from_str("g"),
                slug: Slug::parse("task-view-all").unwrap(),
                has_permission: true,
            })
            .unwrap();
        store
            .record(&Event::ItemStatusChanged {
                item: item.clone(),
                old: item.status,
                new: ItemStatus::Task(TaskStatus::Archived),
            })
            .unwrap();

        let snap = store.load_org(&org).unwrap();
        assert!(snap.is_member(&UserId::from_str("b")));
        assert!(snap.has_slug(&UserId::from_str("b"), Slug::parse("task-view-all").unwrap()));
        let stored = store.item(&item.item_ref()).unwrap().unwrap();
        assert!(stored.is_terminal());
        assert!(stored.is_private);

        store
            .record(&Event::GroupMembershipChanged {
                org_id: org.clone(),
                group_id: GroupId::from_str("g"),
                user_id: UserId::from_str("b"),
                change: MembershipChange::Removed,
            })
            .unwrap();
        assert!(!store.load_org(&org).unwrap().is_member(&UserId::from_str("b")));
    }

    #[test]
    fn lease_is_exclusive() {
        let store = SqliteStorage::open_in_memory().unwrap();
        assert!(store.enqueue(job("idem")).unwrap());
        assert!(!store.enqueue(job("idem")).unwrap());

        let now = now_unix();
        let a = store.try_acquire_lease("w1", now, 60).unwrap();
        assert!(a.is_some());
        let b = store.try_acquire_lease("w2", now, 60).unwrap();
        assert!(b.is_none());
        assert_eq!(a.unwrap().users.len(), 2);
    }

    #[test]
    fn reschedule_then_dead_letter() {
        let store = SqliteStorage::open_in_memory().unwrap();
        store.enqueue(job("idem")).unwrap();
        let now = now_unix();
        let j = store.try_acquire_lease("w1", now, 60).unwrap().unwrap();
        store.reschedule(&j.id, "w1", now + 30, "busy").unwrap();
        assert!(store.try_acquire_lease("w1", now, 60).unwrap().is_none());

        let j = store.try_acquire_lease("w1", now + 30, 60).unwrap().unwrap();
        assert_eq!(j.attempts, 1);
        store.dead_letter(&j.id, "w1", "gave up").unwrap();
        assert!(store.pending_jobs().unwrap().is_empty());
        let dead = store.dead_jobs().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("gave up"));
    }

    #[test]
    fn complete_removes_job() {
        let store = SqliteStorage::open_in_memory().unwrap();
        store.enqueue(job("idem")).unwrap();
        let j = store.try_acquire_lease("w1", now_unix(), 60).unwrap().unwrap();
        store.complete(&j.id, "w2").unwrap();
        assert_eq!(store.pending_jobs().unwrap().len(), 1);
        store.complete(&j.id, "w1").unwrap();
        assert!(store.pending_jobs().unwrap().is_empty());
    }
}
