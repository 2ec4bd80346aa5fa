//! Reconciler: brings stored entries in line with current eligibility.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, info, instrument};
use vrank_core::{
    covered, covered_users, GroupId, ItemId, ItemKind, ItemRef, JobScope, ListKey, OrgId, OrgSnapshot, RankError,
    RankResult, ReconcileJob, Slug, Trigger, UserId, WorkItem,
};
use vrank_queue::{plan_batches, BatchPlan};
use vrank_storage::Storage;

use crate::listops::{self, StatusSync};
use crate::util::now_unix;
use crate::Engine;

/// Counts of what one reconciliation changed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub added: usize,
    pub removed: usize,
    pub pinned: usize,
    pub unpinned: usize,
    /// Set when a persistent race made the pass give up.
    pub skipped: bool,
}

impl ReconcileReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.pinned == 0 && self.unpinned == 0
    }

    pub fn merge(&mut self, other: &ReconcileReport) {
        self.added += other.added;
        self.removed += other.removed;
        self.pinned += other.pinned;
        self.unpinned += other.unpinned;
        self.skipped |= other.skipped;
    }

    pub(crate) fn record(&mut self, sync: StatusSync) {
        match sync {
            StatusSync::Pinned => self.pinned += 1,
            StatusSync::Unpinned => self.unpinned += 1,
            StatusSync::Unchanged => {}
        }
    }
}

/// Result of a membership change: the synchronous part plus queued batches.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MembershipOutcome {
    pub report: ReconcileReport,
    pub jobs_enqueued: usize,
}

impl<S: Storage> Engine<S> {
    /// Reconciles every user's entry for one item after a status or
    /// assignment change. Removals run before additions.
    #[instrument(skip_all, fields(item = %item, %trigger))]
    pub fn reconcile(&self, item: &ItemRef, trigger: Trigger) -> RankResult<ReconcileReport> {
        let report = self.retry_race_once("reconcile", || self.reconcile_item_once(item), ReconcileReport::skipped)?;
        if !report.is_noop() {
            info!(
                added = report.added,
                removed = report.removed,
                pinned = report.pinned,
                unpinned = report.unpinned,
                "item reconciled"
            );
        }
        Ok(report)
    }

    fn reconcile_item_once(&self, item_ref: &ItemRef) -> RankResult<ReconcileReport> {
        let (snapshot, item) = self.fresh_item(item_ref)?;
        let desired = covered_users(&snapshot, &item);
        let existing = self.store().holders(item_ref)?;

        let mut report = ReconcileReport::default();
        for user in existing.difference(&desired) {
            report.merge(&self.revoke(user, &item)?);
        }
        for user in desired.difference(&existing) {
            report.merge(&self.grant(user, &item)?);
        }
        for user in desired.intersection(&existing) {
            report.merge(&self.sync(user, &item)?);
        }
        Ok(report)
    }

    /// Reads the item and its organisation in one go. A vanished item is a
    /// race: whoever deleted it will trigger the cleanup.
    pub(crate) fn fresh_item(&self, item_ref: &ItemRef) -> RankResult<(OrgSnapshot, WorkItem)> {
        let Some(found) = self.store().item(item_ref)? else {
            return Err(RankError::race(item_ref, "item no longer exists"));
        };
        let snapshot = self.store().load_org(&found.org_id)?;
        let item = snapshot
            .item(item_ref)
            .cloned()
            .ok_or_else(|| RankError::race(item_ref, "item left its organisation"))?;
        Ok((snapshot, item))
    }

    fn revoke(&self, user: &UserId, item: &WorkItem) -> RankResult<ReconcileReport> {
        let key = ListKey::new(user.clone(), item.kind());
        self.store().with_list(&key, |list| match listops::remove_and_compact(list, &item.id)? {
            Some(_) => Ok(ReconcileReport {
                removed: 1,
                ..Default::default()
            }),
            None => Err(RankError::race(&item.item_ref(), format!("entry for {user} vanished"))),
        })
    }

    fn grant(&self, user: &UserId, item: &WorkItem) -> RankResult<ReconcileReport> {
        let key = ListKey::new(user.clone(), item.kind());
        self.store().with_list(&key, |list| {
            if list.get(&item.id)?.is_some() {
                return Err(RankError::race(&item.item_ref(), format!("entry for {user} appeared")));
            }
            listops::append(list, &item.id, item.is_terminal())?;
            Ok(ReconcileReport {
                added: 1,
                ..Default::default()
            })
        })
    }

    fn sync(&self, user: &UserId, item: &WorkItem) -> RankResult<ReconcileReport> {
        let key = ListKey::new(user.clone(), item.kind());
        self.store().with_list(&key, |list| {
            let Some(entry) = list.get(&item.id)? else {
                return Err(RankError::race(&item.item_ref(), format!("entry for {user} vanished")));
            };
            let mut report = ReconcileReport::default();
            report.record(listops::sync_status(list, &entry, item.is_terminal())?);
            Ok(report)
        })
    }

    /// Re-derives one user's list for `kind` against `snapshot`. With `only`
    /// set, items outside it are left alone; otherwise every item of the kind
    /// in the organisation is in scope. Runs as a single list transaction.
    pub fn reconcile_user(
        &self,
        snapshot: &OrgSnapshot,
        user: &UserId,
        kind: ItemKind,
        only: Option<&BTreeSet<ItemId>>,
    ) -> RankResult<ReconcileReport> {
        let in_scope: Vec<&WorkItem> = snapshot
            .items_of_kind(kind)
            .filter(|i| only.map_or(true, |ids| ids.contains(&i.id)))
            .collect();
        let scoped: BTreeSet<&ItemId> = in_scope.iter().map(|i| &i.id).collect();
        let desired: BTreeMap<&ItemId, &WorkItem> = in_scope
            .iter()
            .filter(|i| covered(snapshot, user, i))
            .map(|i| (&i.id, *i))
            .collect();

        let key = ListKey::new(user.clone(), kind);
        self.store().with_list(&key, |list| {
            let mut report = ReconcileReport::default();
            let stale: Vec<ItemId> = list
                .entries()?
                .into_iter()
                .map(|e| e.item_id)
                .filter(|id| scoped.contains(id) && !desired.contains_key(id))
                .collect();
            for id in &stale {
                if listops::remove_and_compact(list, id)?.is_some() {
                    report.removed += 1;
                }
            }
            for (id, item) in &desired {
                match list.get(id)? {
                    None => {
                        listops::append(list, id, item.is_terminal())?;
                        report.added += 1;
                    }
                    Some(entry) => report.record(listops::sync_status(list, &entry, item.is_terminal())?),
                }
            }
            Ok(report)
        })
    }

    /// A user joined or left a group. Items tied to the group through
    /// assignment are reconciled for that user right away; kinds the group
    /// holds grants for (or oversized item sets) become queued jobs.
    #[instrument(skip_all, fields(org = %org_id, group = %group_id, user = %user_id))]
    pub fn on_membership_changed(
        &self,
        org_id: &OrgId,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> RankResult<MembershipOutcome> {
        let snapshot = self.store().load_org(org_id)?;
        let granted = snapshot.granted_kinds(group_id);
        let scope = JobScope::Membership {
            group_id: group_id.clone(),
        };

        let mut outcome = MembershipOutcome::default();
        for kind in ItemKind::ALL {
            let assigned: BTreeSet<ItemId> = snapshot
                .items_assigned_to_group(group_id)
                .filter(|i| i.kind() == kind)
                .map(|i| i.id.clone())
                .collect();
            if granted.contains(&kind) || assigned.len() > self.config().membership_sync_limit {
                outcome.jobs_enqueued += self.enqueue_batches(org_id, kind, scope.clone(), vec![user_id.clone()])?;
                continue;
            }
            if assigned.is_empty() {
                continue;
            }
            outcome
                .report
                .merge(&self.reconcile_user(&snapshot, user_id, kind, Some(&assigned))?);
        }
        debug!(?outcome, "membership change handled");
        Ok(outcome)
    }

    /// A grant was toggled. Every member of the group may gain or lose items
    /// of the slug's kind, so the work is split into queued batches.
    #[instrument(skip_all, fields(org = %org_id, group = %group_id, %slug))]
    pub fn on_grant_changed(&self, org_id: &OrgId, group_id: &GroupId, slug: Slug) -> RankResult<usize> {
        let snapshot = self.store().load_org(org_id)?;
        let members: Vec<UserId> = snapshot
            .groups
            .get(group_id)
            .map(|g| g.members.iter().cloned().collect())
            .unwrap_or_default();
        let scope = JobScope::Grant {
            group_id: group_id.clone(),
        };
        let jobs = self.enqueue_batches(org_id, slug.kind, scope, members)?;
        info!(jobs, "grant change queued");
        Ok(jobs)
    }

    fn enqueue_batches(&self, org_id: &OrgId, kind: ItemKind, scope: JobScope, users: Vec<UserId>) -> RankResult<usize> {
        let plan = BatchPlan {
            org_id: org_id.clone(),
            kind,
            scope,
            batch_size: self.config().batch_size,
            max_attempts: self.config().max_attempts,
            now_unix: now_unix(),
        };
        let mut enqueued = 0;
        for job in plan_batches(&plan, users) {
            if self.store().enqueue(job)? {
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    /// Executes one queued batch: each user's list for the job's kind is
    /// re-derived from a fresh snapshot, one list transaction per user.
    pub fn run_job(&self, job: &ReconcileJob) -> RankResult<ReconcileReport> {
        let snapshot = self.store().load_org(&job.org_id)?;
        let mut report = ReconcileReport::default();
        for user in &job.users {
            report.merge(&self.reconcile_user(&snapshot, user, job.kind, None)?);
        }
        debug!(job = %job.id, scope = job.scope.label(), users = job.users.len(), ?report, "job applied");
        Ok(report)
    }
}
