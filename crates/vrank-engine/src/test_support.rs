//! Shared fixtures for the engine's unit tests.

use std::collections::BTreeSet;
use std::sync::Arc;

use vrank_core::*;
use vrank_storage::{Directory, InMemoryStorage, Storage};

use crate::reconcile::MembershipOutcome;
use crate::{Engine, EngineConfig};

pub fn uid(s: &str) -> UserId {
    UserId::from_str(s)
}

pub fn gid(s: &str) -> GroupId {
    GroupId::from_str(s)
}

pub fn oid() -> OrgId {
    OrgId::from_str("org")
}

pub fn slug(s: &str) -> Slug {
    Slug::parse(s).unwrap()
}

pub fn item_ref(task_id: &str) -> ItemRef {
    ItemRef::new(ItemKind::Task, ItemId::from_str(task_id))
}

pub fn group(id: &str, members: &[&str]) -> Group {
    Group {
        id: gid(id),
        org_id: oid(),
        members: members.iter().map(|m| uid(m)).collect(),
    }
}

pub fn task(id: &str, creator: &str) -> WorkItem {
    WorkItem {
        id: ItemId::from_str(id),
        org_id: oid(),
        status: ItemStatus::Task(TaskStatus::Todo),
        is_private: false,
        assignees: BTreeSet::new(),
        groups: BTreeSet::new(),
        creator: uid(creator),
        owner: None,
    }
}

pub fn project(id: &str, creator: &str) -> WorkItem {
    WorkItem {
        status: ItemStatus::Project(ProjectStatus::InProgress),
        ..task(id, creator)
    }
}

pub fn assigned(mut item: WorkItem, users: &[&str]) -> WorkItem {
    item.assignees.extend(users.iter().map(|u| uid(u)));
    item
}

/// Records groups and grants straight into the directory, without
/// triggering any reconciliation. Starts from `everyone = {a, b}` and
/// `managers = {m}`.
pub fn seed_org<S: Storage>(engine: &Engine<S>, f: impl FnOnce(OrgSnapshot) -> OrgSnapshot) {
    let snap = f(OrgSnapshot::new(oid())
        .with_group(group("everyone", &["a", "b"]))
        .with_group(group("managers", &["m"])));
    for g in snap.groups.values() {
        for member in &g.members {
            engine
                .store()
                .record(&Event::GroupMembershipChanged {
                    org_id: oid(),
                    group_id: g.id.clone(),
                    user_id: member.clone(),
                    change: MembershipChange::Added,
                })
                .unwrap();
        }
    }
    for ((group_id, slug), has) in &snap.grants {
        engine
            .store()
            .record(&Event::PermissionGrantChanged {
                org_id: oid(),
                group_id: group_id.clone(),
                slug: *slug,
                has_permission: *has,
            })
            .unwrap();
    }
}

pub fn engine_with(f: impl FnOnce(OrgSnapshot) -> OrgSnapshot) -> Engine<InMemoryStorage> {
    let engine = Engine::new(Arc::new(InMemoryStorage::new()), EngineConfig::default());
    seed_org(&engine, f);
    engine
}

/// `managers` holds task-view-all.
pub fn engine_with_view_all() -> Engine<InMemoryStorage> {
    engine_with(|s| s.with_grant(gid("managers"), slug("task-view-all"), true))
}

pub fn emit<S: Storage>(engine: &Engine<S>, event: Event) {
    engine.apply(&event).unwrap();
}

pub fn create<S: Storage>(engine: &Engine<S>, item: WorkItem) {
    emit(engine, Event::ItemCreated { item });
}

pub fn set_status<S: Storage>(engine: &Engine<S>, task_id: &str, status: TaskStatus) {
    let item = engine.store().item(&item_ref(task_id)).unwrap().unwrap();
    let old = item.status;
    emit(
        engine,
        Event::ItemStatusChanged {
            item,
            old,
            new: ItemStatus::Task(status),
        },
    );
}

pub fn membership<S: Storage>(engine: &Engine<S>, group_id: &str, user: &str, change: MembershipChange) -> MembershipOutcome {
    let event = Event::GroupMembershipChanged {
        org_id: oid(),
        group_id: gid(group_id),
        user_id: uid(user),
        change,
    };
    engine.store().record(&event).unwrap();
    engine.on_membership_changed(&oid(), &gid(group_id), &uid(user)).unwrap()
}

/// Records the grant and returns how many jobs were queued.
pub fn grant<S: Storage>(engine: &Engine<S>, group_id: &str, s: &str, has_permission: bool) -> usize {
    let dispatch = engine
        .apply(&Event::PermissionGrantChanged {
            org_id: oid(),
            group_id: gid(group_id),
            slug: slug(s),
            has_permission,
        })
        .unwrap();
    dispatch.jobs_enqueued
}

/// Active item ids in rank order.
pub fn ids<S: Storage>(engine: &Engine<S>, user: &str, kind: ItemKind) -> Vec<String> {
    engine
        .ranked_list(&uid(user), kind, false)
        .unwrap()
        .into_iter()
        .map(|i| i.0)
        .collect()
}

pub fn ranks<S: Storage>(engine: &Engine<S>, user: &str, kind: ItemKind) -> Vec<(String, u32)> {
    engine
        .entries(&uid(user), kind)
        .unwrap()
        .into_iter()
        .filter(|e| !e.is_pinned())
        .map(|e| (e.item_id.0, e.rank))
        .collect()
}

pub fn pinned<S: Storage>(engine: &Engine<S>, user: &str, kind: ItemKind) -> Vec<String> {
    engine
        .entries(&uid(user), kind)
        .unwrap()
        .into_iter()
        .filter(|e| e.is_pinned())
        .map(|e| e.item_id.0)
        .collect()
}
