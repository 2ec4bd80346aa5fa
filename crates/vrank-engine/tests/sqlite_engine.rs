use std::collections::BTreeSet;
use std::sync::Arc;

use vrank_core::*;
use vrank_engine::{check_store, Config, Service, Worker};
use vrank_storage::JobQueue;

fn org() -> OrgId {
    OrgId::from_str("acme")
}

fn join(group: &str, user: &str) -> Event {
    Event::GroupMembershipChanged {
        org_id: org(),
        group_id: GroupId::from_str(group),
        user_id: UserId::from_str(user),
        change: MembershipChange::Added,
    }
}

fn grant(group: &str, slug: &str) -> Event {
    Event::PermissionGrantChanged {
        org_id: org(),
        group_id: GroupId::from_str(group),
        slug: Slug::parse(slug).unwrap(),
        has_permission: true,
    }
}

fn task(id: &str, creator: &str) -> WorkItem {
    WorkItem {
        id: ItemId::from_str(id),
        org_id: org(),
        status: ItemStatus::Task(TaskStatus::Todo),
        is_private: false,
        assignees: BTreeSet::new(),
        groups: BTreeSet::new(),
        creator: UserId::from_str(creator),
        owner: None,
    }
}

fn ids(entries: &[RankEntry]) -> Vec<&str> {
    entries.iter().filter(|e| !e.is_pinned()).map(|e| e.item_id.as_str()).collect()
}

#[test]
fn init_writes_config_and_database() {
    let dir = tempfile::tempdir().unwrap();
    Service::init(dir.path()).unwrap();
    assert!(Config::config_path(dir.path()).exists());
    assert!(dir.path().join("vrank.db").exists());

    // idempotent
    Service::init(dir.path()).unwrap();
}

#[test]
fn init_surfaces_data_dir_errors() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"file").unwrap();
    let err = Service::init(&blocker.join("data")).unwrap_err();
    assert!(format!("{err:#}").contains("create data dir"), "{err:#}");
}

#[test]
fn end_to_end_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let svc = Service::open(dir.path().to_path_buf()).unwrap();
    let engine = &svc.engine;
    let m = UserId::from_str("m");

    engine.apply(&join("managers", "m")).unwrap();
    let out = engine.apply(&grant("managers", "task-view-all")).unwrap();
    assert_eq!(out.jobs_enqueued, 1);
    for t in ["t1", "t2", "t3"] {
        engine.apply(&Event::ItemCreated { item: task(t, "a") }).unwrap();
    }
    let worker = Worker::new(Arc::clone(engine), "it");
    assert_eq!(worker.drain().unwrap(), 1);
    assert!(engine.store().pending_jobs().unwrap().is_empty());

    let entries = engine.entries(&m, ItemKind::Task).unwrap();
    assert_eq!(ids(&entries), vec!["t1", "t2", "t3"]);

    engine.move_rank(&m, ItemKind::Task, 3, 1).unwrap();
    engine.set_favorite(&m, &ItemId::from_str("t2"), true).unwrap();
    let entries = engine.entries(&m, ItemKind::Task).unwrap();
    assert_eq!(ids(&entries), vec!["t2", "t3", "t1"]);
    assert!(entries[0].is_favorite);

    let item = task("t3", "a");
    engine
        .apply(&Event::ItemStatusChanged {
            old: item.status,
            new: ItemStatus::Task(TaskStatus::Completed),
            item,
        })
        .unwrap();
    let entries = engine.entries(&m, ItemKind::Task).unwrap();
    assert_eq!(ids(&entries), vec!["t2", "t1"]);
    assert_eq!(entries.last().map(|e| e.rank), Some(0));

    let err = engine.move_rank(&m, ItemKind::Task, 1, 3).unwrap_err();
    assert!(matches!(err, RankError::InvalidRank { .. }));

    assert!(check_store(&**engine.store(), svc.cfg.ranking.favorite_capacity)
        .unwrap()
        .is_empty());
}

#[test]
fn reopen_keeps_lists() {
    let dir = tempfile::tempdir().unwrap();
    {
        let svc = Service::open(dir.path().to_path_buf()).unwrap();
        svc.engine.apply(&join("everyone", "a")).unwrap();
        svc.engine.apply(&grant("everyone", "task-view")).unwrap();
        svc.engine.apply(&Event::ItemCreated { item: task("t1", "a") }).unwrap();
    }
    let svc = Service::open(dir.path().to_path_buf()).unwrap();
    let entries = svc.engine.entries(&UserId::from_str("a"), ItemKind::Task).unwrap();
    assert_eq!(ids(&entries), vec!["t1"]);
    assert_eq!(svc.engine.store().pending_jobs().unwrap().len(), 1);
}
