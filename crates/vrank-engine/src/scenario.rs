//! YAML scenario replays. A scenario is a list of steps run against a fresh
//! in-memory engine; store invariants are checked after every step.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use vrank_core::{
    Event, GroupId, ItemId, ItemKind, ItemRef, ItemStatus, MembershipChange, OrgId, RankResult, Slug, UserId,
    WorkItem,
};
use vrank_storage::{Directory, InMemoryStorage};

use crate::invariants::{check_store, Violation};
use crate::worker::Worker;
use crate::{Engine, EngineConfig};

#[derive(Debug, Deserialize)]
pub struct Scenario {
    pub scenario_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_org")]
    pub org: OrgId,
    #[serde(default)]
    pub config: ScenarioConfig,
    pub steps: Vec<Step>,
}

fn default_org() -> OrgId {
    OrgId::from_str("org")
}

#[derive(Debug, Default, Deserialize)]
pub struct ScenarioConfig {
    pub favorite_capacity: Option<usize>,
    pub batch_size: Option<usize>,
    pub membership_sync_limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Join {
        group: GroupId,
        user: UserId,
    },
    Leave {
        group: GroupId,
        user: UserId,
    },
    Grant {
        group: GroupId,
        slug: Slug,
    },
    Revoke {
        group: GroupId,
        slug: Slug,
    },
    Create {
        kind: ItemKind,
        id: ItemId,
        creator: UserId,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        private: bool,
        #[serde(default)]
        assignees: BTreeSet<UserId>,
        #[serde(default)]
        groups: BTreeSet<GroupId>,
        #[serde(default)]
        owner: Option<UserId>,
    },
    Status {
        kind: ItemKind,
        id: ItemId,
        to: String,
    },
    Assign {
        kind: ItemKind,
        id: ItemId,
        #[serde(default)]
        assignees: BTreeSet<UserId>,
    },
    /// A raw event, for anything the shorthands above do not cover.
    Emit {
        event: Event,
    },
    Drain,
    Move {
        user: UserId,
        kind: ItemKind,
        from: u32,
        to: u32,
        #[serde(default)]
        expect_error: Option<String>,
    },
    MoveItem {
        user: UserId,
        kind: ItemKind,
        item: ItemId,
        target: ItemId,
        #[serde(default)]
        expect_error: Option<String>,
    },
    Favorite {
        user: UserId,
        task: ItemId,
        flag: bool,
        #[serde(default)]
        expect_error: Option<String>,
    },
    Expect {
        user: UserId,
        kind: ItemKind,
        /// Active items in rank order.
        #[serde(default)]
        ranked: Option<Vec<ItemId>>,
        /// Stored pinned items, regardless of visibility.
        #[serde(default)]
        pinned: Option<Vec<ItemId>>,
        /// What `ranked_list(include_pinned = true)` returns.
        #[serde(default)]
        visible: Option<Vec<ItemId>>,
        #[serde(default)]
        favorites: Option<Vec<ItemId>>,
    },
}

#[derive(Debug, Default)]
pub struct ScenarioResult {
    pub scenario_id: String,
    pub steps_run: usize,
    /// Expectation mismatches, prefixed with the step number.
    pub failures: Vec<String>,
    pub violations: Vec<(usize, Violation)>,
}

impl ScenarioResult {
    pub fn passed(&self) -> bool {
        self.failures.is_empty() && self.violations.is_empty()
    }
}

pub fn load_scenario(path: &Path) -> Result<Scenario> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read scenario: {}", path.display()))?;
    let scenario: Scenario = serde_yaml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
    Ok(scenario)
}

pub fn simulate(path: &Path) -> Result<ScenarioResult> {
    run_scenario(&load_scenario(path)?)
}

pub fn run_scenario(scenario: &Scenario) -> Result<ScenarioResult> {
    let mut cfg = EngineConfig::default();
    if let Some(v) = scenario.config.favorite_capacity {
        cfg.favorite_capacity = v;
    }
    if let Some(v) = scenario.config.batch_size {
        cfg.batch_size = v;
    }
    if let Some(v) = scenario.config.membership_sync_limit {
        cfg.membership_sync_limit = v;
    }
    let capacity = cfg.favorite_capacity;
    let engine = Arc::new(Engine::new(Arc::new(InMemoryStorage::new()), cfg));
    let worker = Worker::new(Arc::clone(&engine), "scenario");

    let mut result = ScenarioResult {
        scenario_id: scenario.scenario_id.clone(),
        ..Default::default()
    };
    for (i, step) in scenario.steps.iter().enumerate() {
        let n = i + 1;
        run_step(&engine, &worker, &scenario.org, step, n, &mut result.failures)
            .with_context(|| format!("{} step {n}", scenario.scenario_id))?;
        for v in check_store(&**engine.store(), capacity)? {
            result.violations.push((n, v));
        }
        result.steps_run = n;
    }
    Ok(result)
}

fn run_step(
    engine: &Engine<InMemoryStorage>,
    worker: &Worker<InMemoryStorage>,
    org: &OrgId,
    step: &Step,
    n: usize,
    failures: &mut Vec<String>,
) -> Result<()> {
    match step {
        Step::Join { group, user } | Step::Leave { group, user } => {
            let change = if matches!(step, Step::Join { .. }) {
                MembershipChange::Added
            } else {
                MembershipChange::Removed
            };
            engine.apply(&Event::GroupMembershipChanged {
                org_id: org.clone(),
                group_id: group.clone(),
                user_id: user.clone(),
                change,
            })?;
        }
        Step::Grant { group, slug } | Step::Revoke { group, slug } => {
            engine.apply(&Event::PermissionGrantChanged {
                org_id: org.clone(),
                group_id: group.clone(),
                slug: *slug,
                has_permission: matches!(step, Step::Grant { .. }),
            })?;
        }
        Step::Create {
            kind,
            id,
            creator,
            status,
            private,
            assignees,
            groups,
            owner,
        } => {
            let status = parse_status(*kind, status.as_deref().unwrap_or(initial_status(*kind)))?;
            let item = WorkItem {
                id: id.clone(),
                org_id: org.clone(),
                status,
                is_private: *private,
                assignees: assignees.clone(),
                groups: groups.clone(),
                creator: creator.clone(),
                owner: owner.clone(),
            };
            engine.apply(&Event::ItemCreated { item })?;
        }
        Step::Status { kind, id, to } => {
            let item = current(engine, *kind, id)?;
            let new = parse_status(*kind, to)?;
            engine.apply(&Event::ItemStatusChanged {
                old: item.status,
                new,
                item,
            })?;
        }
        Step::Assign { kind, id, assignees } => {
            let item = current(engine, *kind, id)?;
            engine.apply(&Event::ItemAssignmentChanged {
                old_assignees: item.assignees.clone(),
                new_assignees: assignees.clone(),
                item,
            })?;
        }
        Step::Emit { event } => {
            engine.apply(event)?;
        }
        Step::Drain => {
            worker.drain()?;
        }
        Step::Move {
            user,
            kind,
            from,
            to,
            expect_error,
        } => {
            let res = engine.move_rank(user, *kind, *from, *to).map(|_| ());
            check_outcome(n, res, expect_error.as_deref(), failures)?;
        }
        Step::MoveItem {
            user,
            kind,
            item,
            target,
            expect_error,
        } => {
            let res = engine.move_item(user, *kind, item, target).map(|_| ());
            check_outcome(n, res, expect_error.as_deref(), failures)?;
        }
        Step::Favorite {
            user,
            task,
            flag,
            expect_error,
        } => {
            let res = engine.set_favorite(user, task, *flag);
            check_outcome(n, res, expect_error.as_deref(), failures)?;
        }
        Step::Expect {
            user,
            kind,
            ranked,
            pinned,
            visible,
            favorites,
        } => {
            let entries = engine.entries(user, *kind)?;
            let what = format!("step {n} {user}/{kind}");
            if let Some(want) = ranked {
                let got: Vec<ItemId> = entries.iter().filter(|e| !e.is_pinned()).map(|e| e.item_id.clone()).collect();
                compare(&what, "ranked", want, &got, failures);
            }
            if let Some(want) = pinned {
                let got: Vec<ItemId> = entries.iter().filter(|e| e.is_pinned()).map(|e| e.item_id.clone()).collect();
                compare(&what, "pinned", want, &got, failures);
            }
            if let Some(want) = visible {
                let got = engine.ranked_list(user, *kind, true)?;
                compare(&what, "visible", want, &got, failures);
            }
            if let Some(want) = favorites {
                let got: Vec<ItemId> = entries
                    .iter()
                    .filter(|e| e.is_favorite && !e.is_pinned())
                    .map(|e| e.item_id.clone())
                    .collect();
                compare(&what, "favorites", want, &got, failures);
            }
        }
    }
    Ok(())
}

fn initial_status(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::Task => "todo",
        ItemKind::Project => "not_started",
        ItemKind::Workflow => "draft",
    }
}

fn parse_status(kind: ItemKind, status: &str) -> Result<ItemStatus> {
    serde_yaml::from_str(&format!("kind: {kind}\nstatus: {status}"))
        .with_context(|| format!("unknown {kind} status {status:?}"))
}

fn current(engine: &Engine<InMemoryStorage>, kind: ItemKind, id: &ItemId) -> Result<WorkItem> {
    engine
        .store()
        .item(&ItemRef::new(kind, id.clone()))?
        .ok_or_else(|| anyhow!("no {kind} {id} in the directory"))
}

/// Expected errors are recorded as failures when they do not match; any
/// other unexpected error aborts the replay.
fn check_outcome(n: usize, res: RankResult<()>, expect: Option<&str>, failures: &mut Vec<String>) -> Result<()> {
    match (res, expect) {
        (Ok(()), None) => {}
        (Ok(()), Some(code)) => failures.push(format!("step {n}: expected {code}, got success")),
        (Err(err), Some(code)) if err.code() == code => {}
        (Err(err), Some(code)) => failures.push(format!("step {n}: expected {code}, got {}", err.code())),
        (Err(err), None) => return Err(err.into()),
    }
    Ok(())
}

fn compare(what: &str, field: &str, want: &[ItemId], got: &[ItemId], failures: &mut Vec<String>) {
    if want != got {
        let show = |v: &[ItemId]| v.iter().map(|i| i.as_str()).collect::<Vec<_>>().join(", ");
        failures.push(format!("{what} {field}: expected [{}], got [{}]", show(want), show(got)));
    }
}
