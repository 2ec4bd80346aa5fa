use serde::Serialize;
use tracing::debug;
use vrank_core::{Event, RankResult, Trigger};
use vrank_storage::Storage;

use crate::reconcile::ReconcileReport;
use crate::Engine;

/// What handling one event did: synchronous changes plus queued batches.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Dispatch {
    pub report: ReconcileReport,
    pub jobs_enqueued: usize,
}

impl<S: Storage> Engine<S> {
    /// Routes an event that the request layer has already persisted.
    pub fn handle(&self, event: &Event) -> RankResult<Dispatch> {
        let out = match event {
            Event::ItemCreated { item } => Dispatch {
                report: self.on_create(&item.item_ref())?,
                jobs_enqueued: 0,
            },
            Event::ItemStatusChanged { item, old, new } => {
                debug!(item = %item.id, ?old, ?new, "status change");
                Dispatch {
                    report: self.reconcile(&item.item_ref(), Trigger::StatusChanged)?,
                    jobs_enqueued: 0,
                }
            }
            Event::ItemAssignmentChanged { item, .. } => Dispatch {
                report: self.reconcile(&item.item_ref(), Trigger::AssignmentChanged)?,
                jobs_enqueued: 0,
            },
            Event::GroupMembershipChanged {
                org_id,
                group_id,
                user_id,
                ..
            } => {
                let out = self.on_membership_changed(org_id, group_id, user_id)?;
                Dispatch {
                    report: out.report,
                    jobs_enqueued: out.jobs_enqueued,
                }
            }
            Event::PermissionGrantChanged {
                org_id, group_id, slug, ..
            } => Dispatch {
                report: ReconcileReport::default(),
                jobs_enqueued: self.on_grant_changed(org_id, group_id, *slug)?,
            },
        };
        Ok(out)
    }

    /// Persists the event into the directory, then handles it. For hosts
    /// where the engine's backend also stores the authorization facts, such
    /// as replays and the CLI.
    pub fn apply(&self, event: &Event) -> RankResult<Dispatch> {
        self.store().record(event)?;
        self.handle(event)
    }
}
