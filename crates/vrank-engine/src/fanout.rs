//! Fan-out writer: one rank entry per covered user when an item is created.

use tracing::{debug, error, info, instrument, warn};
use vrank_core::{covered_users, ItemRef, ListKey, RankError, RankResult};
use vrank_storage::Storage;

use crate::listops;
use crate::reconcile::ReconcileReport;
use crate::Engine;

impl<S: Storage> Engine<S> {
    /// Appends the new item to the tail of every covered user's list, or to
    /// the pinned bucket if it was created in a terminal status.
    ///
    /// A user who already holds the entry (a background pass got there
    /// first) is only brought in line with the item's status. A failure on
    /// one user's list does not stop the others; the first error is
    /// returned once every user has been visited.
    #[instrument(skip_all, fields(item = %item))]
    pub fn on_create(&self, item: &ItemRef) -> RankResult<ReconcileReport> {
        let report = self.retry_race_once("fan-out", || self.fan_out_once(item), ReconcileReport::skipped)?;
        info!(users = report.added, "item fanned out");
        Ok(report)
    }

    fn fan_out_once(&self, item_ref: &ItemRef) -> RankResult<ReconcileReport> {
        let (snapshot, item) = self.fresh_item(item_ref)?;
        let mut report = ReconcileReport::default();
        let mut first_err = None;
        for user in covered_users(&snapshot, &item) {
            let key = ListKey::new(user, item.kind());
            let res = self.store().with_list(&key, |list| match list.get(&item.id)? {
                None => listops::append(list, &item.id, item.is_terminal()).map(|_| None),
                Some(entry) => listops::sync_status(list, &entry, item.is_terminal()).map(Some),
            });
            match res {
                Ok(None) => report.added += 1,
                Ok(Some(sync)) => {
                    debug!(list = %key, "entry already present");
                    report.record(sync);
                }
                Err(err) => {
                    if matches!(err, RankError::DuplicateEntry { .. }) {
                        error!(list = %key, "{err}");
                    } else {
                        warn!(list = %key, "fan-out failed: {err}");
                    }
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}
