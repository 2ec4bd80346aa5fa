//! Favorite sub-ranking for task lists. Favorites always occupy the prefix
//! `1..=F` of the active ranks and there are at most `favorite_capacity` of
//! them.

use tracing::{debug, instrument};
use vrank_core::{ItemId, ItemKind, ListKey, RankEntry, RankError, RankResult, UserId};
use vrank_storage::{RankList, Storage};

use crate::listops;
use crate::Engine;

impl<S: Storage> Engine<S> {
    /// Marks or unmarks a task as a favorite. Marking moves it to rank 1;
    /// unmarking moves it just behind the remaining favorites. Setting the
    /// flag it already has is a no-op.
    #[instrument(skip_all, fields(user = %user, task = %task, flag = flag))]
    pub fn set_favorite(&self, user: &UserId, task: &ItemId, flag: bool) -> RankResult<()> {
        let key = ListKey::new(user.clone(), ItemKind::Task);
        let capacity = self.config().favorite_capacity;
        let changed = self
            .store()
            .with_list(&key, |list| toggle_favorite(list, task, flag, capacity))?;
        if changed {
            debug!("favorite updated");
        }
        Ok(())
    }

    pub fn favorites(&self, user: &UserId) -> RankResult<Vec<ItemId>> {
        let key = ListKey::new(user.clone(), ItemKind::Task);
        Ok(active_favorites(self.store().entries(&key)?)
            .into_iter()
            .map(|e| e.item_id)
            .collect())
    }
}

fn active_favorites(entries: Vec<RankEntry>) -> Vec<RankEntry> {
    entries
        .into_iter()
        .filter(|e| e.is_favorite && !e.is_pinned())
        .collect()
}

pub(crate) fn toggle_favorite(list: &mut dyn RankList, task: &ItemId, flag: bool, capacity: usize) -> RankResult<bool> {
    let key = list.key().clone();
    let entry = list
        .get(task)?
        .ok_or_else(|| RankError::invalid_rank(&key, format!("{task} is not in the list")))?;
    if entry.is_pinned() {
        return Err(RankError::invalid_rank(&key, format!("{task} is pinned")));
    }
    if entry.is_favorite == flag {
        return Ok(false);
    }
    if flag {
        if active_favorites(list.entries()?).len() >= capacity {
            return Err(RankError::CapacityExceeded {
                user_id: key.user_id,
                limit: capacity,
            });
        }
        listops::move_rank(list, entry.rank, 1)?;
    } else {
        let last = list.max_favorite_rank()?.max(entry.rank);
        listops::move_rank(list, entry.rank, last)?;
    }
    list.set_favorite(task, flag)?;
    Ok(true)
}

/// Applies the favorite policy after a task moved from `from` to `to`.
/// `max_before` is the highest favorite rank before the move. Landing inside
/// the old favorite block makes the entry a favorite; landing past it
/// clears the flag. If promotion overflows the capacity the last favorite
/// is demoted, which keeps the block contiguous.
pub(crate) fn after_task_move(
    list: &mut dyn RankList,
    moved: &RankEntry,
    to: u32,
    max_before: u32,
    capacity: usize,
) -> RankResult<()> {
    let lands_in_block = to <= max_before;
    if lands_in_block && !moved.is_favorite {
        list.set_favorite(&moved.item_id, true)?;
        let favorites = active_favorites(list.entries()?);
        if favorites.len() > capacity {
            if let Some(last) = favorites.iter().rev().find(|e| e.item_id != moved.item_id) {
                list.set_favorite(&last.item_id, false)?;
                debug!(demoted = %last.item_id, "favorite capacity reached");
            }
        }
    } else if !lands_in_block && moved.is_favorite {
        list.set_favorite(&moved.item_id, false)?;
    }
    Ok(())
}
