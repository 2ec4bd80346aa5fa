//! Rank algorithms over a single open list. Every function here runs inside
//! one [`RankList`] transaction and keeps active ranks dense.

use vrank_core::{ItemId, RankEntry, RankError, RankResult};
use vrank_storage::RankList;

/// What a status sync did to an existing entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusSync {
    Unchanged,
    Pinned,
    Unpinned,
}

/// Adds the item at the tail, or straight into the pinned bucket when the
/// item is already terminal.
pub fn append(list: &mut dyn RankList, item_id: &ItemId, terminal: bool) -> RankResult<RankEntry> {
    let rank = if terminal { 0 } else { list.next_rank()? };
    let entry = RankEntry::new(list.key(), item_id.clone(), rank);
    list.insert(entry.clone())?;
    Ok(entry)
}

/// Deletes the entry and closes the gap it leaves behind.
pub fn remove_and_compact(list: &mut dyn RankList, item_id: &ItemId) -> RankResult<Option<RankEntry>> {
    let Some(removed) = list.remove(item_id)? else {
        return Ok(None);
    };
    if !removed.is_pinned() {
        list.shift(removed.rank + 1, None, -1)?;
    }
    Ok(Some(removed))
}

/// Moves an active entry into the pinned bucket. Pinned entries are never
/// favorites.
pub fn pin(list: &mut dyn RankList, entry: &RankEntry) -> RankResult<()> {
    if entry.is_pinned() {
        return Ok(());
    }
    list.set_rank(&entry.item_id, 0)?;
    if entry.is_favorite {
        list.set_favorite(&entry.item_id, false)?;
    }
    list.shift(entry.rank + 1, None, -1)?;
    Ok(())
}

/// Brings a pinned entry back at the tail.
pub fn unpin(list: &mut dyn RankList, entry: &RankEntry) -> RankResult<()> {
    if !entry.is_pinned() {
        return Ok(());
    }
    let tail = list.next_rank()?;
    list.set_rank(&entry.item_id, tail)
}

/// Puts the entry in the bucket that matches the item's terminal flag.
pub fn sync_status(list: &mut dyn RankList, entry: &RankEntry, terminal: bool) -> RankResult<StatusSync> {
    match (terminal, entry.is_pinned()) {
        (true, false) => {
            pin(list, entry)?;
            Ok(StatusSync::Pinned)
        }
        (false, true) => {
            unpin(list, entry)?;
            Ok(StatusSync::Unpinned)
        }
        _ => Ok(StatusSync::Unchanged),
    }
}

/// Moves the entry at `from` to `to`, shifting the entries in between by one.
/// Both ranks must be occupied active ranks. Returns the moved entry with its
/// new rank.
pub fn move_rank(list: &mut dyn RankList, from: u32, to: u32) -> RankResult<RankEntry> {
    let key = list.key().clone();
    if from == 0 || to == 0 {
        return Err(RankError::invalid_rank(&key, "rank 0 is the pinned bucket"));
    }
    let moved = list
        .at_rank(from)?
        .ok_or_else(|| RankError::invalid_rank(&key, format!("no entry at rank {from}")))?;
    if list.at_rank(to)?.is_none() {
        return Err(RankError::invalid_rank(&key, format!("no entry at rank {to}")));
    }
    if from == to {
        return Ok(moved);
    }
    if to < from {
        list.shift(to, Some(from - 1), 1)?;
    } else {
        list.shift(from + 1, Some(to), -1)?;
    }
    list.set_rank(&moved.item_id, to)?;
    Ok(RankEntry { rank: to, ..moved })
}

/// Active rank of an item, failing with `InvalidRank` when it is absent or pinned.
pub fn active_rank(list: &dyn RankList, item_id: &ItemId) -> RankResult<u32> {
    match list.get(item_id)? {
        Some(e) if !e.is_pinned() => Ok(e.rank),
        Some(_) => Err(RankError::invalid_rank(list.key(), format!("{item_id} is pinned"))),
        None => Err(RankError::invalid_rank(list.key(), format!("{item_id} is not in the list"))),
    }
}
