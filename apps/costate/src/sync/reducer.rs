use std::collections::HashSet;

use crate::model::{
    Action, ActionPayload, COMPARE_CAP, CompareSelect, DetailUpdate, ItemId, ScrollPosition,
    ScrollUpdate, SelectionMark, Stamp, SyncState,
};

/// Applies `action` to `state`. Used unchanged for local and remote actions,
/// so both peers compute the same state from the same set of actions.
///
/// Every field is a last-writer-wins register keyed by [`Stamp`]; a write
/// older than the current value is absorbed without effect, which makes the
/// result independent of arrival order.
pub fn reduce(mut state: SyncState, action: &Action) -> SyncState {
    let stamp = action.stamp();
    match &action.payload {
        ActionPayload::CompareSelect(select) => apply_compare(&mut state, select, stamp),
        ActionPayload::ShareItems { item_ids } => apply_share(&mut state, item_ids, stamp),
        ActionPayload::Scroll(update) => apply_scroll(&mut state, update, stamp),
        ActionPayload::DetailAction(update) => apply_detail(&mut state, update, stamp),
    }
    state
}

fn apply_compare(state: &mut SyncState, select: &CompareSelect, stamp: Stamp) {
    let selection = &mut state.selection;
    if selection.floor.is_some_and(|floor| stamp < floor) {
        return;
    }
    match select {
        CompareSelect::Toggle { item_id, selected } => {
            let newer_exists = selection
                .marks
                .get(item_id)
                .is_some_and(|mark| mark.stamp > stamp);
            if !newer_exists {
                selection.marks.insert(
                    item_id.clone(),
                    SelectionMark {
                        selected: *selected,
                        stamp,
                        rank: 0,
                    },
                );
            }
        }
        CompareSelect::Batch { item_ids } => {
            selection.marks.retain(|_, mark| mark.stamp >= stamp);
            for (rank, item_id) in dedup_capped(item_ids).into_iter().enumerate() {
                let newer_exists = selection
                    .marks
                    .get(item_id)
                    .is_some_and(|mark| mark.stamp > stamp);
                if newer_exists {
                    continue;
                }
                selection.marks.insert(
                    item_id.clone(),
                    SelectionMark {
                        selected: true,
                        stamp,
                        rank: rank as u32,
                    },
                );
            }
            selection.floor = Some(stamp);
        }
    }
    selection.refresh();
}

/// First occurrences only, truncated to the compare cap.
fn dedup_capped(item_ids: &[ItemId]) -> Vec<&ItemId> {
    let mut seen = HashSet::new();
    item_ids
        .iter()
        .filter(|id| seen.insert(id.as_str()))
        .take(COMPARE_CAP)
        .collect()
}

fn apply_share(state: &mut SyncState, item_ids: &[ItemId], stamp: Stamp) {
    if state.shared_stamp.is_some_and(|current| current > stamp) {
        return;
    }
    state.shared_item_ids = item_ids.to_vec();
    state.shared_stamp = Some(stamp);
}

fn apply_scroll(state: &mut SyncState, update: &ScrollUpdate, stamp: Stamp) {
    if let Some(current) = state.scroll_positions.get(&update.container_id) {
        if current.stamp() > stamp {
            return;
        }
    }
    state.scroll_positions.insert(
        update.container_id.clone(),
        ScrollPosition {
            percent_y: super::scroll::clamp_unit(update.percent_y),
            percent_x: super::scroll::clamp_unit(update.percent_x),
            source_role: stamp.origin,
            ts: stamp.ts,
        },
    );
}

fn apply_detail(state: &mut SyncState, update: &DetailUpdate, stamp: Stamp) {
    let entry = state
        .metadata
        .detail
        .entry(update.name.clone())
        .or_default();
    for (key, value) in &update.payload {
        let stale = entry
            .field_stamps
            .get(key)
            .is_some_and(|current| *current > stamp);
        if stale {
            continue;
        }
        entry.fields.insert(key.clone(), value.clone());
        entry.field_stamps.insert(key.clone(), stamp);
    }
    entry.ts = entry.ts.max(stamp.ts);
}
