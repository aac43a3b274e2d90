use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use super::action::{ItemId, Role, Stamp};

/// Maximum number of items selected for side-by-side comparison.
pub const COMPARE_CAP: usize = 3;

/// Last write recorded for one item of the compare selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SelectionMark {
    pub selected: bool,
    pub stamp: Stamp,
    /// Position within the batch that wrote the mark; 0 for single toggles.
    pub rank: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub compare_set: Vec<ItemId>,
    pub ts: u64,
    #[serde(skip)]
    pub(crate) marks: BTreeMap<ItemId, SelectionMark>,
    /// Stamp of the newest batch replacement; older writes are superseded.
    #[serde(skip)]
    pub(crate) floor: Option<Stamp>,
}

impl Selection {
    pub fn contains(&self, item_id: &str) -> bool {
        self.compare_set.iter().any(|id| id == item_id)
    }

    pub fn is_full(&self) -> bool {
        self.compare_set.len() >= COMPARE_CAP
    }

    pub fn mark(&self, item_id: &str) -> Option<&SelectionMark> {
        self.marks.get(item_id)
    }

    /// Rebuilds `compare_set` and `ts` from the recorded marks.
    pub(crate) fn refresh(&mut self) {
        let mut selected: Vec<(&ItemId, &SelectionMark)> =
            self.marks.iter().filter(|(_, mark)| mark.selected).collect();
        selected.sort_by(|(a_id, a), (b_id, b)| {
            (a.stamp, a.rank, *a_id).cmp(&(b.stamp, b.rank, *b_id))
        });
        self.compare_set = selected
            .into_iter()
            .take(COMPARE_CAP)
            .map(|(id, _)| id.clone())
            .collect();
        let newest_mark = self.marks.values().map(|mark| mark.stamp.ts).max();
        let floor = self.floor.map(|stamp| stamp.ts);
        self.ts = newest_mark.max(floor).unwrap_or(0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollPosition {
    pub percent_y: f64,
    pub percent_x: f64,
    pub source_role: Role,
    pub ts: u64,
}

impl ScrollPosition {
    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.ts, self.source_role)
    }
}

/// Shallow-merged detail payload; serializes as the merged fields plus `ts`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetailEntry {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    pub ts: u64,
    #[serde(skip)]
    pub(crate) field_stamps: BTreeMap<String, Stamp>,
}

impl DetailEntry {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metadata {
    pub detail: BTreeMap<String, DetailEntry>,
}

/// Replica of the synchronized UI state held by each peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub selection: Selection,
    pub scroll_positions: BTreeMap<String, ScrollPosition>,
    pub metadata: Metadata,
    pub shared_item_ids: Vec<ItemId>,
    #[serde(skip)]
    pub(crate) shared_stamp: Option<Stamp>,
}

impl SyncState {
    pub fn detail(&self, name: &str) -> Option<&DetailEntry> {
        self.metadata.detail.get(name)
    }

    pub fn scroll_position(&self, container_id: &str) -> Option<&ScrollPosition> {
        self.scroll_positions.get(container_id)
    }

    pub fn shared_ts(&self) -> Option<u64> {
        self.shared_stamp.map(|stamp| stamp.ts)
    }
}
