pub mod action;
pub mod state;

pub use action::{
    Action, ActionEnvelope, ActionError, ActionPayload, ActionType, CompareSelect, DetailUpdate,
    ItemId, LocalAction, Role, ScrollUpdate, Stamp,
};
pub use state::{
    COMPARE_CAP, DetailEntry, Metadata, ScrollPosition, Selection, SelectionMark, SyncState,
};
