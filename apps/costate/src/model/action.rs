use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub type ItemId = String;

/// One of the two peers of a session.
///
/// Declaration order matters: it breaks timestamp ties in [`Stamp`], so a
/// host write wins over a guest write carrying the same millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Guest,
    Host,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::Host => "host",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ActionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(Role::Host),
            "guest" => Ok(Role::Guest),
            other => Err(ActionError::Invalid(format!("unknown role {other:?}"))),
        }
    }
}

/// Write version used for last-writer-wins: `ts` first, then role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp {
    pub ts: u64,
    pub origin: Role,
}

impl Stamp {
    pub fn new(ts: u64, origin: Role) -> Self {
        Self { ts, origin }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    CompareSelect,
    ShareItems,
    Scroll,
    DetailAction,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::CompareSelect => "COMPARE_SELECT",
            ActionType::ShareItems => "SHARE_ITEMS",
            ActionType::Scroll => "SCROLL",
            ActionType::DetailAction => "DETAIL_ACTION",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("action json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("action missing {0}")]
    MissingField(&'static str),
    #[error("invalid action: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompareSelect {
    Toggle { item_id: ItemId, selected: bool },
    /// Wholesale replacement of the compare set.
    Batch { item_ids: Vec<ItemId> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScrollUpdate {
    pub container_id: String,
    pub percent_x: f64,
    pub percent_y: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetailUpdate {
    pub name: String,
    pub payload: Map<String, Value>,
}

/// The closed action vocabulary exchanged between peers.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionPayload {
    CompareSelect(CompareSelect),
    ShareItems { item_ids: Vec<ItemId> },
    Scroll(ScrollUpdate),
    DetailAction(DetailUpdate),
}

impl ActionPayload {
    pub fn action_type(&self) -> ActionType {
        match self {
            ActionPayload::CompareSelect(_) => ActionType::CompareSelect,
            ActionPayload::ShareItems { .. } => ActionType::ShareItems,
            ActionPayload::Scroll(_) => ActionType::Scroll,
            ActionPayload::DetailAction(_) => ActionType::DetailAction,
        }
    }

    fn to_data(&self) -> Value {
        let data = match self {
            ActionPayload::CompareSelect(CompareSelect::Toggle { item_id, selected }) => {
                serde_json::to_value(CompareSelectData {
                    item_id: Some(item_id.clone()),
                    item_ids: None,
                    selected: *selected,
                    batch: false,
                })
            }
            ActionPayload::CompareSelect(CompareSelect::Batch { item_ids }) => {
                serde_json::to_value(CompareSelectData {
                    item_id: None,
                    item_ids: Some(item_ids.clone()),
                    selected: true,
                    batch: true,
                })
            }
            ActionPayload::ShareItems { item_ids } => serde_json::to_value(ShareItemsData {
                item_ids: item_ids.clone(),
            }),
            ActionPayload::Scroll(update) => serde_json::to_value(ScrollData {
                container_id: update.container_id.clone(),
                percent_x: update.percent_x,
                percent_y: update.percent_y,
            }),
            ActionPayload::DetailAction(update) => serde_json::to_value(DetailData {
                name: update.name.clone(),
                payload: update.payload.clone(),
            }),
        };
        // plain structs of strings, bools and finite floats always serialize
        data.unwrap_or(Value::Null)
    }

    fn from_data(action_type: ActionType, data: Value) -> Result<Self, ActionError> {
        match action_type {
            ActionType::CompareSelect => {
                let data: CompareSelectData = serde_json::from_value(data)?;
                if data.batch {
                    let item_ids = data
                        .item_ids
                        .ok_or(ActionError::MissingField("data.itemIds"))?;
                    ensure_ids(&item_ids)?;
                    Ok(ActionPayload::CompareSelect(CompareSelect::Batch { item_ids }))
                } else {
                    let item_id = data.item_id.ok_or(ActionError::MissingField("data.itemId"))?;
                    ensure_ids(std::slice::from_ref(&item_id))?;
                    Ok(ActionPayload::CompareSelect(CompareSelect::Toggle {
                        item_id,
                        selected: data.selected,
                    }))
                }
            }
            ActionType::ShareItems => {
                let data: ShareItemsData = serde_json::from_value(data)?;
                ensure_ids(&data.item_ids)?;
                Ok(ActionPayload::ShareItems {
                    item_ids: data.item_ids,
                })
            }
            ActionType::Scroll => {
                let data: ScrollData = serde_json::from_value(data)?;
                if data.container_id.is_empty() {
                    return Err(ActionError::Invalid("empty containerId".into()));
                }
                if !data.percent_x.is_finite() || !data.percent_y.is_finite() {
                    return Err(ActionError::Invalid("non-finite scroll percent".into()));
                }
                Ok(ActionPayload::Scroll(ScrollUpdate {
                    container_id: data.container_id,
                    percent_x: data.percent_x.clamp(0.0, 1.0),
                    percent_y: data.percent_y.clamp(0.0, 1.0),
                }))
            }
            ActionType::DetailAction => {
                let data: DetailData = serde_json::from_value(data)?;
                if data.name.is_empty() {
                    return Err(ActionError::Invalid("empty detail name".into()));
                }
                Ok(ActionPayload::DetailAction(DetailUpdate {
                    name: data.name,
                    payload: data.payload,
                }))
            }
        }
    }
}

fn ensure_ids(ids: &[ItemId]) -> Result<(), ActionError> {
    if ids.iter().any(|id| id.is_empty()) {
        return Err(ActionError::Invalid("empty item id".into()));
    }
    Ok(())
}

/// A canonical, stamped action. This is what the reducer consumes and what
/// crosses the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "ActionEnvelope", try_from = "ActionEnvelope")]
pub struct Action {
    pub payload: ActionPayload,
    pub origin_role: Role,
    pub ts: u64,
    /// Set on receipt when the action arrived as a chunked transfer.
    pub transfer_id: Option<String>,
}

impl Action {
    pub fn new(payload: ActionPayload, origin_role: Role, ts: u64) -> Self {
        Self {
            payload,
            origin_role,
            ts,
            transfer_id: None,
        }
    }

    pub fn action_type(&self) -> ActionType {
        self.payload.action_type()
    }

    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.ts, self.origin_role)
    }

    pub fn to_json(&self) -> Result<String, ActionError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, ActionError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// A locally originated intent. `ts` and `origin_role` are filled in by the
/// dispatcher when absent.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalAction {
    pub payload: ActionPayload,
    pub origin_role: Option<Role>,
    pub ts: Option<u64>,
}

impl LocalAction {
    pub fn new(payload: ActionPayload) -> Self {
        Self {
            payload,
            origin_role: None,
            ts: None,
        }
    }

    pub fn at(mut self, ts: u64) -> Self {
        self.ts = Some(ts);
        self
    }

    pub fn from_role(mut self, role: Role) -> Self {
        self.origin_role = Some(role);
        self
    }

    pub fn stamp_with(self, role: Role, ts: u64) -> Action {
        Action::new(
            self.payload,
            self.origin_role.unwrap_or(role),
            self.ts.unwrap_or(ts),
        )
    }

    pub fn compare_toggle(item_id: impl Into<ItemId>, selected: bool) -> Self {
        Self::new(ActionPayload::CompareSelect(CompareSelect::Toggle {
            item_id: item_id.into(),
            selected,
        }))
    }

    pub fn compare_batch<I, S>(item_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ItemId>,
    {
        Self::new(ActionPayload::CompareSelect(CompareSelect::Batch {
            item_ids: item_ids.into_iter().map(Into::into).collect(),
        }))
    }

    pub fn share_items<I, S>(item_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ItemId>,
    {
        Self::new(ActionPayload::ShareItems {
            item_ids: item_ids.into_iter().map(Into::into).collect(),
        })
    }

    pub fn scroll(container_id: impl Into<String>, percent_x: f64, percent_y: f64) -> Self {
        Self::new(ActionPayload::Scroll(ScrollUpdate {
            container_id: container_id.into(),
            percent_x,
            percent_y,
        }))
    }

    pub fn detail(name: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self::new(ActionPayload::DetailAction(DetailUpdate {
            name: name.into(),
            payload,
        }))
    }
}

impl From<ActionPayload> for LocalAction {
    fn from(payload: ActionPayload) -> Self {
        Self::new(payload)
    }
}

impl From<Action> for LocalAction {
    fn from(action: Action) -> Self {
        Self {
            payload: action.payload,
            origin_role: Some(action.origin_role),
            ts: Some(action.ts),
        }
    }
}

impl TryFrom<ActionEnvelope> for LocalAction {
    type Error = ActionError;

    fn try_from(envelope: ActionEnvelope) -> Result<Self, Self::Error> {
        Ok(Self {
            payload: ActionPayload::from_data(envelope.action_type, envelope.data)?,
            origin_role: envelope.origin_role,
            ts: envelope.ts,
        })
    }
}

/// Wire form of an action: `{ type, data, originRole, ts, transferId? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEnvelope {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,
}

impl From<Action> for ActionEnvelope {
    fn from(action: Action) -> Self {
        Self {
            action_type: action.payload.action_type(),
            data: action.payload.to_data(),
            origin_role: Some(action.origin_role),
            ts: Some(action.ts),
            transfer_id: action.transfer_id,
        }
    }
}

impl TryFrom<ActionEnvelope> for Action {
    type Error = ActionError;

    fn try_from(envelope: ActionEnvelope) -> Result<Self, Self::Error> {
        let origin_role = envelope
            .origin_role
            .ok_or(ActionError::MissingField("originRole"))?;
        let ts = envelope.ts.ok_or(ActionError::MissingField("ts"))?;
        Ok(Self {
            payload: ActionPayload::from_data(envelope.action_type, envelope.data)?,
            origin_role,
            ts,
            transfer_id: envelope.transfer_id,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompareSelectData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    item_id: Option<ItemId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    item_ids: Option<Vec<ItemId>>,
    #[serde(default = "default_selected")]
    selected: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    batch: bool,
}

fn default_selected() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShareItemsData {
    item_ids: Vec<ItemId>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScrollData {
    container_id: String,
    #[serde(default)]
    percent_x: f64,
    #[serde(default)]
    percent_y: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DetailData {
    name: String,
    #[serde(default)]
    payload: Map<String, Value>,
}
