use std::collections::HashMap;
use std::collections::hash_map::Entry;

use serde::{Deserialize, Serialize};

use crate::model::{Role, ScrollPosition};

/// Geometry of a scrollable container as measured on one device.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMetrics {
    pub scroll_height: f64,
    pub client_height: f64,
    pub scroll_width: f64,
    pub client_width: f64,
}

impl ContainerMetrics {
    pub fn new(scroll_height: f64, client_height: f64, scroll_width: f64, client_width: f64) -> Self {
        Self {
            scroll_height,
            client_height,
            scroll_width,
            client_width,
        }
    }

    fn range_y(&self) -> f64 {
        (self.scroll_height - self.client_height).max(0.0)
    }

    fn range_x(&self) -> f64 {
        (self.scroll_width - self.client_width).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollPercent {
    pub percent_x: f64,
    pub percent_y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PixelOffset {
    pub scroll_top: f64,
    pub scroll_left: f64,
}

/// Clamps into `[0, 1]`; non-finite input maps to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Converts raw pixel offsets into device-independent fractions of the
/// scrollable range. A container that cannot scroll yields 0.
pub fn normalize(metrics: &ContainerMetrics, scroll_top: f64, scroll_left: f64) -> ScrollPercent {
    let y = scroll_top / (metrics.scroll_height - metrics.client_height).max(1.0);
    let x = scroll_left / (metrics.scroll_width - metrics.client_width).max(1.0);
    ScrollPercent {
        percent_x: clamp_unit(x),
        percent_y: clamp_unit(y),
    }
}

/// Maps fractions back onto this device's own container geometry.
pub fn to_pixels(metrics: &ContainerMetrics, percent_x: f64, percent_y: f64) -> PixelOffset {
    PixelOffset {
        scroll_top: clamp_unit(percent_y) * metrics.range_y(),
        scroll_left: clamp_unit(percent_x) * metrics.range_x(),
    }
}

pub fn position_to_pixels(metrics: &ContainerMetrics, position: &ScrollPosition) -> PixelOffset {
    to_pixels(metrics, position.percent_x, position.percent_y)
}

/// Per-container leader flags. The first role observed scrolling a container
/// leads it for the rest of the session; the flag is written exactly once.
#[derive(Debug, Default)]
pub struct ScrollLeadership {
    leaders: HashMap<String, Role>,
}

impl ScrollLeadership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `role` as leader if the container has none yet and returns the
    /// container's leader.
    pub fn elect(&mut self, container_id: &str, role: Role) -> Role {
        match self.leaders.entry(container_id.to_string()) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => *entry.insert(role),
        }
    }

    pub fn leader(&self, container_id: &str) -> Option<Role> {
        self.leaders.get(container_id).copied()
    }

    /// Whether `role` may emit scroll updates for the container.
    pub fn may_emit(&self, container_id: &str, role: Role) -> bool {
        self.leader(container_id).is_none_or(|leader| leader == role)
    }

    pub fn clear(&mut self) {
        self.leaders.clear();
    }
}
