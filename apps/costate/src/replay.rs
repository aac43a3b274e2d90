//! In-process host/guest replay over the in-memory signaling pair.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use signal_bus::LocalSignalBus;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::catalog::{CatalogRecord, CatalogResolver};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::model::{ActionEnvelope, LocalAction, Role, SyncState};
use crate::session::{SessionOptions, SyncManager};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioStep {
    pub role: Role,
    /// `originRole` and `ts` are optional here; missing ones are stamped on dispatch.
    pub action: ActionEnvelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub steps: Vec<ScenarioStep>,
}

impl Scenario {
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub converged: bool,
    pub dispatched: usize,
    pub rejected: usize,
    pub failed: usize,
    pub host: SyncState,
    pub guest: SyncState,
    pub host_shared: Vec<CatalogRecord>,
    pub guest_shared: Vec<CatalogRecord>,
}

/// Runs `scenario` against a fresh host and guest manager, then waits up to
/// `settle` for both replicas to agree.
pub async fn run(
    scenario: &Scenario,
    catalog: Arc<dyn CatalogResolver>,
    config: SyncConfig,
    settle: Duration,
) -> SyncResult<ReplayReport> {
    let (host_end, guest_end) = LocalSignalBus::pair_with_limit(config.chunk.max_signal_bytes);
    let host = SyncManager::new(config.clone(), Arc::clone(&catalog));
    let guest = SyncManager::new(config, catalog);
    host.init(SessionOptions::new(Arc::new(host_end), Role::Host, "replay-host", "replay"))?;
    guest.init(SessionOptions::new(Arc::new(guest_end), Role::Guest, "replay-guest", "replay"))?;

    let (mut dispatched, mut rejected, mut failed) = (0, 0, 0);
    for (index, step) in scenario.steps.iter().enumerate() {
        if let Some(delay) = step.delay_ms {
            sleep(Duration::from_millis(delay)).await;
        }
        let manager = match step.role {
            Role::Host => &host,
            Role::Guest => &guest,
        };
        let action = LocalAction::try_from(step.action.clone())?;
        match manager.apply_local_action_await(action, None).await {
            Ok(_) => dispatched += 1,
            Err(SyncError::Rejected(reason)) => {
                rejected += 1;
                info!(target = "costate::replay", step = index, reason, "step rejected");
            }
            Err(err) => {
                failed += 1;
                warn!(target = "costate::replay", step = index, error = %err, "step failed to send");
            }
        }
    }

    let deadline = Instant::now() + settle;
    while host.get_state() != guest.get_state() && Instant::now() < deadline {
        sleep(POLL_INTERVAL).await;
    }

    let host_state = host.get_state();
    let guest_state = guest.get_state();
    let report = ReplayReport {
        converged: host_state == guest_state,
        dispatched,
        rejected,
        failed,
        host_shared: host.resolve_shared_items(),
        guest_shared: guest.resolve_shared_items(),
        host: host_state,
        guest: guest_state,
    };
    host.shutdown();
    guest.shutdown();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;

    #[tokio::test]
    async fn share_and_detail_converge_on_both_peers() {
        let scenario = Scenario::from_json_str(
            r#"{"steps":[
                {"role":"host","action":{"type":"SHARE_ITEMS","data":{"itemIds":["p1","p2"]},"ts":100}},
                {"role":"host","action":{"type":"DETAIL_ACTION","data":{"name":"comparison","payload":{"open":true}},"ts":101}}
            ]}"#,
        )
        .expect("scenario");
        let catalog = StaticCatalog::from_json_str("plans", r#"[{"id":"p1"},{"id":"p2"}]"#)
            .expect("catalog");

        let report = run(
            &scenario,
            Arc::new(catalog),
            SyncConfig::default(),
            Duration::from_secs(2),
        )
        .await
        .expect("replay");

        assert!(report.converged);
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.guest.shared_item_ids, vec!["p1", "p2"]);
        let detail = report.guest.detail("comparison").expect("detail");
        assert_eq!(detail.get("open"), Some(&serde_json::json!(true)));
        assert_eq!(detail.ts, 101);
        assert_eq!(report.guest_shared.len(), 2);
    }

    #[tokio::test]
    async fn follower_scroll_step_is_rejected() {
        let scenario = Scenario::from_json_str(
            r#"{"steps":[
                {"role":"host","action":{"type":"SCROLL","data":{"containerId":"list","percentY":0.4}}},
                {"role":"guest","action":{"type":"SCROLL","data":{"containerId":"list","percentY":0.9}},"delayMs":50}
            ]}"#,
        )
        .expect("scenario");
        let report = run(
            &scenario,
            Arc::new(StaticCatalog::empty()),
            SyncConfig::default(),
            Duration::from_secs(2),
        )
        .await
        .expect("replay");
        assert_eq!(report.rejected, 1);
        assert!(report.converged);
        assert_eq!(
            report.guest.scroll_position("list").map(|p| p.percent_y),
            Some(0.4)
        );
    }
}
