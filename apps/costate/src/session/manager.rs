use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, ReentrantMutex};
use serde_json::{Map, Value};
use signal_bus::SignalTransport;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::intake;
use super::outbound::{self, OutboundJob};
use crate::catalog::{CatalogRecord, CatalogResolver, StaticCatalog};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::metrics;
use crate::model::{
    Action, ActionPayload, CompareSelect, ItemId, LocalAction, Role, SyncState,
};
use crate::subscription::{StateSubscription, SubscriptionBus};
use crate::sync::scroll::{self, ContainerMetrics, PixelOffset, ScrollLeadership};
use crate::sync::reduce;
use crate::transport::{ChunkedCodec, ProgressFn, SIGNAL_ACTION, SIGNAL_CHUNK, SendReport};

/// Everything `init` needs to bind a manager to one live session.
#[derive(Clone)]
pub struct SessionOptions {
    pub transport: Arc<dyn SignalTransport>,
    pub local_role: Role,
    pub local_user_id: String,
    pub session_id: String,
}

impl SessionOptions {
    pub fn new(
        transport: Arc<dyn SignalTransport>,
        local_role: Role,
        local_user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            local_role,
            local_user_id: local_user_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("local_role", &self.local_role)
            .field("local_user_id", &self.local_user_id)
            .field("session_id", &self.session_id)
            .finish()
    }
}

struct ActiveSession {
    local_role: Role,
    local_user_id: String,
    session_id: String,
    codec: Arc<ChunkedCodec>,
    outbound: mpsc::UnboundedSender<OutboundJob>,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveSession {
    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Millisecond wall clock that never hands out the same value twice.
#[derive(Debug, Default)]
struct LocalClock {
    last: u64,
}

impl LocalClock {
    fn stamp(&mut self, explicit: Option<u64>) -> u64 {
        let ts = match explicit {
            Some(ts) => ts,
            None => now_ms().max(self.last.saturating_add(1)),
        };
        self.last = self.last.max(ts);
        ts
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) struct Shared {
    config: SyncConfig,
    catalog: Arc<dyn CatalogResolver>,
    active: AtomicBool,
    store: Mutex<SyncState>,
    leadership: Mutex<ScrollLeadership>,
    clock: Mutex<LocalClock>,
    bus: SubscriptionBus,
    /// Held from reduce through notify so callbacks never overlap and see
    /// snapshots in apply order. Reentrant for callbacks that dispatch.
    publish: ReentrantMutex<()>,
    session: Mutex<Option<ActiveSession>>,
}

impl Shared {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn reset_replica(&self) {
        *self.store.lock() = SyncState::default();
        self.leadership.lock().clear();
    }

    /// Runs the reducer and publishes the new snapshot. The active flag is
    /// re-checked under the store lock, so nothing lands after shutdown.
    fn apply(&self, action: &Action, source: &'static str) -> bool {
        let _publish = self.publish.lock();
        let snapshot = {
            let mut store = self.store.lock();
            if !self.is_active() {
                return false;
            }
            let next = reduce(std::mem::take(&mut *store), action);
            *store = next.clone();
            next
        };
        metrics::ACTIONS_APPLIED
            .with_label_values(&[source, action.action_type().as_str()])
            .inc();
        trace!(
            target = "costate::session",
            source,
            action = %action.action_type(),
            origin = %action.origin_role,
            ts = action.ts,
            "action applied"
        );
        self.bus.notify(&snapshot);
        true
    }

    /// Refuses local intents that would break a peer-local rule.
    fn admit(&self, payload: &ActionPayload, role: Role) -> SyncResult<()> {
        match payload {
            ActionPayload::CompareSelect(CompareSelect::Toggle {
                item_id,
                selected: true,
            }) => {
                let store = self.store.lock();
                if !store.selection.contains(item_id) && store.selection.is_full() {
                    return Err(SyncError::Rejected("compare set is full"));
                }
            }
            ActionPayload::Scroll(update) => {
                if !update.percent_x.is_finite() || !update.percent_y.is_finite() {
                    return Err(SyncError::Rejected("non-finite scroll percent"));
                }
                let mut leadership = self.leadership.lock();
                leadership.elect(&update.container_id, role);
                if !leadership.may_emit(&update.container_id, role) {
                    return Err(SyncError::Rejected("container is led by the peer"));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn dispatch(
        &self,
        local: LocalAction,
        on_progress: Option<ProgressFn>,
        done: Option<oneshot::Sender<SyncResult<SendReport>>>,
    ) -> SyncResult<Action> {
        let (role, outbound) = {
            let session = self.session.lock();
            match session.as_ref() {
                Some(active) if self.is_active() => (active.local_role, active.outbound.clone()),
                _ => return Err(SyncError::NotActive),
            }
        };
        if local.origin_role.is_some_and(|origin| origin != role) {
            return Err(SyncError::Rejected("origin role differs from the local role"));
        }
        self.admit(&local.payload, role)?;

        let ts = self.clock.lock().stamp(local.ts);
        let action = local.stamp_with(role, ts);
        if !self.apply(&action, "local") {
            return Err(SyncError::NotActive);
        }

        let job = OutboundJob {
            action: action.clone(),
            on_progress,
            done,
        };
        if outbound.send(job).is_err() {
            return Err(SyncError::QueueClosed);
        }
        Ok(action)
    }

    pub(super) fn receive_payload(&self, raw: &str, transfer_id: Option<String>, local_role: Role) {
        match Action::from_json(raw) {
            Ok(mut action) => {
                if transfer_id.is_some() {
                    action.transfer_id = transfer_id;
                }
                self.receive_remote(action, local_role);
            }
            Err(err) => {
                let err = SyncError::from(err);
                metrics::ACTIONS_DROPPED
                    .with_label_values(&[err.kind()])
                    .inc();
                warn!(
                    target = "costate::intake",
                    error = %err,
                    bytes = raw.len(),
                    "dropping remote payload"
                );
            }
        }
    }

    fn receive_remote(&self, action: Action, local_role: Role) -> bool {
        if !self.is_active() {
            metrics::ACTIONS_DROPPED
                .with_label_values(&[SyncError::StaleAction.kind()])
                .inc();
            debug!(
                target = "costate::intake",
                error = %SyncError::StaleAction,
                action = %action.action_type(),
                "ignoring remote action"
            );
            return false;
        }
        if action.origin_role == local_role {
            metrics::ACTIONS_DROPPED.with_label_values(&["echo"]).inc();
            debug!(
                target = "costate::intake",
                action = %action.action_type(),
                ts = action.ts,
                "ignoring echo of a local action"
            );
            return false;
        }
        if let ActionPayload::Scroll(update) = &action.payload {
            self.leadership
                .lock()
                .elect(&update.container_id, action.origin_role);
        }
        self.apply(&action, "remote")
    }

    fn stop(&self) -> Option<ActiveSession> {
        let mut session = self.session.lock().take()?;
        session.abort_tasks();
        Some(session)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().as_mut() {
            session.abort_tasks();
        }
    }
}

/// Session-scoped synchronization manager. One instance per peer per
/// session; clones share the same replica.
#[derive(Clone)]
pub struct SyncManager {
    shared: Arc<Shared>,
}

impl fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncManager")
            .field("active", &self.is_active())
            .field("local_role", &self.local_role())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl Default for SyncManager {
    fn default() -> Self {
        Self::new(SyncConfig::default(), Arc::new(StaticCatalog::empty()))
    }
}

impl SyncManager {
    pub fn new(config: SyncConfig, catalog: Arc<dyn CatalogResolver>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                catalog,
                active: AtomicBool::new(false),
                store: Mutex::new(SyncState::default()),
                leadership: Mutex::new(ScrollLeadership::new()),
                clock: Mutex::new(LocalClock::default()),
                bus: SubscriptionBus::new(),
                publish: ReentrantMutex::new(()),
                session: Mutex::new(None),
            }),
        }
    }

    /// Binds the manager to a session and starts its intake and outbound
    /// tasks on the current tokio runtime. Re-initializing with the same
    /// session is a no-op; a different session replaces the current one.
    pub fn init(&self, options: SessionOptions) -> SyncResult<()> {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let replacing = {
            let session = self.shared.session.lock();
            match session.as_ref() {
                Some(current)
                    if current.session_id == options.session_id
                        && current.local_role == options.local_role
                        && self.is_active() =>
                {
                    debug!(
                        target = "costate::session",
                        session_id = %options.session_id,
                        "sync manager already initialized"
                    );
                    return Ok(());
                }
                Some(_) => true,
                None => false,
            }
        };
        if replacing {
            self.shutdown();
        }
        self.shared.reset_replica();

        let SessionOptions {
            transport,
            local_role,
            local_user_id,
            session_id,
        } = options;
        let codec = Arc::new(ChunkedCodec::new(Arc::clone(&transport), &self.shared.config));
        let actions = transport.on(SIGNAL_ACTION);
        let chunks = transport.on(SIGNAL_CHUNK);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let mut session = self.shared.session.lock();
        self.shared.active.store(true, Ordering::SeqCst);
        let tasks = vec![
            runtime.spawn(outbound::run(Arc::clone(&codec), outbound_rx)),
            runtime.spawn(intake::run(
                Arc::downgrade(&self.shared),
                Arc::clone(&codec),
                local_role,
                actions,
                chunks,
                self.shared.config.sweep_interval,
            )),
        ];
        info!(
            target = "costate::session",
            session_id = %session_id,
            local_user_id = %local_user_id,
            local_role = %local_role,
            max_signal_bytes = codec.config().max_signal_bytes,
            "sync session started"
        );
        *session = Some(ActiveSession {
            local_role,
            local_user_id,
            session_id,
            codec,
            outbound: outbound_tx,
            tasks,
        });
        Ok(())
    }

    /// Stops the session: flips `active` first, then aborts both tasks, drops
    /// the transport handlers and reassembly buffers, and unregisters every
    /// subscriber. Safe to call repeatedly.
    pub fn shutdown(&self) {
        let was_active = self.shared.active.swap(false, Ordering::SeqCst);
        let stopped = self.shared.stop();
        self.shared.reset_replica();
        let subscribers = self.shared.bus.clear();
        if let Some(session) = stopped {
            let discarded = session.codec.clear();
            info!(
                target = "costate::session",
                session_id = %session.session_id,
                local_user_id = %session.local_user_id,
                discarded_transfers = discarded,
                subscribers,
                "sync session shut down"
            );
        } else if was_active {
            debug!(target = "costate::session", "shutdown without a session");
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    pub fn local_role(&self) -> Option<Role> {
        self.shared
            .session
            .lock()
            .as_ref()
            .map(|session| session.local_role)
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared
            .session
            .lock()
            .as_ref()
            .map(|session| session.session_id.clone())
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    /// Stamps, applies and forwards a local intent. Returns the applied
    /// action, or `None` when the manager is inactive or the intent was
    /// refused; transport failures are logged and never roll back state.
    pub fn apply_local_action(&self, action: impl Into<LocalAction>) -> Option<Action> {
        match self.shared.dispatch(action.into(), None, None) {
            Ok(action) => Some(action),
            Err(err) => {
                log_refused(&err);
                None
            }
        }
    }

    /// Like [`apply_local_action`](Self::apply_local_action), but resolves
    /// once the action has been fully handed to the transport.
    pub async fn apply_local_action_await(
        &self,
        action: impl Into<LocalAction>,
        on_progress: Option<ProgressFn>,
    ) -> SyncResult<SendReport> {
        let (done_tx, done_rx) = oneshot::channel();
        if let Err(err) = self
            .shared
            .dispatch(action.into(), on_progress, Some(done_tx))
        {
            log_refused(&err);
            return Err(err);
        }
        done_rx.await.map_err(|_| SyncError::QueueClosed)?
    }

    /// Applies an action that arrived from the peer outside the signaling
    /// channel. Ignored once shut down, or when it echoes the local role.
    pub fn on_remote_action(&self, action: Action) -> bool {
        let Some(local_role) = self.local_role() else {
            metrics::ACTIONS_DROPPED
                .with_label_values(&[SyncError::StaleAction.kind()])
                .inc();
            return false;
        };
        self.shared.receive_remote(action, local_role)
    }

    pub fn scroll(
        &self,
        container_id: impl Into<String>,
        metrics: &ContainerMetrics,
        scroll_top: f64,
        scroll_left: f64,
    ) -> Option<Action> {
        let percent = scroll::normalize(metrics, scroll_top, scroll_left);
        self.apply_local_action(LocalAction::scroll(
            container_id,
            percent.percent_x,
            percent.percent_y,
        ))
    }

    /// Pixel offsets this peer should scroll `container_id` to, using its own
    /// geometry. `None` while this peer leads the container or nothing has
    /// been recorded for it.
    pub fn follow_target(&self, container_id: &str, metrics: &ContainerMetrics) -> Option<PixelOffset> {
        let local_role = self.local_role()?;
        if self.shared.leadership.lock().leader(container_id) == Some(local_role) {
            return None;
        }
        let state = self.shared.store.lock();
        let position = state.scroll_position(container_id)?;
        if position.source_role == local_role {
            return None;
        }
        Some(scroll::position_to_pixels(metrics, position))
    }

    pub fn detail_action(&self, name: impl Into<String>, payload: Map<String, Value>) -> Option<Action> {
        self.apply_local_action(LocalAction::detail(name, payload))
    }

    pub fn share_items<I, S>(&self, item_ids: I) -> Option<Action>
    where
        I: IntoIterator<Item = S>,
        S: Into<ItemId>,
    {
        self.apply_local_action(LocalAction::share_items(item_ids))
    }

    /// Shares full records by identifier only; the peer resolves them from
    /// its own catalog.
    pub fn share_records(&self, records: &[CatalogRecord]) -> Option<Action> {
        self.share_items(records.iter().map(|record| record.id.clone()))
    }

    pub fn toggle_compare(&self, item_id: impl Into<ItemId>, selected: bool) -> Option<Action> {
        self.apply_local_action(LocalAction::compare_toggle(item_id, selected))
    }

    pub fn compare_select_batch<I, S>(&self, item_ids: I) -> Option<Action>
    where
        I: IntoIterator<Item = S>,
        S: Into<ItemId>,
    {
        self.apply_local_action(LocalAction::compare_batch(item_ids))
    }

    pub fn on_state_change<F>(&self, callback: F) -> StateSubscription
    where
        F: Fn(&SyncState) + Send + Sync + 'static,
    {
        self.shared.bus.subscribe(Arc::new(callback))
    }

    pub fn get_state(&self) -> SyncState {
        self.shared.store.lock().clone()
    }

    /// Current shared items resolved through the catalog; unknown ids are
    /// skipped.
    pub fn resolve_shared_items(&self) -> Vec<CatalogRecord> {
        let ids = self.shared.store.lock().shared_item_ids.clone();
        self.shared.catalog.resolve_by_ids(&ids)
    }

    /// Partial inbound transfers currently buffered.
    pub fn pending_transfers(&self) -> usize {
        self.shared
            .session
            .lock()
            .as_ref()
            .map(|session| session.codec.inflight())
            .unwrap_or(0)
    }
}

fn log_refused(err: &SyncError) {
    metrics::ACTIONS_DROPPED
        .with_label_values(&[err.kind()])
        .inc();
    match err {
        SyncError::Rejected(reason) => debug!(
            target = "costate::dispatch",
            reason = *reason,
            "local action not dispatched"
        ),
        other => warn!(
            target = "costate::dispatch",
            error = %other,
            "local action not dispatched"
        ),
    }
}
