use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use costate_core::catalog::StaticCatalog;
use costate_core::model::{LocalAction, Role, SyncState};
use costate_core::transport::{Chunk, Progress, ProgressFn, SIGNAL_CHUNK, encode_chunk};
use costate_core::{ContainerMetrics, SessionOptions, SyncConfig, SyncError, SyncManager};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use signal_bus::{LocalSignalBus, Signal, SignalError, SignalTransport};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(3);

fn catalog() -> Arc<StaticCatalog> {
    Arc::new(
        StaticCatalog::from_json_str(
            "plans",
            r#"[{"id":"p1","name":"Silver"},{"id":"p2","name":"Gold"},{"id":"p3","name":"Bronze"}]"#,
        )
        .expect("catalog"),
    )
}

struct Pair {
    host: SyncManager,
    guest: SyncManager,
    host_bus: Arc<LocalSignalBus>,
}

fn connected_pair() -> Pair {
    connected_pair_with(SyncConfig::default())
}

fn connected_pair_with(config: SyncConfig) -> Pair {
    let (host_end, guest_end) = LocalSignalBus::pair();
    let host_bus = Arc::new(host_end);
    let host = SyncManager::new(config.clone(), catalog());
    let guest = SyncManager::new(config, catalog());
    host.init(SessionOptions::new(
        Arc::clone(&host_bus) as Arc<dyn signal_bus::SignalTransport>,
        Role::Host,
        "agent-7",
        "session-1",
    ))
    .expect("host init");
    guest
        .init(SessionOptions::new(
            Arc::new(guest_end),
            Role::Guest,
            "customer-3",
            "session-1",
        ))
        .expect("guest init");
    Pair {
        host,
        guest,
        host_bus,
    }
}

async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn wait_converged(pair: &Pair) -> SyncState {
    wait_until(|| pair.host.get_state() == pair.guest.get_state()).await;
    pair.guest.get_state()
}

fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("object")
}

#[tokio::test]
async fn guest_converges_on_shared_items_and_detail() {
    let pair = connected_pair();
    pair.host
        .apply_local_action(LocalAction::share_items(["p1", "p2"]).at(100))
        .expect("share");
    pair.host
        .apply_local_action(LocalAction::detail("comparison", object(json!({"open": true}))).at(101))
        .expect("detail");

    let state = wait_converged(&pair).await;
    assert_eq!(state.shared_item_ids, vec!["p1", "p2"]);
    assert_eq!(state.shared_ts(), Some(100));
    let detail = state.detail("comparison").expect("detail entry");
    assert_eq!(detail.get("open"), Some(&json!(true)));
    assert_eq!(detail.ts, 101);

    let records = pair.guest.resolve_shared_items();
    assert_eq!(
        records.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
        vec!["p1", "p2"]
    );
}

#[tokio::test]
async fn oversized_payload_is_chunked_with_progress() {
    let pair = connected_pair();
    let seen: Arc<Mutex<Vec<Progress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let progress: ProgressFn = Arc::new(move |p| sink.lock().push(p));

    let notes = "Deductible comparison, \"network\" tiers\n".repeat(280);
    assert!(notes.len() > 11_000);
    let payload = object(json!({"notes": notes, "rows": (0..50).collect::<Vec<_>>()}));
    let report = pair
        .host
        .apply_local_action_await(LocalAction::detail("quote", payload.clone()), Some(progress))
        .await
        .expect("send");
    assert!(report.fragments > 1);
    assert!(report.transfer_id.is_some());

    let seen = seen.lock().clone();
    assert_eq!(seen.len(), report.fragments as usize);
    assert_eq!(seen.iter().filter(|p| p.percent == 100).count(), 1);

    let state = wait_converged(&pair).await;
    let entry = state.detail("quote").expect("quote");
    assert_eq!(entry.fields, payload);
    assert_eq!(pair.guest.pending_transfers(), 0);
}

#[tokio::test]
async fn actions_after_shutdown_are_ignored() {
    let pair = connected_pair();
    pair.guest.shutdown();
    assert!(!pair.guest.is_active());

    pair.host.share_items(["p3"]).expect("share");
    sleep(Duration::from_millis(50)).await;
    assert_eq!(pair.guest.get_state(), SyncState::default());

    let late = LocalAction::share_items(["p1"]).stamp_with(Role::Host, 5);
    assert!(!pair.guest.on_remote_action(late));
    assert!(pair.guest.toggle_compare("p1", true).is_none());
    let err = pair
        .guest
        .apply_local_action_await(LocalAction::share_items(["p2"]), None)
        .await
        .expect_err("inactive");
    assert!(matches!(err, SyncError::NotActive));
}

#[tokio::test]
async fn panicking_subscriber_does_not_block_others() {
    let pair = connected_pair();
    let _bad = pair.guest.on_state_change(|_| panic!("subscriber bug"));
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let good = pair.guest.on_state_change(move |state| {
        if !state.shared_item_ids.is_empty() {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    pair.host.share_items(["p1"]).expect("share");
    wait_until(|| hits.load(Ordering::SeqCst) == 1).await;

    good.unsubscribe();
    good.unsubscribe();
    pair.host.share_items(["p2"]).expect("share");
    wait_converged(&pair).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_toggles_converge() {
    let pair = connected_pair();
    pair.host
        .apply_local_action(LocalAction::compare_toggle("p1", true).at(100))
        .expect("host toggle");
    pair.guest
        .apply_local_action(LocalAction::compare_toggle("p2", true).at(101))
        .expect("guest toggle");

    let state = wait_converged(&pair).await;
    assert_eq!(state.selection.compare_set, vec!["p1", "p2"]);
    assert_eq!(pair.host.get_state().selection.compare_set, vec!["p1", "p2"]);
}

#[tokio::test]
async fn transport_failure_keeps_local_state() {
    let pair = connected_pair();
    pair.host_bus.disconnect();
    let err = pair
        .host
        .apply_local_action_await(LocalAction::share_items(["p1"]), None)
        .await
        .expect_err("closed transport");
    assert!(matches!(err, SyncError::Transport(SignalError::Closed)));
    assert_eq!(pair.host.get_state().shared_item_ids, vec!["p1"]);
    assert!(pair.guest.get_state().shared_item_ids.is_empty());
}

#[tokio::test]
async fn follower_maps_leader_scroll_onto_its_own_geometry() {
    let pair = connected_pair();
    let leader_view = ContainerMetrics::new(1000.0, 400.0, 0.0, 0.0);
    let action = pair
        .host
        .scroll("results", &leader_view, 300.0, 0.0)
        .expect("scroll");
    assert!(matches!(
        action.payload,
        costate_core::model::ActionPayload::Scroll(ref update) if update.percent_y == 0.5
    ));

    let follower_view = ContainerMetrics::new(800.0, 400.0, 0.0, 0.0);
    wait_until(|| pair.guest.follow_target("results", &follower_view).is_some()).await;
    let target = pair
        .guest
        .follow_target("results", &follower_view)
        .expect("target");
    assert_eq!(target.scroll_top, 200.0);
    assert!(pair.host.follow_target("results", &leader_view).is_none());
    assert!(pair.guest.scroll("results", &follower_view, 10.0, 0.0).is_none());
}

#[tokio::test]
async fn batch_selection_replaces_and_caps_on_both_peers() {
    let pair = connected_pair();
    pair.guest.toggle_compare("p9", true).expect("toggle");
    wait_converged(&pair).await;
    pair.host
        .compare_select_batch(["a", "b", "c", "d"])
        .expect("batch");
    let state = wait_converged(&pair).await;
    assert_eq!(state.selection.compare_set, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn share_records_sends_only_identifiers() {
    let pair = connected_pair();
    let records = catalog_records();
    let action = pair.host.share_records(&records).expect("share");
    let wire = action.to_json().expect("json");
    assert!(!wire.contains("Silver"));
    let state = wait_converged(&pair).await;
    assert_eq!(state.shared_item_ids, vec!["p1", "p3"]);
    let resolved = pair.guest.resolve_shared_items();
    assert_eq!(resolved[1].fields.get("name"), Some(&json!("Bronze")));
}

fn catalog_records() -> Vec<costate_core::CatalogRecord> {
    use costate_core::CatalogResolver;
    let catalog = catalog();
    catalog.resolve_by_ids(&["p1".to_string(), "p3".to_string()])
}

fn first_of_two_fragments(transfer_id: &str) -> Signal {
    let chunk = Chunk {
        transfer_id: transfer_id.to_string(),
        seq: 0,
        total: 2,
        fragment: r#"{"type":"shareItems","#.to_string(),
    };
    Signal::new(SIGNAL_CHUNK, encode_chunk(&chunk).expect("encode"))
}

#[tokio::test]
async fn shutdown_discards_partial_transfers_and_subscribers() {
    let pair = connected_pair();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let _stale = pair.guest.on_state_change(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    pair.host_bus
        .send(first_of_two_fragments("t-half"))
        .await
        .expect("send fragment");
    wait_until(|| pair.guest.pending_transfers() == 1).await;

    pair.guest.shutdown();
    assert_eq!(pair.guest.pending_transfers(), 0);

    let (host_end, guest_end) = LocalSignalBus::pair();
    pair.guest
        .init(SessionOptions::new(Arc::new(guest_end), Role::Guest, "customer-3", "session-2"))
        .expect("re-init");
    assert_eq!(pair.guest.pending_transfers(), 0);

    let remote = LocalAction::share_items(["p2"]).stamp_with(Role::Host, 7);
    assert!(pair.guest.on_remote_action(remote));
    pair.guest.toggle_compare("p2", true).expect("toggle");
    assert_eq!(pair.guest.get_state().shared_item_ids, vec!["p2"]);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    drop(host_end);
}

#[tokio::test]
async fn idle_partial_transfer_is_swept() {
    let config = SyncConfig::from_lookup(|var| match var {
        "COSTATE_REASSEMBLY_TIMEOUT_MS" => Some("300".to_string()),
        "COSTATE_SWEEP_INTERVAL_MS" => Some("20".to_string()),
        _ => None,
    });
    let pair = connected_pair_with(config);
    pair.host_bus
        .send(first_of_two_fragments("t-idle"))
        .await
        .expect("send fragment");
    wait_until(|| pair.guest.pending_transfers() == 1).await;
    wait_until(|| pair.guest.pending_transfers() == 0).await;
    assert!(pair.guest.get_state().shared_item_ids.is_empty());
}

#[tokio::test]
async fn explicit_foreign_origin_role_keeps_replicas_aligned() {
    let pair = connected_pair();
    let forged = LocalAction::share_items(["p1"]).from_role(Role::Guest);
    assert!(pair.host.apply_local_action(forged.clone()).is_none());
    let err = pair
        .host
        .apply_local_action_await(forged, None)
        .await
        .expect_err("refused");
    assert!(matches!(err, SyncError::Rejected(_)));

    pair.host
        .apply_local_action(LocalAction::share_items(["p3"]).from_role(Role::Host))
        .expect("own role");
    let state = wait_converged(&pair).await;
    assert_eq!(state.shared_item_ids, vec!["p3"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn callbacks_never_overlap_across_threads() {
    let pair = connected_pair();
    let running = Arc::new(AtomicUsize::new(0));
    let overlap = Arc::new(AtomicUsize::new(0));
    let last_seen: Arc<Mutex<Option<SyncState>>> = Arc::new(Mutex::new(None));
    let (run, over, last) = (Arc::clone(&running), Arc::clone(&overlap), Arc::clone(&last_seen));
    let _sub = pair.guest.on_state_change(move |state| {
        if run.fetch_add(1, Ordering::SeqCst) > 0 {
            over.fetch_add(1, Ordering::SeqCst);
        }
        std::thread::sleep(Duration::from_micros(200));
        *last.lock() = Some(state.clone());
        run.fetch_sub(1, Ordering::SeqCst);
    });

    let local = pair.guest.clone();
    let remote = pair.guest.clone();
    let writers = [
        std::thread::spawn(move || {
            for n in 0..40 {
                local.detail_action("local", object(json!({ "n": n })));
            }
        }),
        std::thread::spawn(move || {
            for n in 0..40u64 {
                let action = LocalAction::detail("remote", object(json!({ "n": n })))
                    .stamp_with(Role::Host, 1_000 + n);
                remote.on_remote_action(action);
            }
        }),
    ];
    for writer in writers {
        writer.join().expect("writer thread");
    }

    assert_eq!(overlap.load(Ordering::SeqCst), 0);
    assert_eq!(last_seen.lock().clone(), Some(pair.guest.get_state()));
}
