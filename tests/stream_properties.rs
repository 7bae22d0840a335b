mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{Wallet, WalletEvent, deposit, wallet_registry};
use eventstream::{
    EventEnvelope, EventLog, MemoryEventLog, MemorySnapshotStore, PoliciesConfig, PostOptions,
    ProjectionError, ProjectionRouter, STREAM_INITIALIZED, SnapshotPolicy, SnapshotStore,
    StreamCache, StreamError, StreamHandle, Triggers,
};

struct Stores {
    events: Arc<MemoryEventLog>,
    snapshots: Arc<MemorySnapshotStore>,
}

impl Stores {
    fn new() -> Self {
        Self {
            events: Arc::new(MemoryEventLog::new()),
            snapshots: Arc::new(MemorySnapshotStore::new()),
        }
    }

    fn registry(&self, policies: PoliciesConfig) -> Arc<eventstream::StreamRegistry<Wallet>> {
        wallet_registry(
            self.events.clone(),
            self.snapshots.clone(),
            policies,
            ProjectionRouter::new(),
        )
    }
}

#[tokio::test]
async fn seqs_are_contiguous_across_many_writes() {
    let stores = Stores::new();
    let mut handle = StreamHandle::open(stores.registry(PoliciesConfig::default()), "w1")
        .await
        .expect("open should succeed");

    let mut posted = 0;
    for batch in 1..=5 {
        let events = (0..batch).map(|n| EventEnvelope::new(deposit(n))).collect();
        let outcome = handle
            .post_events(events, PostOptions::only_when_current())
            .await
            .expect("post should succeed");
        assert!(outcome.success);
        posted += batch;
    }

    let log = stores.events.records("w1").await;
    assert_eq!(log.len() as i64, posted + 1);
    assert_eq!(log[0].event_type, STREAM_INITIALIZED);
    for (expected, record) in log.iter().enumerate() {
        assert_eq!(record.seq, expected as i64);
    }
}

#[tokio::test]
async fn two_handles_on_one_stream() {
    let stores = Stores::new();
    let registry = stores.registry(PoliciesConfig::default());
    let mut first = StreamHandle::open(Arc::clone(&registry), "w1")
        .await
        .expect("open");
    let mut second = StreamHandle::open(Arc::clone(&registry), "w1")
        .await
        .expect("open");

    first
        .post_event(deposit(100), PostOptions::only_when_current())
        .await
        .expect("post");

    let refused = second
        .post_event(deposit(5), PostOptions::only_when_current())
        .await
        .expect("post");
    assert!(!refused.success);

    let state = second.get_copy_of_state(Some(true)).await.expect("refresh");
    assert_eq!(state.balance, 100);

    let accepted = second
        .post_event(deposit(5), PostOptions::only_when_current())
        .await
        .expect("post");
    assert!(accepted.success);
    assert_eq!(accepted.state.expect("state").balance, 105);
}

#[tokio::test]
async fn snapshot_interval_counts_events_not_calls() {
    let stores = Stores::new();
    let policies = PoliciesConfig {
        snapshot_policy: SnapshotPolicy::AfterIntervalDeltas(4),
        ..PoliciesConfig::default()
    };
    let mut handle = StreamHandle::open(stores.registry(policies), "w1")
        .await
        .expect("open");

    handle
        .post_events(
            (1..=3).map(|n| EventEnvelope::new(deposit(n))).collect(),
            PostOptions::default(),
        )
        .await
        .expect("post");
    let snapshot = stores.snapshots.read("w1").await.expect("read").expect("snapshot");
    assert_eq!(snapshot.seq, 0);

    handle
        .post_event(deposit(4), PostOptions::default())
        .await
        .expect("post");
    let snapshot = stores.snapshots.read("w1").await.expect("read").expect("snapshot");
    assert_eq!(snapshot.seq, 4);
    let state: Wallet = serde_json::from_value(snapshot.state).expect("decode");
    assert_eq!(state.balance, 10);
}

#[tokio::test]
async fn cache_reinitializes_evicted_streams_from_the_log() {
    let stores = Stores::new();
    let policies = PoliciesConfig {
        default_queue_size: 2,
        ..PoliciesConfig::default()
    };
    let mut cache = StreamCache::new(stores.registry(policies));

    cache
        .post_event("A", deposit(10), PostOptions::default())
        .await
        .expect("post A");
    cache.get("B").await.expect("get B");
    cache.get("C").await.expect("get C");
    assert_eq!(cache.list_ids(), vec!["B", "C"]);

    let state = cache.get_copy_of_state("A", None).await.expect("read A");
    assert_eq!(state.balance, 10);
    assert_eq!(stores.events.records("A").await.len(), 2);
}

#[tokio::test]
async fn projections_fire_once_per_cycle_and_never_fail_writes() {
    let deposits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&deposits);
    let router = ProjectionRouter::<Wallet>::new()
        .register(
            "ledger",
            Triggers::events(["Deposited", "Withdrawn"]),
            move |_wallet| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), ProjectionError>(())
                }
            },
        )
        .expect("register")
        .register("audit", Triggers::events(["Withdrawn"]), |_wallet| async {
            Err::<(), ProjectionError>("audit sink offline".into())
        })
        .expect("register");

    let stores = Stores::new();
    let registry = wallet_registry(
        stores.events.clone(),
        stores.snapshots.clone(),
        PoliciesConfig::default(),
        router,
    );
    let mut handle = StreamHandle::open(registry, "w1").await.expect("open");

    let outcome = handle
        .post_events(
            vec![
                EventEnvelope::new(deposit(50)),
                EventEnvelope::new(WalletEvent::Withdrawn { amount: 20 }),
            ],
            PostOptions::default(),
        )
        .await
        .expect("post should succeed despite the failing projection");
    assert!(outcome.success);
    assert_eq!(deposits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn registering_an_undeclared_trigger_fails() {
    let result = ProjectionRouter::<Wallet>::new().register(
        "typo",
        Triggers::events(["Deposit"]),
        |_wallet| async { Ok::<(), ProjectionError>(()) },
    );
    assert!(matches!(result, Err(StreamError::Configuration(_))));
}

#[tokio::test]
async fn missing_snapshot_replays_the_whole_log() {
    let stores = Stores::new();
    let registry = stores.registry(PoliciesConfig::default());

    // The stream exists but this reader sees no snapshot at all.
    let mut writer = StreamHandle::open(Arc::clone(&registry), "w1")
        .await
        .expect("open");
    writer
        .post_event(
            WalletEvent::Opened {
                owner: "ada".into(),
            },
            PostOptions::default(),
        )
        .await
        .expect("post");
    let fresh = Stores {
        events: stores.events.clone(),
        snapshots: Arc::new(MemorySnapshotStore::new()),
    };

    let reader = StreamHandle::open(fresh.registry(PoliciesConfig::default()), "w1")
        .await
        .expect("open");
    assert_eq!(reader.seq().expect("seq"), 1);
    assert_eq!(
        stores.events.max_seq("w1").await.expect("max_seq"),
        1,
        "no second StreamInitialized"
    );
}
