use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tidemark_core::schema::{SYSTEM_ID, SYSTEM_IS_LOCAL_ORIGIN, SYSTEM_VERSION};
use tidemark_core::{row, ColumnDef, LogicalType, NodeId, Schema, TableSchema, Timestamp, Value};
use tidemark_store::{ConstraintPolicy, Error, Predicate, StoreConfig, SyncStore};
use tokio_test::{assert_err, assert_ok};

fn schema() -> Schema {
    Schema::new().with_table(TableSchema::new(
        "tasks",
        vec![
            ColumnDef::new("title", LogicalType::Text).lww(),
            ColumnDef::new("priority", LogicalType::Integer),
        ],
    ))
}

fn manual_clock(start_ms: u64) -> (Arc<AtomicU64>, tidemark_core::TimeSource) {
    let wall = Arc::new(AtomicU64::new(start_ms));
    let source = Arc::clone(&wall);
    (wall, Arc::new(move || source.load(Ordering::SeqCst)))
}

fn version_of(row: &tidemark_core::Row) -> Timestamp {
    row[SYSTEM_VERSION].as_timestamp().unwrap().unwrap()
}

#[tokio::test]
async fn stale_remote_title_is_rejected() {
    let (_wall, source) = manual_clock(1_000);
    let store = SyncStore::open_with_time_source(
        &StoreConfig::in_memory().with_node_id(NodeId::new("node-a").unwrap()),
        schema(),
        source,
    )
    .unwrap();

    let clock = store.clock();
    let t1 = clock.now();
    let t2 = clock.now();
    let t3 = clock.now();
    assert!(t1 < t2 && t2 < t3);

    let pipeline = store.pipeline();
    let id = pipeline
        .insert("tasks", row! { "title" => "x" })
        .await
        .unwrap();

    let stored = pipeline.get("tasks", &id).await.unwrap().unwrap();
    let inserted_at = version_of(&stored);
    assert!(inserted_at > t3);
    assert_eq!(stored["title"], Value::from("x"));
    assert_eq!(stored["title__hlc"], Value::from(&inserted_at));
    assert_eq!(stored[SYSTEM_IS_LOCAL_ORIGIN], Value::Integer(1));
    assert_eq!(store.outbox().len().await.unwrap(), 1);

    let t0 = Timestamp::new(500, 0, NodeId::new("server").unwrap());
    let report = store
        .reconciler()
        .bulk_load(
            "tasks",
            vec![row! { SYSTEM_ID => id.as_str(), "title" => "y", "title__hlc" => &t0 }],
            ConstraintPolicy::AbortBatch,
        )
        .await
        .unwrap();

    assert_eq!(report.unchanged, 1);
    let after = pipeline.get("tasks", &id).await.unwrap().unwrap();
    assert_eq!(after["title"], Value::from("x"));
    assert_eq!(after["title__hlc"], Value::from(&inserted_at));
    assert_eq!(store.outbox().len().await.unwrap(), 1);
}

#[tokio::test]
async fn newer_remote_title_wins_and_is_not_echoed() {
    let store = SyncStore::in_memory(schema()).unwrap();
    let pipeline = store.pipeline();
    let id = pipeline
        .insert("tasks", row! { "title" => "A", "priority" => 1 })
        .await
        .unwrap();
    let pending = store.outbox().get_all().await.unwrap();

    let remote = Timestamp::new(u64::MAX / 2, 0, NodeId::new("server").unwrap());
    store
        .reconciler()
        .bulk_load(
            "tasks",
            vec![
                row! {
                    SYSTEM_ID => id.as_str(),
                    "title" => "B",
                    "title__hlc" => &remote,
                    SYSTEM_VERSION => &remote,
                },
                row! { SYSTEM_ID => "pulled", "title" => "C", "priority" => 3 },
            ],
            ConstraintPolicy::AbortBatch,
        )
        .await
        .unwrap();

    let merged = pipeline.get("tasks", &id).await.unwrap().unwrap();
    assert_eq!(merged["title"], Value::from("B"));
    assert_eq!(version_of(&merged), remote);
    assert_eq!(store.outbox().get_all().await.unwrap(), pending);
}

#[tokio::test]
async fn every_affected_row_gets_one_outbox_entry() {
    let store = SyncStore::in_memory(schema()).unwrap();
    let pipeline = store.pipeline();

    let mut ids = Vec::new();
    for priority in 0..4 {
        ids.push(
            pipeline
                .insert("tasks", row! { "title" => "t", "priority" => priority })
                .await
                .unwrap(),
        );
    }
    let updated = pipeline
        .update(
            "tasks",
            row! { "priority" => 9 },
            &Predicate::Lt("priority".into(), Value::Integer(3)),
        )
        .await
        .unwrap();
    let deleted = pipeline
        .delete("tasks", &Predicate::eq("priority", 9))
        .await
        .unwrap();

    assert_eq!(updated, 3);
    assert_eq!(deleted, 3);

    let entries = store.outbox().get_all().await.unwrap();
    assert_eq!(entries.len(), 4 + 3 + 3);
    assert!(entries.iter().all(|e| ids.contains(&e.row_id)));
    assert_eq!(entries.iter().filter(|e| e.is_tombstone()).count(), 3);

    let acked = store.outbox().remove(&entries[..4]).await.unwrap();
    assert_eq!(acked, 4);
    assert_eq!(store.outbox().len().await.unwrap(), 6);
}

#[tokio::test]
async fn illegal_write_mutates_nothing() {
    let store = SyncStore::in_memory(schema()).unwrap();
    store
        .reconciler()
        .bulk_load(
            "tasks",
            vec![row! { SYSTEM_ID => "remote", "title" => "R", "priority" => 1 }],
            ConstraintPolicy::AbortBatch,
        )
        .await
        .unwrap();
    let before = store.pipeline().get("tasks", "remote").await.unwrap();

    let result = store
        .pipeline()
        .update(
            "tasks",
            row! { "title" => "edited", "priority" => 2 },
            &Predicate::eq(SYSTEM_ID, "remote"),
        )
        .await;

    assert!(matches!(
        assert_err!(result),
        Error::IllegalColumnWrite { ref column, .. } if column == "priority"
    ));
    assert_eq!(store.pipeline().get("tasks", "remote").await.unwrap(), before);
    assert!(store.outbox().is_empty().await.unwrap());
}

#[tokio::test]
async fn outbox_and_node_id_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::file(dir.path().join("tidemark.db"))
        .with_node_id(NodeId::new("device-1").unwrap());

    let (wall, source) = manual_clock(1_000_000);
    let remote_hlc = Timestamp::new(5_000_000, 0, NodeId::new("server").unwrap());
    let last_hlc = {
        let store = SyncStore::open_with_time_source(&config, schema(), source).unwrap();
        let pipeline = store.pipeline();
        let id = assert_ok!(pipeline.insert("tasks", row! { "title" => "keep" }).await);
        assert_ok!(
            pipeline
                .update("tasks", row! { "title" => "kept" }, &Predicate::eq(SYSTEM_ID, id.as_str()))
                .await
        );

        // A server write from the future, carrying only its column shadow.
        assert_ok!(
            store
                .reconciler()
                .bulk_load(
                    "tasks",
                    vec![row! {
                        SYSTEM_ID => "pulled",
                        "title" => "server",
                        "title__hlc" => &remote_hlc,
                    }],
                    ConstraintPolicy::AbortBatch,
                )
                .await
        );
        store.outbox().get_all().await.unwrap().pop().unwrap().hlc
    };

    // The wall clock stepped backwards while the app was closed.
    wall.store(10, Ordering::SeqCst);
    let reopened = SyncStore::open_with_time_source(
        &config.clone().with_node_id(NodeId::new("device-2").unwrap()),
        schema(),
        Arc::new(move || wall.load(Ordering::SeqCst)),
    )
    .unwrap();

    assert_eq!(reopened.node_id().as_str(), "device-1");
    assert_eq!(reopened.outbox().len().await.unwrap(), 2);
    let now = reopened.clock().now();
    assert!(now > last_hlc);
    assert!(now > remote_hlc);

    let pipeline = reopened.pipeline();
    let pulled = pipeline.get("tasks", "pulled").await.unwrap().unwrap();
    assert_eq!(version_of(&pulled), remote_hlc);

    // A local edit after restart still beats the absorbed server write.
    let changed = assert_ok!(
        pipeline
            .update("tasks", row! { "title" => "mine" }, &Predicate::eq(SYSTEM_ID, "pulled"))
            .await
    );
    assert_eq!(changed, 1);
    let pulled = pipeline.get("tasks", "pulled").await.unwrap().unwrap();
    assert_eq!(pulled["title"], Value::from("mine"));

    let others = Predicate::Ne(SYSTEM_ID.into(), Value::from("pulled"));
    let kept = assert_ok!(pipeline.query("tasks", &others).await);
    assert_eq!(kept[0]["title"], Value::from("kept"));
}

#[tokio::test]
async fn issued_timestamps_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::file(dir.path().join("tidemark.db"));

    let (wall, source) = manual_clock(2_000);
    let issued = {
        let store = SyncStore::open_with_time_source(&config, schema(), source).unwrap();
        assert_ok!(store.issue_timestamp().await)
    };

    let reopened = SyncStore::open_with_time_source(
        &config,
        schema(),
        Arc::new(move || wall.load(Ordering::SeqCst)),
    )
    .unwrap();
    assert!(assert_ok!(reopened.issue_timestamp().await) > issued);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_inserts_get_distinct_ordered_hlcs() {
    let store = SyncStore::in_memory(schema()).unwrap();

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let pipeline = store.pipeline();
            tokio::spawn(async move {
                pipeline
                    .insert("tasks", row! { "title" => format!("t{i}") })
                    .await
            })
        })
        .collect();
    for handle in handles {
        assert_ok!(handle.await.unwrap());
    }

    let entries = store.outbox().get_all().await.unwrap();
    assert_eq!(entries.len(), 16);
    // Stamped under the write lock, so sequence order and HLC order agree.
    assert!(entries.windows(2).all(|w| w[0].hlc < w[1].hlc));
}

#[tokio::test]
async fn subscribers_are_notified_after_commit() {
    let store = SyncStore::in_memory(schema()).unwrap();
    let mut events = store.outbox().subscribe();
    let pipeline = store.pipeline();

    let id = pipeline
        .insert("tasks", row! { "title" => "A" })
        .await
        .unwrap();
    pipeline
        .delete("tasks", &Predicate::eq(SYSTEM_ID, id.as_str()))
        .await
        .unwrap();
    store
        .reconciler()
        .bulk_load(
            "tasks",
            vec![row! { SYSTEM_ID => "pulled", "title" => "B" }],
            ConstraintPolicy::SkipRow,
        )
        .await
        .unwrap();

    let inserted = events.recv().await.unwrap();
    let deleted = events.recv().await.unwrap();
    assert_eq!(inserted.row_id, id);
    assert!(deleted.is_tombstone());
    assert!(events.try_recv().is_err());
}
