use std::sync::Arc;

use common::{
    persistence::ServerPersistence,
    testing::TestRuntime,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use sqlite::SqliteServerPersistence;
use storage::MemoryStorage;
use sync_types::{
    decode_chunk_frame,
    ClientPush,
    CommitSeq,
    OpResult,
    OpType,
    PartitionId,
    PullRequest,
    PushOperation,
    PushRequest,
    PushStatus,
    RowVersion,
    SchemaVersion,
    ScopeDimension,
    ScopeSelector,
    ScopeValues,
    SnapshotRow,
    SubscriptionRequest,
    SubscriptionUpdate,
};

use crate::{
    handlers::HandlerRegistry,
    JsonTableHandler,
    SyncContext,
    SyncularServer,
};

struct ServerTest {
    server: Arc<SyncularServer<TestRuntime>>,
    storage: Arc<MemoryStorage>,
    /// Swappable authorized selector, returned by the tasks handler's
    /// resolver.
    authorized: Arc<Mutex<ScopeSelector>>,
}

fn setup() -> ServerTest {
    let rt = TestRuntime::new();
    let persistence = Arc::new(SqliteServerPersistence::new_in_memory().unwrap());
    let storage = Arc::new(MemoryStorage::new());
    let authorized = Arc::new(Mutex::new(
        ScopeSelector::new().with("user_id", ScopeValues::Any),
    ));
    let resolver: crate::handlers::ScopeResolverFn = {
        let authorized = authorized.clone();
        Arc::new(move |_ctx: &SyncContext| Ok(authorized.lock().clone()))
    };
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(JsonTableHandler::new(
        "tasks",
        persistence.clone(),
        vec![ScopeDimension::from("user_id")],
        resolver.clone(),
    )));
    handlers.register(Arc::new(
        JsonTableHandler::new(
            "audit_log",
            persistence.clone(),
            vec![ScopeDimension::from("user_id")],
            resolver,
        )
        .read_only(),
    ));
    let server = Arc::new(SyncularServer::new(
        rt,
        persistence,
        storage.clone(),
        handlers,
        SchemaVersion(1),
    ));
    ServerTest {
        server,
        storage,
        authorized,
    }
}

fn ctx(client: &str) -> SyncContext {
    SyncContext::new("a1", client, PartitionId::global())
}

fn upsert(row_id: &str, payload: serde_json::Value, base_version: Option<u64>) -> PushOperation {
    PushOperation {
        table: "tasks".into(),
        row_id: row_id.into(),
        op: OpType::Upsert,
        payload: Some(payload),
        base_version: base_version.map(RowVersion),
    }
}

fn push_request(client: &str, ccid: &str, operations: Vec<PushOperation>) -> PushRequest {
    PushRequest {
        client_id: client.into(),
        push: ClientPush {
            client_commit_id: ccid.into(),
            schema_version: SchemaVersion(1),
            operations,
            partition_id: None,
        },
    }
}

fn subscription(id: &str, cursor: Option<u64>) -> SubscriptionRequest {
    SubscriptionRequest {
        id: id.into(),
        table: "tasks".into(),
        scopes: ScopeSelector::new().with("user_id", ScopeValues::Any),
        cursor: cursor.map(CommitSeq),
        bootstrap_state: None,
    }
}

/// Drive a subscription's bootstrap to completion, collecting every row.
async fn run_bootstrap(
    server: &SyncularServer<TestRuntime>,
    ctx: &SyncContext,
    mut subscription: SubscriptionRequest,
    limit: usize,
) -> anyhow::Result<(Vec<SnapshotRow>, CommitSeq, usize)> {
    let mut rows = Vec::new();
    let mut chunks = 0;
    loop {
        let response = server
            .pull(
                ctx,
                &PullRequest {
                    client_id: ctx.client_id.clone(),
                    subscriptions: vec![subscription.clone()],
                    limit_snapshot_rows: Some(limit),
                },
            )
            .await?;
        let update = &response.subscriptions[0];
        assert!(update.error.is_none(), "bootstrap errored: {update:?}");
        let chunk_ref = update
            .snapshot_chunk_ref
            .as_ref()
            .expect("bootstrap serves a chunk");
        let (_, body) = server.fetch_chunk(ctx, &chunk_ref.chunk_id).await?;
        rows.extend(decode_chunk_frame(
            &body,
            chunk_ref.encoding,
            chunk_ref.compression,
            &chunk_ref.sha256,
        )?);
        chunks += 1;
        match &update.next_bootstrap_state {
            Some(token) => subscription.bootstrap_state = Some(token.clone()),
            None => {
                let cursor = update.new_cursor.expect("bootstrap completion sets cursor");
                return Ok((rows, cursor, chunks));
            },
        }
    }
}

#[tokio::test]
async fn test_push_assigns_dense_sequences() -> anyhow::Result<()> {
    let t = setup();
    for (i, ccid) in ["c-1", "c-2", "c-3"].iter().enumerate() {
        let response = t
            .server
            .push(
                &ctx("client-a"),
                &push_request(
                    "client-a",
                    ccid,
                    vec![upsert(&format!("t{i}"), json!({"title": "x", "user_id": "u1"}), None)],
                ),
            )
            .await?;
        assert_eq!(response.status, PushStatus::Applied);
        assert_eq!(response.commit_seq, Some(CommitSeq(i as u64 + 1)));
    }
    Ok(())
}

#[tokio::test]
async fn test_idempotent_retry_applies_once() -> anyhow::Result<()> {
    let t = setup();
    let request = push_request(
        "client-a",
        "retry-test",
        vec![upsert("t1", json!({"title": "x", "user_id": "u1"}), None)],
    );
    let mut applied = 0;
    let mut cached = 0;
    let mut first_results = None;
    for _ in 0..100 {
        let response = t.server.push(&ctx("client-a"), &request).await?;
        match response.status {
            PushStatus::Applied => applied += 1,
            PushStatus::Cached => cached += 1,
            other => panic!("unexpected status {other:?}"),
        }
        // Replays carry the original per-op results verbatim.
        match &first_results {
            None => first_results = Some(response.per_op_results.clone()),
            Some(first) => assert_eq!(&response.per_op_results, first),
        }
    }
    assert_eq!((applied, cached), (1, 99));
    assert_eq!(
        t.server.persistence().max_commit_seq(&PartitionId::global())?,
        CommitSeq(1)
    );
    Ok(())
}

#[tokio::test]
async fn test_conflict_surfaces_server_row() -> anyhow::Result<()> {
    let t = setup();
    t.server
        .push(
            &ctx("client-a"),
            &push_request(
                "client-a",
                "a-1",
                vec![upsert("t1", json!({"title": "theirs", "user_id": "u1"}), None)],
            ),
        )
        .await?;

    // A different client writes with a stale base version.
    let response = t
        .server
        .push(
            &ctx("client-b"),
            &push_request(
                "client-b",
                "b-1",
                vec![upsert("t1", json!({"title": "mine", "user_id": "u1"}), Some(7))],
            ),
        )
        .await?;
    assert_eq!(response.status, PushStatus::Conflict);
    assert_eq!(response.commit_seq, None);
    let OpResult::Conflict {
        server_version,
        server_row,
    } = &response.per_op_results[0].result
    else {
        panic!("expected conflict result");
    };
    assert_eq!(*server_version, Some(RowVersion(1)));
    assert_eq!(server_row.as_ref().unwrap()["title"], "theirs");

    // Nothing was applied and no commit was appended.
    let row = t
        .server
        .persistence()
        .load_row(&"tasks".into(), &"t1".into())?
        .unwrap();
    assert_eq!(row.row_json["title"], "theirs");
    assert_eq!(
        t.server.persistence().max_commit_seq(&PartitionId::global())?,
        CommitSeq(1)
    );
    Ok(())
}

#[tokio::test]
async fn test_self_conflict_avoidance() -> anyhow::Result<()> {
    let t = setup();
    let c = ctx("client-a");
    t.server
        .push(
            &c,
            &push_request(
                "client-a",
                "insert",
                vec![upsert("t1", json!({"title": "v1", "user_id": "u1"}), None)],
            ),
        )
        .await?;
    // Five pipelined updates, all declaring the version the client last saw.
    for i in 0..5 {
        let response = t
            .server
            .push(
                &c,
                &push_request(
                    "client-a",
                    &format!("update-{i}"),
                    vec![upsert(
                        "t1",
                        json!({"title": format!("v{}", i + 2), "user_id": "u1"}),
                        Some(1),
                    )],
                ),
            )
            .await?;
        assert_eq!(response.status, PushStatus::Applied);
    }
    let row = t
        .server
        .persistence()
        .load_row(&"tasks".into(), &"t1".into())?
        .unwrap();
    assert_eq!(row.row_version, RowVersion(6));
    Ok(())
}

#[tokio::test]
async fn test_parallel_load_counts_every_commit() -> anyhow::Result<()> {
    let t = setup();
    let mut handles = Vec::new();
    for client in 0..10 {
        let server = t.server.clone();
        handles.push(tokio::spawn(async move {
            let client_id = format!("client-{client}");
            let c = ctx(&client_id);
            for i in 0..100 {
                let response = server
                    .push(
                        &c,
                        &push_request(
                            &client_id,
                            &format!("{client_id}-{i}"),
                            vec![upsert(
                                &format!("row-{client_id}-{i}"),
                                json!({"title": "load", "user_id": "u1"}),
                                None,
                            )],
                        ),
                    )
                    .await?;
                anyhow::ensure!(response.status == PushStatus::Applied);
            }
            Ok::<_, anyhow::Error>(())
        }));
    }
    for handle in handles {
        handle.await??;
    }
    assert_eq!(
        t.server.persistence().max_commit_seq(&PartitionId::global())?,
        CommitSeq(1000)
    );
    Ok(())
}

#[tokio::test]
async fn test_read_only_and_unknown_tables_are_rejected() -> anyhow::Result<()> {
    let t = setup();
    let response = t
        .server
        .push(
            &ctx("client-a"),
            &push_request(
                "client-a",
                "ro-1",
                vec![PushOperation {
                    table: "audit_log".into(),
                    row_id: "e1".into(),
                    op: OpType::Upsert,
                    payload: Some(json!({"event": "x"})),
                    base_version: None,
                }],
            ),
        )
        .await?;
    assert_eq!(response.status, PushStatus::Error);
    assert_eq!(response.error.as_ref().unwrap().code, "READ_ONLY");

    let response = t
        .server
        .push(
            &ctx("client-a"),
            &push_request(
                "client-a",
                "unk-1",
                vec![PushOperation {
                    table: "nope".into(),
                    row_id: "r1".into(),
                    op: OpType::Upsert,
                    payload: Some(json!({})),
                    base_version: None,
                }],
            ),
        )
        .await?;
    assert_eq!(response.status, PushStatus::Error);
    let error = response.error.unwrap();
    assert_eq!(error.code, "UNKNOWN_TABLE");
    assert!(!error.retriable);
    Ok(())
}

#[tokio::test]
async fn test_schema_version_mismatch_is_rejected() -> anyhow::Result<()> {
    let t = setup();
    let mut request = push_request(
        "client-a",
        "schema-1",
        vec![upsert("t1", json!({"user_id": "u1"}), None)],
    );
    request.push.schema_version = SchemaVersion(9);
    let response = t.server.push(&ctx("client-a"), &request).await?;
    assert_eq!(response.status, PushStatus::Error);
    let error = response.error.unwrap();
    assert_eq!(error.code, "INVALID_REQUEST");
    assert!(!error.retriable);
    Ok(())
}

#[tokio::test]
async fn test_bootstrap_pages_and_cursor_handoff() -> anyhow::Result<()> {
    let t = setup();
    let c = ctx("writer");
    for i in 0..25 {
        t.server
            .push(
                &c,
                &push_request(
                    "writer",
                    &format!("seed-{i}"),
                    vec![upsert(
                        &format!("t{i:02}"),
                        json!({"title": format!("task {i}"), "user_id": "u1"}),
                        None,
                    )],
                ),
            )
            .await?;
    }

    let reader = ctx("reader");
    let (rows, cursor, chunks) =
        run_bootstrap(&t.server, &reader, subscription("s1", None), 10).await?;
    assert_eq!(rows.len(), 25);
    assert_eq!(chunks, 3);
    assert_eq!(cursor, CommitSeq(25));

    // Steady state after bootstrap: new pushes arrive as changes.
    t.server
        .push(
            &c,
            &push_request(
                "writer",
                "post-bootstrap",
                vec![upsert("t99", json!({"title": "new", "user_id": "u1"}), None)],
            ),
        )
        .await?;
    let response = t
        .server
        .pull(
            &reader,
            &PullRequest {
                client_id: reader.client_id.clone(),
                subscriptions: vec![subscription("s1", Some(cursor.0))],
                limit_snapshot_rows: None,
            },
        )
        .await?;
    let update = &response.subscriptions[0];
    assert_eq!(update.changes.len(), 1);
    assert_eq!(update.changes[0].row_id, "t99".into());
    assert_eq!(update.new_cursor, Some(CommitSeq(26)));
    Ok(())
}

#[tokio::test]
async fn test_scope_confinement() -> anyhow::Result<()> {
    let t = setup();
    let c = ctx("writer");
    t.server
        .push(
            &c,
            &push_request(
                "writer",
                "mine",
                vec![upsert("t1", json!({"title": "mine", "user_id": "u1"}), None)],
            ),
        )
        .await?;
    t.server
        .push(
            &c,
            &push_request(
                "writer",
                "theirs",
                vec![upsert("t2", json!({"title": "theirs", "user_id": "u2"}), None)],
            ),
        )
        .await?;

    let reader = ctx("reader");
    let mut narrow = subscription("s-narrow", Some(0));
    narrow.scopes = ScopeSelector::new().with("user_id", ScopeValues::one("u1"));
    let response = t
        .server
        .pull(
            &reader,
            &PullRequest {
                client_id: reader.client_id.clone(),
                subscriptions: vec![narrow],
                limit_snapshot_rows: None,
            },
        )
        .await?;
    let update = &response.subscriptions[0];
    assert_eq!(update.changes.len(), 1);
    assert_eq!(update.changes[0].row_id, "t1".into());
    // The cursor still advances past commits whose changes were filtered.
    assert_eq!(update.new_cursor, Some(CommitSeq(2)));
    Ok(())
}

#[tokio::test]
async fn test_contraction_forces_resync() -> anyhow::Result<()> {
    let t = setup();
    let c = ctx("writer");
    t.server
        .push(
            &c,
            &push_request(
                "writer",
                "seed",
                vec![upsert("t1", json!({"title": "x", "user_id": "u1"}), None)],
            ),
        )
        .await?;

    let reader = ctx("reader");
    // Establish the subscription baseline via bootstrap.
    let (_, cursor, _) = run_bootstrap(&t.server, &reader, subscription("s1", None), 10).await?;

    // The actor loses access to everything but u2.
    *t.authorized.lock() = ScopeSelector::new().with("user_id", ScopeValues::one("u2"));

    let response = t
        .server
        .pull(
            &reader,
            &PullRequest {
                client_id: reader.client_id.clone(),
                subscriptions: vec![subscription("s1", Some(cursor.0))],
                limit_snapshot_rows: None,
            },
        )
        .await?;
    let update = &response.subscriptions[0];
    assert!(update.resync_required);
    assert!(update.changes.is_empty());
    assert_eq!(update.new_cursor, None);
    Ok(())
}

#[tokio::test]
async fn test_widening_bootstraps_only_the_delta() -> anyhow::Result<()> {
    let t = setup();
    let c = ctx("writer");
    for (row, user) in [("t1", "u1"), ("t2", "u2")] {
        t.server
            .push(
                &c,
                &push_request(
                    "writer",
                    &format!("seed-{row}"),
                    vec![upsert(row, json!({"title": row, "user_id": user}), None)],
                ),
            )
            .await?;
    }

    let reader = ctx("reader");
    let mut narrow = subscription("s1", None);
    narrow.scopes = ScopeSelector::new().with("user_id", ScopeValues::one("u1"));
    let (rows, cursor, _) = run_bootstrap(&t.server, &reader, narrow, 10).await?;
    assert_eq!(rows.len(), 1);

    // The subscription widens to both users: the next pull serves a delta
    // bootstrap containing only u2's rows, preserving the cursor.
    let mut wide = subscription("s1", Some(cursor.0));
    wide.scopes = ScopeSelector::new().with(
        "user_id",
        ScopeValues::Values(["u1".into(), "u2".into()].into()),
    );
    let (delta_rows, after_cursor, _) =
        run_bootstrap(&t.server, &reader, wide, 10).await?;
    assert_eq!(delta_rows.len(), 1);
    assert_eq!(delta_rows[0].row_id, "t2".into());
    assert_eq!(after_cursor, cursor);
    Ok(())
}

#[tokio::test]
async fn test_identical_chunk_bodies_are_stored_once() -> anyhow::Result<()> {
    let t = setup();
    *t.authorized.lock() = ScopeSelector::new()
        .with("user_id", ScopeValues::Any)
        .with("project_id", ScopeValues::Any);
    let c = ctx("writer");
    t.server
        .push(
            &c,
            &push_request(
                "writer",
                "seed",
                vec![upsert("t1", json!({"title": "x", "user_id": "u1"}), None)],
            ),
        )
        .await?;

    // Two selectors with different scope keys that see identical rows.
    let reader = ctx("reader");
    let mut first = subscription("s1", None);
    first.scopes = ScopeSelector::new().with("user_id", ScopeValues::one("u1"));
    let mut second = subscription("s2", None);
    second.scopes = ScopeSelector::new()
        .with("user_id", ScopeValues::one("u1"))
        .with("project_id", ScopeValues::Any);

    let (rows_a, _, _) = run_bootstrap(&t.server, &reader, first, 10).await?;
    let (rows_b, _, _) = run_bootstrap(&t.server, &reader, second, 10).await?;
    assert_eq!(rows_a.len(), 1);
    assert_eq!(rows_b.len(), 1);
    // Same decoded bytes, one content-addressed body.
    assert_eq!(t.storage.object_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_partitions_sequence_independently() -> anyhow::Result<()> {
    let t = setup();
    let c = ctx("client-a");
    for (partition, ccid) in [("p-alpha", "a-1"), ("p-beta", "b-1"), ("p-alpha", "a-2")] {
        let mut request = push_request(
            "client-a",
            ccid,
            vec![upsert(
                &format!("{partition}-{ccid}"),
                json!({"title": "x", "user_id": "u1"}),
                None,
            )],
        );
        request.push.partition_id = Some(partition.into());
        let response = t.server.push(&c, &request).await?;
        assert_eq!(response.status, PushStatus::Applied);
    }
    assert_eq!(
        t.server.persistence().max_commit_seq(&"p-alpha".into())?,
        CommitSeq(2)
    );
    assert_eq!(
        t.server.persistence().max_commit_seq(&"p-beta".into())?,
        CommitSeq(1)
    );
    Ok(())
}

#[tokio::test]
async fn test_wake_signals_published_on_commit() -> anyhow::Result<()> {
    let t = setup();
    let mut wake = t.server.subscribe_wake();
    t.server
        .push(
            &ctx("client-a"),
            &push_request(
                "client-a",
                "wake-1",
                vec![upsert("t1", json!({"title": "x", "user_id": "u1"}), None)],
            ),
        )
        .await?;
    let signal = wake.recv().await?;
    assert_eq!(signal.partition_id, PartitionId::global());
    assert_eq!(signal.commit_seq, CommitSeq(1));
    Ok(())
}

fn assert_no_error(update: &SubscriptionUpdate) {
    assert!(update.error.is_none(), "unexpected error: {update:?}");
}

#[tokio::test]
async fn test_expired_chunk_serves_by_id_until_collected() -> anyhow::Result<()> {
    let t = setup();
    let c = ctx("writer");
    t.server
        .push(
            &c,
            &push_request(
                "writer",
                "seed",
                vec![upsert("t1", json!({"title": "x", "user_id": "u1"}), None)],
            ),
        )
        .await?;

    let reader = ctx("reader");
    let response = t
        .server
        .pull(
            &reader,
            &PullRequest {
                client_id: reader.client_id.clone(),
                subscriptions: vec![subscription("s1", None)],
                limit_snapshot_rows: Some(10),
            },
        )
        .await?;
    let update = &response.subscriptions[0];
    assert_no_error(update);
    let chunk_ref = update.snapshot_chunk_ref.clone().unwrap();

    // Past expiry, the id still serves until the GC pass collects it.
    t.server
        .rt
        .advance_time(std::time::Duration::from_secs(7200));
    assert!(t.server.fetch_chunk(&reader, &chunk_ref.chunk_id).await.is_ok());

    let collected = t.server.cleanup_expired_chunks().await?;
    assert_eq!(collected, 1);
    let err = t
        .server
        .fetch_chunk(&reader, &chunk_ref.chunk_id)
        .await
        .unwrap_err();
    use errors::ErrorMetadataAnyhowExt;
    assert_eq!(err.short_msg(), Some("BOOTSTRAP_EXPIRED"));
    Ok(())
}
