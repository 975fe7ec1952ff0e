use std::{
    collections::BTreeSet,
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    persistence::{
        ActorIdOrSystem,
        ClientPersistence,
        CommitRow,
        OutboxState,
        PushOutcomeRow,
        RowWrite,
        ServerPersistence,
        StoredRow,
    },
    runtime::Runtime,
    testing::TestRuntime,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use sqlite::{
    SqliteClientPersistence,
    SqliteServerPersistence,
};
use storage::MemoryStorage;
use sync_server::{
    handlers::{
        HandlerRegistry,
        ScopeResolverFn,
    },
    JsonTableHandler,
    SyncContext,
    SyncularServer,
};
use sync_types::{
    ChunkId,
    CommitSeq,
    OpType,
    PartitionId,
    PullRequest,
    PullResponse,
    PushOperation,
    PushRequest,
    PushResponse,
    RowVersion,
    SchemaVersion,
    ScopeDimension,
    ScopeSelector,
    ScopeValue,
    ScopeValues,
    WakeSignal,
};
use tokio::sync::broadcast;

use crate::{
    SubscriptionSpec,
    SyncularClient,
    Transport,
};

/// In-process loopback transport with fault injection for the bootstrap
/// interruption scenarios.
struct LocalTransport {
    server: Arc<SyncularServer<TestRuntime>>,
    ctx: SyncContext,
    /// Fail this many chunk fetches before recovering.
    fail_chunk_fetches: Mutex<u32>,
    /// Corrupt the body of this many chunk fetches.
    corrupt_chunk_fetches: Mutex<u32>,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn push(&self, request: PushRequest) -> anyhow::Result<PushResponse> {
        self.server.push(&self.ctx, &request).await
    }

    async fn pull(&self, request: PullRequest) -> anyhow::Result<PullResponse> {
        self.server.pull(&self.ctx, &request).await
    }

    async fn fetch_chunk(&self, chunk_id: &ChunkId) -> anyhow::Result<Bytes> {
        {
            let mut failures = self.fail_chunk_fetches.lock();
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("connection reset mid-transfer");
            }
        }
        let (_, body) = self.server.fetch_chunk(&self.ctx, chunk_id).await?;
        let mut corruptions = self.corrupt_chunk_fetches.lock();
        if *corruptions > 0 {
            *corruptions -= 1;
            // Truncation: checksum verification must catch this.
            return Ok(body.slice(..body.len() / 2));
        }
        Ok(body)
    }

    fn wake_signals(&self) -> Option<broadcast::Receiver<WakeSignal>> {
        Some(self.server.subscribe_wake())
    }
}

struct Harness {
    rt: TestRuntime,
    server: Arc<SyncularServer<TestRuntime>>,
    authorized: Arc<Mutex<ScopeSelector>>,
}

struct TestClient {
    client: Arc<SyncularClient<TestRuntime>>,
    transport: Arc<LocalTransport>,
}

fn harness() -> Harness {
    let rt = TestRuntime::new();
    let persistence = Arc::new(SqliteServerPersistence::new_in_memory().unwrap());
    let storage = Arc::new(MemoryStorage::new());
    let authorized = Arc::new(Mutex::new(
        ScopeSelector::new().with("user_id", ScopeValues::Any),
    ));
    let resolver: ScopeResolverFn = {
        let authorized = authorized.clone();
        Arc::new(move |_ctx: &SyncContext| Ok(authorized.lock().clone()))
    };
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(JsonTableHandler::new(
        "tasks",
        persistence.clone(),
        vec![ScopeDimension::from("user_id")],
        resolver,
    )));
    let server = Arc::new(SyncularServer::new(
        rt.clone(),
        persistence,
        storage,
        handlers,
        SchemaVersion(1),
    ));
    Harness {
        rt,
        server,
        authorized,
    }
}

impl Harness {
    fn client(&self, name: &str) -> TestClient {
        let transport = Arc::new(LocalTransport {
            server: self.server.clone(),
            ctx: SyncContext::new("a1", name, PartitionId::global()),
            fail_chunk_fetches: Mutex::new(0),
            corrupt_chunk_fetches: Mutex::new(0),
        });
        let persistence = Arc::new(SqliteClientPersistence::new_in_memory().unwrap());
        let client = Arc::new(
            SyncularClient::new(
                self.rt.clone(),
                persistence,
                transport.clone(),
                name,
                PartitionId::global(),
                SchemaVersion(1),
            )
            .unwrap(),
        );
        client.subscribe(SubscriptionSpec {
            id: format!("{name}-tasks").into(),
            table: "tasks".into(),
            scopes: ScopeSelector::new().with("user_id", ScopeValues::Any),
        });
        TestClient { client, transport }
    }
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

#[tokio::test]
async fn test_two_client_convergence() -> anyhow::Result<()> {
    let h = harness();
    let a = h.client("client-a");
    let b = h.client("client-b");

    a.client.enqueue(vec![upsert(
        "t1",
        json!({"id": "t1", "title": "X", "user_id": "u1"}),
        None,
    )])?;
    a.client.sync().await?;
    b.client.sync().await?;

    let rows = b.client.table_rows(&"tasks".into())?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].row_json["id"], "t1");
    assert_eq!(rows[0].row_json["title"], "X");
    Ok(())
}

#[tokio::test]
async fn test_update_propagation() -> anyhow::Result<()> {
    let h = harness();
    let a = h.client("client-a");
    let b = h.client("client-b");

    a.client.enqueue(vec![upsert(
        "t1",
        json!({"id": "t1", "title": "X", "user_id": "u1"}),
        None,
    )])?;
    a.client.sync().await?;
    b.client.sync().await?;

    a.client.enqueue(vec![upsert(
        "t1",
        json!({"id": "t1", "title": "Y", "user_id": "u1"}),
        Some(1),
    )])?;
    a.client.sync().await?;
    b.client.sync().await?;

    let rows = b.client.table_rows(&"tasks".into())?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].row_json["title"], "Y");
    assert_eq!(rows[0].row_version, RowVersion(2));
    Ok(())
}

#[tokio::test]
async fn test_self_conflict_avoidance() -> anyhow::Result<()> {
    let h = harness();
    let a = h.client("client-a");

    a.client.enqueue(vec![upsert(
        "t1",
        json!({"id": "t1", "title": "v1", "user_id": "u1"}),
        None,
    )])?;
    // Five pipelined edits, all against the only version the client has
    // ever seen from the server.
    for i in 2..=6 {
        a.client.enqueue(vec![upsert(
            "t1",
            json!({"id": "t1", "title": format!("v{i}"), "user_id": "u1"}),
            Some(1),
        )])?;
    }
    a.client.sync().await?;

    let row = h
        .server
        .persistence()
        .load_row(&"tasks".into(), &"t1".into())?
        .unwrap();
    assert_eq!(row.row_version, RowVersion(6));
    assert_eq!(row.row_json["title"], "v6");
    assert_eq!(a.client.conflicts()?, vec![]);
    Ok(())
}

#[tokio::test]
async fn test_cross_client_conflict_is_surfaced_and_resolvable() -> anyhow::Result<()> {
    let h = harness();
    let a = h.client("client-a");
    let b = h.client("client-b");

    a.client.enqueue(vec![upsert(
        "t1",
        json!({"id": "t1", "title": "A's", "user_id": "u1"}),
        None,
    )])?;
    a.client.sync().await?;
    b.client.sync().await?;

    // A moves the row to version 2; B edits against version 1.
    a.client.enqueue(vec![upsert(
        "t1",
        json!({"id": "t1", "title": "A again", "user_id": "u1"}),
        Some(1),
    )])?;
    a.client.sync().await?;
    b.client.enqueue(vec![upsert(
        "t1",
        json!({"id": "t1", "title": "B's", "user_id": "u1"}),
        Some(1),
    )])?;
    b.client.sync().await?;

    let conflicts = b.client.conflicts()?;
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.server_version, Some(RowVersion(2)));
    assert_eq!(conflict.server_row.as_ref().unwrap()["title"], "A again");
    let parked = b
        .client
        .persistence()
        .outbox_commit(&conflict.client_commit_id)?
        .unwrap();
    assert_eq!(parked.state, OutboxState::Conflict);

    // The application resolves by re-enqueueing against the server version.
    b.client.discard_conflict(&conflict.client_commit_id)?;
    b.client.enqueue(vec![upsert(
        "t1",
        json!({"id": "t1", "title": "B's", "user_id": "u1"}),
        Some(2),
    )])?;
    b.client.sync().await?;
    assert_eq!(b.client.conflicts()?, vec![]);

    a.client.sync().await?;
    let rows = a.client.table_rows(&"tasks".into())?;
    assert_eq!(rows[0].row_json["title"], "B's");
    assert_eq!(rows[0].row_version, RowVersion(3));
    Ok(())
}

/// Seed the server row store directly with one bulk commit, the way a
/// pre-existing deployment would look to a fresh client.
fn seed_server_rows(h: &Harness, count: usize) -> anyhow::Result<()> {
    let mut writes = Vec::with_capacity(count);
    for i in 0..count {
        let row_id = format!("seed-{i:05}");
        let mut scopes = sync_types::ScopeMap::new();
        scopes.insert("user_id", "u1");
        writes.push(RowWrite {
            table: "tasks".into(),
            row_id: row_id.clone().into(),
            op: OpType::Upsert,
            row: Some(StoredRow {
                row_id: row_id.clone().into(),
                row_json: json!({"id": row_id, "title": format!("row {i}"), "user_id": "u1"}),
                row_version: RowVersion(1),
                scopes,
                last_writer: None,
            }),
        });
    }
    let commit = CommitRow {
        partition_id: PartitionId::global(),
        commit_seq: CommitSeq(1),
        client_id: "seeder".into(),
        client_commit_id: "seed".into(),
        actor_id: ActorIdOrSystem::System,
        created_at: h.rt.unix_timestamp(),
        schema_version: SchemaVersion(1),
        tables: BTreeSet::from([sync_types::TableName::from("tasks")]),
    };
    let outcome = PushOutcomeRow {
        client_id: "seeder".into(),
        client_commit_id: "seed".into(),
        response_json: json!({"status": "applied"}),
        created_at: commit.created_at,
    };
    h.server
        .persistence()
        .write_commit(&commit, &[], &writes, &outcome)
}

#[tokio::test]
async fn test_bootstrap_resumes_after_transport_cut() -> anyhow::Result<()> {
    let h = harness();
    seed_server_rows(&h, 10_000)?;

    let c = h.client("client-a");
    // The transport dies twice somewhere in the middle of the chunk
    // sequence; the client must resume from the last successful chunk.
    *c.transport.fail_chunk_fetches.lock() = 2;
    c.client.sync().await?;

    let rows = c.client.table_rows(&"tasks".into())?;
    assert_eq!(rows.len(), 10_000);
    let distinct: BTreeSet<_> = rows.iter().map(|r| r.row_id.clone()).collect();
    assert_eq!(distinct.len(), 10_000);
    Ok(())
}

#[tokio::test]
async fn test_corrupted_chunk_is_rejected_and_refetched() -> anyhow::Result<()> {
    let h = harness();
    seed_server_rows(&h, 1_000)?;

    let c = h.client("client-a");
    *c.transport.corrupt_chunk_fetches.lock() = 1;
    c.client.sync().await?;

    assert_eq!(c.client.table_rows(&"tasks".into())?.len(), 1_000);
    Ok(())
}

#[tokio::test]
async fn test_revocation_leaves_no_unauthorized_rows() -> anyhow::Result<()> {
    let h = harness();
    let writer = h.client("writer");
    writer.client.enqueue(vec![
        upsert("t1", json!({"id": "t1", "title": "mine", "user_id": "u1"}), None),
        upsert("t2", json!({"id": "t2", "title": "theirs", "user_id": "u2"}), None),
    ])?;
    writer.client.sync().await?;

    let reader = h.client("reader");
    reader.client.sync().await?;
    assert_eq!(reader.client.table_rows(&"tasks".into())?.len(), 2);

    // Access to u2 is revoked: the next successful pull must leave no rows
    // scoped to it.
    *h.authorized.lock() = ScopeSelector::new().with("user_id", ScopeValues::one("u1"));
    reader.client.sync().await?;

    let rows = reader.client.table_rows(&"tasks".into())?;
    assert_eq!(rows.len(), 1);
    let revoked = ScopeValue::from("u2");
    assert!(rows.iter().all(|row| !row.scopes.contains_value(&revoked)));
    Ok(())
}

#[tokio::test]
async fn test_cursor_is_monotonic_under_replays_and_interleavings() -> anyhow::Result<()> {
    let h = harness();
    let a = h.client("client-a");
    let b = h.client("client-b");
    let sub_id = sync_types::SubscriptionId::from("client-b-tasks");

    let mut last_cursor = CommitSeq::MIN;
    let mut check = |client: &SyncularClient<TestRuntime>| -> anyhow::Result<()> {
        let state = client
            .persistence()
            .subscription_state(&sub_id)?
            .unwrap_or_default();
        let cursor = state.cursor.unwrap_or(CommitSeq::MIN);
        anyhow::ensure!(
            cursor >= last_cursor,
            "cursor went backwards: {last_cursor} -> {cursor}"
        );
        last_cursor = cursor;
        Ok(())
    };

    for round in 0..10 {
        a.client.enqueue(vec![upsert(
            &format!("t{round}"),
            json!({"id": format!("t{round}"), "title": "x", "user_id": "u1"}),
            None,
        )])?;
        a.client.sync().await?;
        // Interleave plain pulls, duplicate pulls, and full syncs.
        b.client.pull_once().await?;
        check(&b.client)?;
        b.client.pull_once().await?;
        check(&b.client)?;
        b.client.sync().await?;
        check(&b.client)?;
    }
    assert_eq!(b.client.table_rows(&"tasks".into())?.len(), 10);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_background_engine_converges_via_wake() -> anyhow::Result<()> {
    let h = harness();
    let a = h.client("client-a");
    let b = h.client("client-b");
    b.client.start();

    a.client.enqueue(vec![upsert(
        "t1",
        json!({"id": "t1", "title": "X", "user_id": "u1"}),
        None,
    )])?;
    a.client.sync().await?;

    for _ in 0..200 {
        if b.client.table_rows(&"tasks".into())?.len() == 1 {
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("background engine never delivered the row");
}

#[tokio::test]
async fn test_proxied_sql_mutations_reach_the_server() -> anyhow::Result<()> {
    let h = harness();
    let a = h.client("client-a");

    // Admin tooling owns a real SQL table and bypasses the handler path.
    let admin_db = rusqlite::Connection::open_in_memory()?;
    admin_db.execute_batch(
        "CREATE TABLE tasks (id TEXT PRIMARY KEY, title TEXT, user_id TEXT)",
    )?;
    let proxy = sql_proxy::SqlProxy::new(
        Arc::new(Mutex::new(admin_db)),
        [sync_types::TableName::from("tasks")],
    );
    let sink = crate::OutboxMutationSink::new(a.client.clone());

    let outcome = proxy
        .execute(
            "INSERT INTO tasks (id, title, user_id) VALUES ('t1', 'backfilled', 'u1')",
            &sink,
        )
        .await?;
    assert_eq!(outcome.synthesized, 1);

    a.client.sync().await?;
    let row = h
        .server
        .persistence()
        .load_row(&"tasks".into(), &"t1".into())?
        .unwrap();
    assert_eq!(row.row_json["title"], "backfilled");
    Ok(())
}

#[tokio::test]
async fn test_outbox_survives_transport_outage() -> anyhow::Result<()> {
    let h = harness();
    let a = h.client("client-a");

    a.client.enqueue(vec![upsert(
        "t1",
        json!({"id": "t1", "title": "X", "user_id": "u1"}),
        None,
    )])?;

    // First attempt dies in transport: the commit stays `sending` and the
    // pump retries it until the outage ends.
    struct Outage;
    #[async_trait]
    impl Transport for Outage {
        async fn push(&self, _request: PushRequest) -> anyhow::Result<PushResponse> {
            anyhow::bail!("network unreachable")
        }

        async fn pull(&self, _request: PullRequest) -> anyhow::Result<PullResponse> {
            anyhow::bail!("network unreachable")
        }

        async fn fetch_chunk(&self, _chunk_id: &ChunkId) -> anyhow::Result<Bytes> {
            anyhow::bail!("network unreachable")
        }
    }

    let offline = SyncularClient::new(
        h.rt.clone(),
        a.client.persistence().clone(),
        Arc::new(Outage),
        "client-a",
        PartitionId::global(),
        SchemaVersion(1),
    )?;
    let outcome = offline.push_once().await?;
    assert!(matches!(outcome, crate::PushOutcome::Backoff(_)));
    let counts = offline.persistence().outbox_counts()?;
    assert_eq!(counts.get(&OutboxState::Sending), Some(&1));

    // The process "restarts" after the grace: a fresh engine over the same
    // durable store recovers the stale `sending` row and the retry acks.
    h.rt.advance_time(std::time::Duration::from_secs(120));
    let transport = Arc::new(LocalTransport {
        server: h.server.clone(),
        ctx: SyncContext::new("a1", "client-a", PartitionId::global()),
        fail_chunk_fetches: Mutex::new(0),
        corrupt_chunk_fetches: Mutex::new(0),
    });
    let back_online = SyncularClient::new(
        h.rt.clone(),
        a.client.persistence().clone(),
        transport,
        "client-a",
        PartitionId::global(),
        SchemaVersion(1),
    )?;
    back_online.sync().await?;
    let counts = back_online.persistence().outbox_counts()?;
    assert_eq!(counts.get(&OutboxState::Acked), Some(&1));
    assert_eq!(
        h.server
            .persistence()
            .max_commit_seq(&PartitionId::global())?,
        CommitSeq(1)
    );
    Ok(())
}
