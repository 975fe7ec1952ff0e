//! Versioned schema migrations with checksum-gated reset.
//!
//! Each migration carries SQL for `up` and optionally `down`. The runner is
//! idempotent, serializes concurrent invocations per tracking-table name
//! process-wide, and detects post-apply edits by checksumming the normalized
//! `up` source.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        LazyLock,
    },
};

use common::runtime::{
    Runtime,
    UnixTimestamp,
};
use parking_lot::Mutex as SyncMutex;
use rusqlite::{
    params,
    Connection,
};
use tokio::sync::Mutex as AsyncMutex;

mod normalize;

pub use crate::normalize::{
    checksum,
    normalize_source,
};

#[derive(Clone, Debug)]
pub struct Migration {
    pub version: u64,
    pub name: String,
    pub up: String,
    pub down: Option<String>,
}

impl Migration {
    pub fn new(version: u64, name: &str, up: &str) -> Self {
        Self {
            version,
            name: name.to_owned(),
            up: up.to_owned(),
            down: None,
        }
    }

    pub fn with_down(mut self, down: &str) -> Self {
        self.down = Some(down.to_owned());
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnChecksumMismatch {
    /// Fail loudly: an applied migration's source was edited.
    #[default]
    Error,
    /// Drop app state via `before_reset`, clear tracking, re-run everything.
    Reset,
}

pub type BeforeReset = Arc<dyn Fn(&Connection) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Versions applied by this invocation, ascending.
    pub applied: Vec<u64>,
    pub was_reset: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationRecord {
    pub version: u64,
    pub name: String,
    pub applied_at: UnixTimestamp,
    pub checksum: String,
}

pub struct MigrationRunner {
    tracking_table: String,
    on_checksum_mismatch: OnChecksumMismatch,
    before_reset: Option<BeforeReset>,
}

// One queue per tracking-table name, process-wide, so concurrent runners
// cannot race the tracking table's CREATE TABLE.
static TRACKING_SERIALIZERS: LazyLock<SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>> =
    LazyLock::new(|| SyncMutex::new(HashMap::new()));

fn serializer_for(tracking_table: &str) -> Arc<AsyncMutex<()>> {
    let mut map = TRACKING_SERIALIZERS.lock();
    map.entry(tracking_table.to_owned())
        .or_insert_with(|| Arc::new(AsyncMutex::new(())))
        .clone()
}

impl MigrationRunner {
    pub fn new() -> Self {
        Self {
            tracking_table: "migration_state".to_owned(),
            on_checksum_mismatch: OnChecksumMismatch::Error,
            before_reset: None,
        }
    }

    pub fn tracking_table(mut self, name: &str) -> Self {
        self.tracking_table = name.to_owned();
        self
    }

    pub fn on_checksum_mismatch(mut self, mode: OnChecksumMismatch) -> Self {
        self.on_checksum_mismatch = mode;
        self
    }

    pub fn before_reset(
        mut self,
        callback: impl Fn(&Connection) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.before_reset = Some(Arc::new(callback));
        self
    }

    /// Apply every not-yet-applied migration, in version order.
    pub async fn run<RT: Runtime>(
        &self,
        rt: &RT,
        connection: &SyncMutex<Connection>,
        migrations: &[Migration],
    ) -> anyhow::Result<MigrationReport> {
        let serializer = serializer_for(&self.tracking_table);
        let _guard = serializer.lock().await;
        self.run_locked(rt, connection, migrations)
    }

    /// Revert applied migrations above `target`, in strictly descending
    /// order. A missing `down` on a version being reverted is fatal.
    pub async fn run_to_version<RT: Runtime>(
        &self,
        _rt: &RT,
        connection: &SyncMutex<Connection>,
        migrations: &[Migration],
        target: u64,
    ) -> anyhow::Result<Vec<u64>> {
        let serializer = serializer_for(&self.tracking_table);
        let _guard = serializer.lock().await;

        let connection = connection.lock();
        self.ensure_tracking_table(&connection)?;
        let applied = self.applied_records(&connection)?;

        let mut reverted = Vec::new();
        for record in applied.iter().rev() {
            if record.version <= target {
                break;
            }
            let migration = migrations
                .iter()
                .find(|m| m.version == record.version)
                .ok_or_else(|| {
                    anyhow::anyhow!("no migration source for applied version {}", record.version)
                })?;
            let down = migration.down.as_ref().ok_or_else(|| {
                anyhow::anyhow!(
                    "migration {} ({}) has no down and cannot be reverted",
                    migration.version,
                    migration.name
                )
            })?;
            tracing::info!("Reverting migration {} ({})", migration.version, migration.name);
            connection.execute_batch(down)?;
            connection.execute(
                &format!("DELETE FROM {} WHERE version = ?1", self.tracking_table),
                params![migration.version],
            )?;
            reverted.push(migration.version);
        }
        Ok(reverted)
    }

    fn run_locked<RT: Runtime>(
        &self,
        rt: &RT,
        connection: &SyncMutex<Connection>,
        migrations: &[Migration],
    ) -> anyhow::Result<MigrationReport> {
        let mut sorted: Vec<&Migration> = migrations.iter().collect();
        sorted.sort_by_key(|m| m.version);
        anyhow::ensure!(
            sorted.windows(2).all(|w| w[0].version < w[1].version),
            "duplicate migration versions"
        );

        let connection = connection.lock();
        self.ensure_tracking_table(&connection)?;

        let mut was_reset = false;
        let applied = self.applied_records(&connection)?;
        for record in &applied {
            let Some(migration) = sorted.iter().find(|m| m.version == record.version) else {
                continue;
            };
            let current = checksum(&migration.up);
            if current != record.checksum {
                match self.on_checksum_mismatch {
                    OnChecksumMismatch::Error => anyhow::bail!(
                        "checksum mismatch for applied migration {} ({}): its source changed \
                         after being applied",
                        migration.version,
                        migration.name
                    ),
                    OnChecksumMismatch::Reset => {
                        tracing::warn!(
                            "Checksum mismatch for migration {}; resetting",
                            migration.version
                        );
                        self.reset(&connection)?;
                        was_reset = true;
                        break;
                    },
                }
            }
        }

        let report = match self.apply_missing(rt, &connection, &sorted) {
            Ok(applied_now) => MigrationReport {
                applied: applied_now,
                was_reset,
            },
            // A schema conflict means the tracking table lost track of an
            // object that exists. In reset mode, one salvage reset.
            Err(e)
                if self.on_checksum_mismatch == OnChecksumMismatch::Reset
                    && !was_reset
                    && e.to_string().contains("already exists") =>
            {
                tracing::warn!("Schema conflict during migration ({e}); salvage reset");
                self.reset(&connection)?;
                MigrationReport {
                    applied: self.apply_missing(rt, &connection, &sorted)?,
                    was_reset: true,
                }
            },
            Err(e) => return Err(e),
        };
        Ok(report)
    }

    fn apply_missing<RT: Runtime>(
        &self,
        rt: &RT,
        connection: &Connection,
        sorted: &[&Migration],
    ) -> anyhow::Result<Vec<u64>> {
        let applied: Vec<u64> = self
            .applied_records(connection)?
            .into_iter()
            .map(|r| r.version)
            .collect();
        let mut applied_now = Vec::new();
        for migration in sorted {
            if applied.contains(&migration.version) {
                continue;
            }
            tracing::info!("Applying migration {} ({})", migration.version, migration.name);
            connection.execute_batch(&migration.up)?;
            connection.execute(
                &format!(
                    "INSERT INTO {} (version, name, applied_at, checksum)
                     VALUES (?1, ?2, ?3, ?4)",
                    self.tracking_table
                ),
                params![
                    migration.version,
                    migration.name,
                    rt.unix_timestamp().as_millis(),
                    checksum(&migration.up),
                ],
            )?;
            applied_now.push(migration.version);
        }
        Ok(applied_now)
    }

    fn reset(&self, connection: &Connection) -> anyhow::Result<()> {
        if let Some(before_reset) = &self.before_reset {
            before_reset(connection)?;
        }
        connection.execute(&format!("DELETE FROM {}", self.tracking_table), [])?;
        Ok(())
    }

    fn ensure_tracking_table(&self, connection: &Connection) -> anyhow::Result<()> {
        connection.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at INTEGER NOT NULL,
                checksum TEXT NOT NULL
            )",
            self.tracking_table
        ))?;
        Ok(())
    }

    fn applied_records(&self, connection: &Connection) -> anyhow::Result<Vec<MigrationRecord>> {
        let mut stmt = connection.prepare(&format!(
            "SELECT version, name, applied_at, checksum FROM {} ORDER BY version",
            self.tracking_table
        ))?;
        let records = stmt
            .query_map([], |row| {
                Ok(MigrationRecord {
                    version: row.get(0)?,
                    name: row.get(1)?,
                    applied_at: UnixTimestamp::from_millis(row.get(2)?),
                    checksum: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}
