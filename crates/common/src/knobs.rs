//! Environment-configurable tunables. Each knob reads its environment
//! variable once at first use and falls back to the default on absence or a
//! parse failure.

use std::{
    env,
    fmt::Display,
    str::FromStr,
    sync::LazyLock,
    time::Duration,
};

pub fn env_config<T: FromStr>(name: &str, default: T) -> T
where
    T::Err: Display,
{
    match env::var(name) {
        Ok(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::error!("Failed to parse {name}={value}: {e}, using default");
                default
            },
        },
        Err(_) => default,
    }
}

/// Maximum operations accepted in a single push.
pub static PUSH_MAX_OPERATIONS: LazyLock<usize> =
    LazyLock::new(|| env_config("SYNCULAR_PUSH_MAX_OPERATIONS", 1000));

/// Maximum commits returned per subscription per pull.
pub static PULL_MAX_COMMITS: LazyLock<usize> =
    LazyLock::new(|| env_config("SYNCULAR_PULL_MAX_COMMITS", 256));

/// Rows per snapshot chunk when the pull does not request a limit.
pub static SNAPSHOT_CHUNK_ROW_LIMIT: LazyLock<usize> =
    LazyLock::new(|| env_config("SYNCULAR_SNAPSHOT_CHUNK_ROW_LIMIT", 512));

/// Lifetime of a snapshot chunk before `find_chunk` stops serving it.
pub static SNAPSHOT_CHUNK_TTL: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config("SYNCULAR_SNAPSHOT_CHUNK_TTL_SECS", 3600))
});

/// Lifetime of a pending blob upload record.
pub static BLOB_UPLOAD_TTL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("SYNCULAR_BLOB_UPLOAD_TTL_SECS", 3600)));

/// Lifetime of a presigned blob URL.
pub static BLOB_URL_TTL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("SYNCULAR_BLOB_URL_TTL_SECS", 900)));

/// Chunk fetch failures tolerated before a subscription rebootstraps from
/// scratch.
pub static BOOTSTRAP_MAX_CHUNK_RETRIES: LazyLock<u32> =
    LazyLock::new(|| env_config("SYNCULAR_BOOTSTRAP_MAX_CHUNK_RETRIES", 3));

/// How long an outbox commit may sit in `sending` before restart recovery
/// returns it to `pending`.
pub static OUTBOX_SENDING_GRACE: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config("SYNCULAR_OUTBOX_SENDING_GRACE_SECS", 60))
});

/// Concurrent connections the SQL proxy hands out.
pub static PROXY_CONNECTION_LIMIT: LazyLock<usize> =
    LazyLock::new(|| env_config("SYNCULAR_PROXY_CONNECTION_LIMIT", 8));

/// Capacity of the advisory wake broadcast channel.
pub static WAKE_CHANNEL_CAPACITY: LazyLock<usize> =
    LazyLock::new(|| env_config("SYNCULAR_WAKE_CHANNEL_CAPACITY", 1024));
