use metrics::{
    register_syncular_counter,
    register_syncular_histogram,
    StatusTimer,
};

register_syncular_histogram!(
    SYNC_PUSH_SECONDS,
    "Time to handle a push request",
    &["status"]
);
pub fn push_timer() -> StatusTimer {
    StatusTimer::new(&SYNC_PUSH_SECONDS)
}

register_syncular_histogram!(
    SYNC_PULL_SECONDS,
    "Time to handle a pull request",
    &["status"]
);
pub fn pull_timer() -> StatusTimer {
    StatusTimer::new(&SYNC_PULL_SECONDS)
}

register_syncular_counter!(SYNC_COMMITS_APPENDED_TOTAL, "Commits appended to the log");
pub fn log_commit_appended() {
    SYNC_COMMITS_APPENDED_TOTAL.inc();
}

register_syncular_counter!(
    SYNC_PUSHES_REPLAYED_TOTAL,
    "Pushes answered from the cached outcome"
);
pub fn log_push_replayed() {
    SYNC_PUSHES_REPLAYED_TOTAL.inc();
}

register_syncular_counter!(
    SYNC_CHANGES_DELIVERED_TOTAL,
    "Changes delivered across all subscriptions"
);
pub fn log_changes_delivered(count: usize) {
    SYNC_CHANGES_DELIVERED_TOTAL.inc_by(count as u64);
}

register_syncular_counter!(SYNC_CHUNKS_BUILT_TOTAL, "Snapshot chunks generated");
pub fn log_chunk_built() {
    SYNC_CHUNKS_BUILT_TOTAL.inc();
}

register_syncular_counter!(
    SYNC_CHUNK_CACHE_HITS_TOTAL,
    "Snapshot chunk requests served from existing metadata"
);
pub fn log_chunk_cache_hit() {
    SYNC_CHUNK_CACHE_HITS_TOTAL.inc();
}

register_syncular_counter!(SYNC_WAKES_PUBLISHED_TOTAL, "Wake signals published");
pub fn log_wake_published() {
    SYNC_WAKES_PUBLISHED_TOTAL.inc();
}

register_syncular_counter!(
    SYNC_RESYNCS_REQUIRED_TOTAL,
    "Subscriptions told to resync after scope contraction"
);
pub fn log_resync_required() {
    SYNC_RESYNCS_REQUIRED_TOTAL.inc();
}
