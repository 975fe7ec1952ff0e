use metrics::{
    register_syncular_counter,
    register_syncular_histogram,
    StatusTimer,
};

register_syncular_histogram!(
    CLIENT_PUSH_ATTEMPT_SECONDS,
    "Time for one outbox push attempt",
    &["status"]
);
pub fn push_attempt_timer() -> StatusTimer {
    StatusTimer::new(&CLIENT_PUSH_ATTEMPT_SECONDS)
}

register_syncular_histogram!(
    CLIENT_PULL_SECONDS,
    "Time for one pull round",
    &["status"]
);
pub fn pull_timer() -> StatusTimer {
    StatusTimer::new(&CLIENT_PULL_SECONDS)
}

register_syncular_counter!(CLIENT_COMMITS_ACKED_TOTAL, "Outbox commits acknowledged");
pub fn log_commit_acked() {
    CLIENT_COMMITS_ACKED_TOTAL.inc();
}

register_syncular_counter!(CLIENT_CONFLICTS_TOTAL, "Outbox commits parked as conflicts");
pub fn log_conflict() {
    CLIENT_CONFLICTS_TOTAL.inc();
}

register_syncular_counter!(
    CLIENT_CHUNK_RETRIES_TOTAL,
    "Snapshot chunk fetches retried after a failure"
);
pub fn log_chunk_retry() {
    CLIENT_CHUNK_RETRIES_TOTAL.inc();
}

register_syncular_counter!(
    CLIENT_REBOOTSTRAPS_TOTAL,
    "Subscriptions rebootstrapped from scratch"
);
pub fn log_rebootstrap() {
    CLIENT_REBOOTSTRAPS_TOTAL.inc();
}
