use metrics::{
    register_syncular_counter,
    register_syncular_histogram,
    StatusTimer,
    Timer,
};

register_syncular_histogram!(
    BLOB_INITIATE_UPLOAD_SECONDS,
    "Time to initiate a blob upload",
    &["status"]
);
pub fn initiate_upload_timer() -> StatusTimer {
    StatusTimer::new(&BLOB_INITIATE_UPLOAD_SECONDS)
}

register_syncular_histogram!(
    BLOB_COMPLETE_UPLOAD_SECONDS,
    "Time to verify and complete a blob upload",
    &["status"]
);
pub fn complete_upload_timer() -> StatusTimer {
    StatusTimer::new(&BLOB_COMPLETE_UPLOAD_SECONDS)
}

register_syncular_histogram!(BLOB_CLEANUP_SECONDS, "Time for a blob cleanup pass");
pub fn cleanup_timer() -> Timer {
    Timer::new(&BLOB_CLEANUP_SECONDS)
}

register_syncular_counter!(
    BLOB_UPLOADS_DEDUPLICATED_TOTAL,
    "Uploads skipped because the blob already existed"
);
pub fn log_upload_deduplicated() {
    BLOB_UPLOADS_DEDUPLICATED_TOTAL.inc();
}
