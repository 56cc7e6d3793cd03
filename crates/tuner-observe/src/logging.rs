use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `TUNER_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract:
/// - Include `dataset_id` on anything scoped to a dataset.
/// - Include `key` on per-object upload events and `index` for the item position.
/// - Include `remote_job_id` on orchestrator calls.
/// - Milestones use `target: "tuner_events"` with an `event` field.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("TUNER_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
