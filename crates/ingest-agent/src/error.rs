use ingest_http::ContributionState;

/// Errors surfaced by the contribution state machine and ingester
/// orchestrator. `ContributionFailed` and `ContributionCancelled`
/// are "fatal application" errors: they abort the current
/// transaction and propagate out of the worker. Everything wrapped via
/// `#[from]` keeps its own classification (transient transport, retryable
/// application, or configuration) from its originating crate.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Http(#[from] ingest_http::HttpError),

    #[error(transparent)]
    Replication(#[from] ingest_http::ReplicationControllerError),

    #[error(transparent)]
    Queue(#[from] ingest_queue::QueueError),

    #[error(transparent)]
    Manifest(#[from] ingest_manifest::ManifestError),

    #[error(
        "contribution ingest failed for {database}.{table} ({filepath}): status={status:?} error={error:?} system_error={system_error:?} http_error={http_error}"
    )]
    ContributionFailed {
        status: ContributionState,
        error: String,
        system_error: String,
        http_error: i64,
        database: String,
        table: String,
        filepath: String,
    },

    #[error("contribution for {database}.{table} ({filepath}) was cancelled by a third party")]
    ContributionCancelled {
        database: String,
        table: String,
        filepath: String,
    },

    #[error("sanity check failed: {0}")]
    SanityCheck(String),

    #[error("ingest invariant violated: {0}")]
    Invariant(String),
}
