use serde::Deserialize;

/// Transient or terminal failure of the transport layer itself: connection
/// resets, timeouts, and HTTP statuses that never resolved to a 2xx even
/// after the client's retry budget was spent.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("request to {url} timed out connecting")]
    ConnectTimeout { url: String },

    #[error("request to {url} failed after exhausting retry budget: {status}")]
    RetriesExhausted {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("request to {url} returned unexpected status {status}")]
    UnexpectedStatus {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("decoding JSON response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("preparing request to {url}: {source}")]
    Payload {
        url: String,
        #[source]
        source: anyhow::Error,
    },
}

/// `error_ext` carried by a non-success server response. Only
/// `retry_allowed` is interpreted by this orchestrator; the rest of the
/// object is preserved for diagnostics.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorExt {
    #[serde(default)]
    pub retry_allowed: Option<i32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ErrorExt {
    pub fn retry_allowed(&self) -> bool {
        matches!(self.retry_allowed, Some(v) if v != 0)
    }
}

/// Fatal application-level failure: the server answered but reported
/// `success: false` without `retry_allowed`, or the retry budget at this
/// layer was exhausted.
#[derive(Debug, thiserror::Error)]
#[error("replication controller error at {url}: {error}")]
pub struct ReplicationControllerError {
    pub url: String,
    pub error: String,
    pub error_ext: Option<ErrorExt>,
}
