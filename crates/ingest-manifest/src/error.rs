/// Configuration/invariant failures surfaced while expanding a manifest:
/// these abort the process immediately, they are never retried.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error(
        "manifest version {found} is unsupported: expected {min}..={max}"
    )]
    UnsupportedVersion { found: i32, min: i32, max: i32 },

    #[error("manifest at {url} is missing required field `{field}`")]
    MissingField { url: String, field: &'static str },

    #[error("fetching manifest document at {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: anyhow::Error,
    },
}
