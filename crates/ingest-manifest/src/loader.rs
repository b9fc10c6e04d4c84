use crate::error::ManifestError;
use async_trait::async_trait;
use serde_json::Value;

/// Fetches a manifest-referenced JSON document from a URL. Abstracted
/// behind a trait so tests can supply an in-memory fake instead of hitting
/// the network or filesystem.
#[async_trait]
pub trait DocumentLoader: Send + Sync {
    async fn fetch_json(&self, url: &str) -> Result<Value, ManifestError>;
}

/// Loads documents over `http(s)://` via a plain `reqwest::Client`, or from
/// the local filesystem for `file://` and bare paths.
pub struct HttpDocumentLoader {
    client: reqwest::Client,
}

impl HttpDocumentLoader {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpDocumentLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentLoader for HttpDocumentLoader {
    async fn fetch_json(&self, url: &str) -> Result<Value, ManifestError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|source| ManifestError::Fetch {
                    url: url.to_string(),
                    source: source.into(),
                })?;
            resp.json::<Value>().await.map_err(|source| ManifestError::Fetch {
                url: url.to_string(),
                source: source.into(),
            })
        } else {
            let path = url.strip_prefix("file://").unwrap_or(url);
            let contents = std::fs::read_to_string(path).map_err(|source| ManifestError::Fetch {
                url: url.to_string(),
                source: source.into(),
            })?;
            serde_json::from_str(&contents).map_err(|source| ManifestError::Fetch {
                url: url.to_string(),
                source: source.into(),
            })
        }
    }
}
