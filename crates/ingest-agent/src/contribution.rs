use crate::error::IngestError;
use ingest_core::{FileFormat, FileFormats, MAX_RETRY_ATTEMPTS};
use ingest_http::{ContributionState, HttpClient, LoadBalancedUrl, ResponseParser};
use ingest_manifest::ContributionSpec;
use serde_json::{json, Value};

/// Runtime handle for one contribution: created per locked spec once its
/// target worker is known, lives only for the duration of one
/// super-transaction.
///
/// `request_id` and `finished` together encode the four states this
/// machine moves through: not yet submitted (`None`, `false`), submitted and being
/// polled (`Some`, `false`), resubmitting after a retried transient
/// failure (`None`, `false` again), and terminal (`finished = true`).
#[derive(Debug, Clone)]
pub struct Contribution {
    spec: ContributionSpec,
    worker_host: String,
    worker_port: u16,
    url: LoadBalancedUrl,
    charset_name: String,
    request_id: Option<i64>,
    finished: bool,
    retry_attempts: u32,
}

impl Contribution {
    pub fn new(
        spec: ContributionSpec,
        worker_host: String,
        worker_port: u16,
        url: LoadBalancedUrl,
        charset_name: String,
    ) -> Self {
        Self {
            spec,
            worker_host,
            worker_port,
            url,
            charset_name,
            request_id: None,
            finished: false,
            retry_attempts: 0,
        }
    }

    pub fn spec(&self) -> &ContributionSpec {
        &self.spec
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn request_id(&self) -> Option<i64> {
        self.request_id
    }

    fn worker_url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.worker_host, self.worker_port, path)
    }

    /// Submits this contribution to its target worker for `transaction_id`.
    /// Retries transport-level connect timeouts
    /// via [`HttpClient::post_retry`]; any other server-side failure is
    /// fatal (one-shot, `attempts = -1`).
    #[tracing::instrument(skip(self, client, formats), fields(table = %self.spec.table, filepath = %self.spec.filepath))]
    pub async fn start_async(
        &mut self,
        client: &HttpClient,
        transaction_id: i64,
        formats: &FileFormats,
    ) -> Result<(), IngestError> {
        let endpoint = self.worker_url("/ingest/file-async");

        let mut payload = json!({
            "transaction_id": transaction_id,
            "table": self.spec.table,
            "chunk": self.spec.chunk_payload(),
            "overlap": self.spec.overlap_payload(),
            "url": self.url.get(),
            "charset_name": self.charset_name,
        });
        if let Some(format) = formats.get(self.spec.extension()) {
            merge_format(&mut payload, format);
        }

        let response = client.post_retry(&endpoint, payload, true, false).await?;
        ResponseParser::raise_error(&endpoint, &response, -1, -1)?;

        let request_id = response
            .pointer("/contrib/id")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                IngestError::Invariant(format!(
                    "worker response from {endpoint} missing contrib.id"
                ))
            })?;
        self.request_id = Some(request_id);
        Ok(())
    }

    /// Polls the worker for this contribution's progress. Returns `Ok(true)` iff the server reports `FINISHED`.
    #[tracing::instrument(skip(self, client), fields(table = %self.spec.table, filepath = %self.spec.filepath))]
    pub async fn monitor(&mut self, client: &HttpClient) -> Result<bool, IngestError> {
        let request_id = self.request_id.ok_or_else(|| {
            IngestError::Invariant("monitor() called with no request_id set".to_string())
        })?;
        let endpoint = self.worker_url(&format!("/ingest/file-async/{request_id}"));

        let response = client.get(&endpoint, json!({}), true).await?;
        let monitor = ResponseParser::parse_contribution_monitor(&endpoint, &response)?;

        match monitor.status {
            ContributionState::InProgress => Ok(false),
            ContributionState::Finished => {
                self.finished = true;
                Ok(true)
            }
            ContributionState::Cancelled => Err(IngestError::ContributionCancelled {
                database: self.spec.database.clone(),
                table: self.spec.table.clone(),
                filepath: self.spec.filepath.clone(),
            }),
            status if status.is_retryable_failure_class() => {
                if monitor.retry_allowed && self.retry_attempts < MAX_RETRY_ATTEMPTS {
                    self.retry_attempts += 1;
                    self.request_id = None;
                    tracing::warn!(
                        attempt = self.retry_attempts,
                        status = ?status,
                        "contribution load failed, will resubmit"
                    );
                    Ok(false)
                } else {
                    Err(IngestError::ContributionFailed {
                        status,
                        error: monitor.error,
                        system_error: monitor.system_error,
                        http_error: monitor.http_error,
                        database: self.spec.database.clone(),
                        table: self.spec.table.clone(),
                        filepath: self.spec.filepath.clone(),
                    })
                }
            }
            status => Err(IngestError::ContributionFailed {
                status,
                error: monitor.error,
                system_error: monitor.system_error,
                http_error: monitor.http_error,
                database: self.spec.database.clone(),
                table: self.spec.table.clone(),
                filepath: self.spec.filepath.clone(),
            }),
        }
    }
}

fn merge_format(payload: &mut Value, format: &FileFormat) {
    let Ok(Value::Object(fields)) = serde_json::to_value(format) else {
        return;
    };
    if let Some(obj) = payload.as_object_mut() {
        obj.extend(fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(filepath: &str, chunk_id: Option<i32>, is_overlap: Option<bool>) -> ContributionSpec {
        ContributionSpec {
            database: "gaia".to_string(),
            table: "Source".to_string(),
            chunk_id,
            filepath: filepath.to_string(),
            is_overlap,
        }
    }

    fn contribution(filepath: &str) -> Contribution {
        let url = LoadBalancedUrl::new(filepath, vec!["https://m1".to_string()]).unwrap();
        Contribution::new(
            spec(filepath, Some(1), Some(false)),
            "worker1".to_string(),
            25002,
            url,
            "latin1".to_string(),
        )
    }

    #[test]
    fn merge_format_adds_wire_keys() {
        let mut payload = json!({"table": "Source"});
        let format = FileFormat {
            fields_terminated_by: Some("\t".to_string()),
            ..Default::default()
        };
        merge_format(&mut payload, &format);
        assert_eq!(payload["column_separator"], json!("\t"));
    }

    #[test]
    fn fresh_contribution_is_unsubmitted() {
        let c = contribution("data/object/chunk_1.txt");
        assert_eq!(c.request_id(), None);
        assert!(!c.finished());
    }
}
