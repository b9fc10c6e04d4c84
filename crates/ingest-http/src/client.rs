use crate::error::HttpError;
use crate::response::ResponseParser;
use ingest_core::Credentials;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Status codes the GET path retries transparently.
const RETRYABLE_STATUSES: [StatusCode; 5] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Fixed backoff sequence for the 5 GET retry attempts: 0.2s,
/// 0.4s, 0.8s, 1.6s, 3.2s.
const GET_BACKOFF: [Duration; 5] = [
    Duration::from_millis(200),
    Duration::from_millis(400),
    Duration::from_millis(800),
    Duration::from_millis(1600),
    Duration::from_millis(3200),
];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// All outbound HTTP to the ingest server. Stateless apart from
/// the pooled `reqwest::Client`s and the cached `auth_key`.
pub struct HttpClient {
    with_read_timeout: reqwest::Client,
    no_read_timeout: reqwest::Client,
    credentials: Arc<Credentials>,
    protocol_version: i32,
}

impl HttpClient {
    pub fn new(credentials: Credentials, protocol_version: i32, read_write_timeout: Duration) -> anyhow::Result<Self> {
        let with_read_timeout = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(read_write_timeout)
            .build()?;
        let no_read_timeout = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            with_read_timeout,
            no_read_timeout,
            credentials: Arc::new(credentials),
            protocol_version,
        })
    }

    fn base_payload(&self, mut payload: Value, authenticated: bool) -> anyhow::Result<Value> {
        let obj = payload
            .as_object_mut()
            .ok_or_else(|| anyhow::anyhow!("request payload must be a JSON object"))?;
        obj.insert("version".to_string(), Value::from(self.protocol_version));
        if authenticated {
            obj.insert("auth_key".to_string(), Value::from(self.credentials.load()?));
        }
        Ok(payload)
    }

    /// `GET url` with the request body carrying `payload`, retried up to 5
    /// times with exponential backoff on transient statuses.
    #[tracing::instrument(level = "debug", skip(self, payload), err)]
    pub async fn get(&self, url: &str, payload: Value, authenticated: bool) -> Result<Value, HttpError> {
        let body = self
            .base_payload(payload, authenticated)
            .map_err(|source| HttpError::Payload {
                url: url.to_string(),
                source,
            })?;

        let mut last_status = StatusCode::INTERNAL_SERVER_ERROR;
        for (attempt, backoff) in std::iter::once(None)
            .chain(GET_BACKOFF.into_iter().map(Some))
            .enumerate()
        {
            if let Some(delay) = backoff {
                tracing::debug!(attempt, ?delay, "retrying GET after transient status");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .with_read_timeout
                .get(url)
                .json(&body)
                .send()
                .await
                .map_err(|source| HttpError::Transport {
                    url: url.to_string(),
                    source,
                })?;
            let status = resp.status();

            if status.is_success() {
                return resp.json::<Value>().await.map_err(|source| HttpError::Decode {
                    url: url.to_string(),
                    source,
                });
            }

            last_status = status;
            if !RETRYABLE_STATUSES.contains(&status) {
                return Err(HttpError::UnexpectedStatus {
                    url: url.to_string(),
                    status,
                });
            }
        }

        Err(HttpError::RetriesExhausted {
            url: url.to_string(),
            status: last_status,
        })
    }

    /// `POST url` with `payload`. Not retried at the transport layer; use
    /// [`HttpClient::post_retry`] for connect-timeout resilience.
    #[tracing::instrument(level = "debug", skip(self, payload), err)]
    pub async fn post(
        &self,
        url: &str,
        payload: Value,
        authenticated: bool,
        no_read_timeout: bool,
    ) -> Result<Value, HttpError> {
        self.send(reqwest::Method::POST, url, Some(payload), authenticated, no_read_timeout)
            .await
    }

    /// `POST url`, retried up to 3 times on connect timeout only.
    pub async fn post_retry(
        &self,
        url: &str,
        payload: Value,
        authenticated: bool,
        no_read_timeout: bool,
    ) -> Result<Value, HttpError> {
        const MAX_ATTEMPTS: u32 = 3;
        let mut backoff = exponential_backoff::Backoff::new(
            MAX_ATTEMPTS,
            Duration::from_millis(200),
            Some(Duration::from_secs(2)),
        );

        let mut attempt = 0u32;
        loop {
            match self
                .post(url, payload.clone(), authenticated, no_read_timeout)
                .await
            {
                Ok(v) => return Ok(v),
                Err(HttpError::Transport { source, .. }) if source.is_connect() || source.is_timeout() => {
                    attempt += 1;
                    match backoff.next(attempt) {
                        Some(delay) => {
                            tracing::debug!(attempt, ?delay, url, "retrying POST after connect timeout");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            return Err(HttpError::ConnectTimeout { url: url.to_string() });
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// `PUT url` with `payload`, analogous to [`HttpClient::post`].
    #[tracing::instrument(level = "debug", skip(self, payload), err)]
    pub async fn put(&self, url: &str, payload: Value, no_read_timeout: bool) -> Result<Value, HttpError> {
        self.send(reqwest::Method::PUT, url, Some(payload), true, no_read_timeout)
            .await
    }

    /// `DELETE url`. Only used to delete database configs.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn delete(&self, url: &str) -> Result<Value, HttpError> {
        self.send(reqwest::Method::DELETE, url, None, true, false).await
    }

    async fn send(
        &self,
        method: reqwest::Method,
        url: &str,
        payload: Option<Value>,
        authenticated: bool,
        no_read_timeout: bool,
    ) -> Result<Value, HttpError> {
        let payload = payload.unwrap_or_else(|| Value::Object(Default::default()));
        let body = self
            .base_payload(payload, authenticated)
            .map_err(|source| HttpError::Payload {
                url: url.to_string(),
                source,
            })?;

        let client = if no_read_timeout {
            &self.no_read_timeout
        } else {
            &self.with_read_timeout
        };

        let resp = client
            .request(method, url)
            .json(&body)
            .send()
            .await
            .map_err(|source| HttpError::Transport {
                url: url.to_string(),
                source,
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(HttpError::UnexpectedStatus {
                url: url.to_string(),
                status,
            });
        }

        resp.json::<Value>().await.map_err(|source| HttpError::Decode {
            url: url.to_string(),
            source,
        })
    }

    /// Performs a HEAD request to determine whether `url` is reachable.
    /// Connection errors are caught and reported as unreachable, used to
    /// pick the first live FQDN from a comma-separated mirror list.
    pub async fn is_reachable(&self, url: &str) -> bool {
        self.with_read_timeout.head(url).send().await.is_ok()
    }

    /// Unwraps a response body into a typed error via [`ResponseParser`],
    /// applied after a successful `get`/`post`/`put` call whose JSON
    /// envelope must also be application-level successful.
    pub fn check_application_success(
        url: &str,
        response: &Value,
        attempts: i64,
        max_attempts: i64,
    ) -> Result<bool, crate::error::ReplicationControllerError> {
        ResponseParser::raise_error(url, response, attempts, max_attempts)
    }
}
