use crate::error::{ErrorExt, ReplicationControllerError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// State of one server-side contribution ingest, as reported by
/// `GET /ingest/file-async/{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContributionState {
    InProgress,
    Finished,
    Cancelled,
    CreateFailed,
    StartFailed,
    ReadFailed,
    LoadFailed,
}

impl ContributionState {
    /// The four states that represent a contribution-ingest failure the
    /// server may allow retrying, as opposed to success or cancellation.
    pub fn is_retryable_failure_class(self) -> bool {
        matches!(
            self,
            ContributionState::CreateFailed
                | ContributionState::StartFailed
                | ContributionState::ReadFailed
                | ContributionState::LoadFailed
        )
    }
}

/// State of a super-transaction, as reported by `GET /ingest/trans`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionState {
    IsStarting,
    Started,
    IsFinishing,
    Finished,
    IsAborting,
    Aborted,
    StartFailed,
    FinishFailed,
    AbortFailed,
}

/// Publication status of a database on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatabaseStatus {
    NotRegistered,
    RegisteredNotPublished,
    Published,
}

/// The fields extracted from polling a contribution. All five
/// are required; their absence in the server's response is a parser fault,
/// not a recoverable condition.
#[derive(Debug, Clone)]
pub struct ContributionMonitor {
    pub status: ContributionState,
    pub error: String,
    pub system_error: String,
    pub http_error: i64,
    pub retry_allowed: bool,
}

/// Interprets server JSON responses and centralizes the retry-classification
/// rule.
pub struct ResponseParser;

impl ResponseParser {
    /// Inspects a response's `success` field. Returns `Ok(true)` when the
    /// caller should retry, `Ok(false)` when the response was a success, and
    /// `Err` when the failure is fatal.
    ///
    /// `max_attempts = -1` disables the retry branch entirely: any
    /// non-success becomes immediately fatal, matching the one-shot GET/PUT
    /// call sites that never want transparent resubmission.
    pub fn raise_error(
        url: &str,
        response: &Value,
        attempts: i64,
        max_attempts: i64,
    ) -> Result<bool, ReplicationControllerError> {
        if response.get("success").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(false);
        }

        let error = response
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let error_ext: Option<ErrorExt> = response
            .get("error_ext")
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        let retry_allowed = error_ext.as_ref().map(ErrorExt::retry_allowed).unwrap_or(false);

        if max_attempts >= 0 && attempts < max_attempts && retry_allowed {
            return Ok(true);
        }

        Err(ReplicationControllerError {
            url: url.to_string(),
            error,
            error_ext,
        })
    }

    /// Extracts the five required fields of a contribution-monitor response.
    pub fn parse_contribution_monitor(
        url: &str,
        response: &Value,
    ) -> Result<ContributionMonitor, ReplicationControllerError> {
        let fault = |field: &str| ReplicationControllerError {
            url: url.to_string(),
            error: format!("missing required field `{field}` in contribution monitor response"),
            error_ext: None,
        };

        let status_str = response
            .pointer("/contrib/status")
            .and_then(Value::as_str)
            .ok_or_else(|| fault("contrib.status"))?;
        let status: ContributionState =
            serde_json::from_value(Value::String(status_str.to_string()))
                .map_err(|_| fault("contrib.status"))?;

        let error = response
            .pointer("/contrib/error")
            .and_then(Value::as_str)
            .ok_or_else(|| fault("contrib.error"))?
            .to_string();
        let system_error = response
            .pointer("/contrib/system_error")
            .and_then(Value::as_str)
            .ok_or_else(|| fault("contrib.system_error"))?
            .to_string();
        let http_error = response
            .pointer("/contrib/http_error")
            .and_then(Value::as_i64)
            .ok_or_else(|| fault("contrib.http_error"))?;
        let retry_allowed = response
            .pointer("/contrib/retry_allowed")
            .and_then(Value::as_i64)
            .ok_or_else(|| fault("contrib.retry_allowed"))?
            != 0;

        Ok(ContributionMonitor {
            status,
            error,
            system_error,
            http_error,
            retry_allowed,
        })
    }

    /// Filters `GET /ingest/trans?database=D`'s response for transactions in
    /// one of `states`, returning their ids.
    pub fn filter_transactions(response: &Value, database: &str, states: &[TransactionState]) -> Vec<i64> {
        response
            .get("databases")
            .and_then(|d| d.get(database))
            .and_then(|d| d.get("transactions"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|txn| {
                let state_str = txn.get("state")?.as_str()?;
                let state: TransactionState = serde_json::from_value(Value::String(state_str.to_string())).ok()?;
                if states.contains(&state) {
                    txn.get("id")?.as_i64()
                } else {
                    None
                }
            })
            .collect()
    }

    /// Parses `location.http_host_name` (a comma-separated mirror FQDN list)
    /// and `location.http_port` from a `/ingest/chunk` response. Returns the
    /// list of candidate `(host, port)` pairs in order; the caller picks the
    /// first reachable one via [`crate::client::HttpClient::is_reachable`].
    pub fn get_chunk_location(response: &Value) -> Option<(Vec<String>, u16)> {
        let hosts = response
            .pointer("/location/http_host_name")
            .and_then(Value::as_str)?
            .split(',')
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
        let port = response.pointer("/location/http_port").and_then(Value::as_u64)? as u16;
        Some((hosts, port))
    }

    /// Parses every entry of `locations[]` from a `/ingest/regular` response.
    pub fn get_regular_table_locations(response: &Value) -> Vec<(Vec<String>, u16)> {
        response
            .get("locations")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|loc| {
                let hosts: Vec<String> = loc
                    .get("http_host_name")
                    .and_then(Value::as_str)?
                    .split(',')
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
                    .collect();
                let port = loc.get("http_port").and_then(Value::as_u64)? as u16;
                Some((hosts, port))
            })
            .collect()
    }

    /// Interprets `is_published` at
    /// `config.databases[?(database==D & family_name==F)]` from
    /// `GET /replication/config`.
    pub fn parse_database_status(response: &Value, database: &str, family: &str) -> DatabaseStatus {
        let found = response
            .pointer("/config/databases")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|d| {
                d.get("database").and_then(Value::as_str) == Some(database)
                    && d.get("family_name").and_then(Value::as_str) == Some(family)
            });

        match found {
            None => DatabaseStatus::NotRegistered,
            Some(d) if d.get("is_published").and_then(Value::as_i64) == Some(1) => {
                DatabaseStatus::Published
            }
            Some(_) => DatabaseStatus::RegisteredNotPublished,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raise_error_returns_false_on_success() {
        let resp = json!({"success": true});
        assert_eq!(ResponseParser::raise_error("u", &resp, 0, 3).unwrap(), false);
    }

    #[test]
    fn raise_error_retries_when_allowed_and_budget_remains() {
        let resp = json!({"success": false, "error": "boom", "error_ext": {"retry_allowed": 1}});
        assert_eq!(ResponseParser::raise_error("u", &resp, 0, 3).unwrap(), true);
    }

    #[test]
    fn raise_error_disables_retry_with_negative_max_attempts() {
        let resp = json!({"success": false, "error": "boom", "error_ext": {"retry_allowed": 1}});
        let err = ResponseParser::raise_error("u", &resp, 0, -1).unwrap_err();
        assert_eq!(err.error, "boom");
    }

    #[test]
    fn raise_error_is_fatal_when_retry_not_allowed() {
        let resp = json!({"success": false, "error": "boom"});
        assert!(ResponseParser::raise_error("u", &resp, 0, 3).is_err());
    }

    #[test]
    fn parses_contribution_monitor() {
        let resp = json!({"contrib": {
            "status": "LOAD_FAILED",
            "error": "bad row",
            "system_error": "errno 5",
            "http_error": 0,
            "retry_allowed": 1,
        }});
        let mon = ResponseParser::parse_contribution_monitor("u", &resp).unwrap();
        assert_eq!(mon.status, ContributionState::LoadFailed);
        assert!(mon.retry_allowed);
    }

    #[test]
    fn contribution_monitor_fails_on_missing_field() {
        let resp = json!({"contrib": {"status": "FINISHED"}});
        assert!(ResponseParser::parse_contribution_monitor("u", &resp).is_err());
    }

    #[test]
    fn database_status_published() {
        let resp = json!({"config": {"databases": [
            {"database": "gaia", "family_name": "layout_340_3", "is_published": 1}
        ]}});
        assert_eq!(
            ResponseParser::parse_database_status(&resp, "gaia", "layout_340_3"),
            DatabaseStatus::Published
        );
    }

    #[test]
    fn database_status_not_registered() {
        let resp = json!({"config": {"databases": []}});
        assert_eq!(
            ResponseParser::parse_database_status(&resp, "gaia", "layout_340_3"),
            DatabaseStatus::NotRegistered
        );
    }
}
