use crate::error::IngestError;
use ingest_http::{DatabaseStatus, HttpClient, ResponseParser, TransactionState};
use serde_json::{json, Value};

/// One of the five admin subcommands exposed against `/ingest/trans` for
/// operators to inspect or force the state of in-flight transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TransactionAdminCommand {
    AbortAll,
    Close,
    CloseAll,
    ListStarted,
    Start,
}

/// Ingest parameters set once per database via `PUT /ingest/config/`.
#[derive(Debug, Clone)]
pub struct ConfigParams {
    pub cainfo: Option<String>,
    pub ssl_verifypeer: Option<bool>,
    pub low_speed_limit: Option<u32>,
    pub low_speed_time: Option<u32>,
    pub async_proc_limit: Option<u32>,
}

/// Thin wrapper binding [`HttpClient`] to the specific server REST
/// endpoints this orchestrator consumes. Holds no state of its
/// own beyond the client and the server's base URL.
pub struct ReplicationServer {
    client: HttpClient,
    base_url: String,
}

impl ReplicationServer {
    pub fn new(client: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn meta_version(&self) -> Result<i64, IngestError> {
        let url = self.url("/meta/version");
        let response = self.client.get(&url, json!({}), false).await?;
        ResponseParser::raise_error(&url, &response, -1, -1)?;
        response
            .pointer("/version")
            .and_then(Value::as_i64)
            .ok_or_else(|| IngestError::Invariant(format!("{url} response missing `version`")))
    }

    pub async fn register_database(&self, database_json: &Value) -> Result<(), IngestError> {
        let url = self.url("/ingest/database/");
        let response = self.client.post(&url, database_json.clone(), true, false).await?;
        ResponseParser::raise_error(&url, &response, -1, -1)?;
        Ok(())
    }

    pub async fn register_table(&self, table_json: &Value) -> Result<(), IngestError> {
        let url = self.url("/ingest/table/");
        let response = self.client.post(&url, table_json.clone(), true, false).await?;
        ResponseParser::raise_error(&url, &response, -1, -1)?;
        Ok(())
    }

    pub async fn set_config(&self, database: &str, params: &ConfigParams) -> Result<(), IngestError> {
        let url = self.url("/ingest/config/");
        let payload = build_config_payload(database, params);
        let response = self.client.put(&url, payload, false).await?;
        ResponseParser::raise_error(&url, &response, -1, -1)?;
        Ok(())
    }

    /// `PUT /ingest/database/{db}`, long operation: no read timeout.
    pub async fn publish_database(&self, database: &str) -> Result<(), IngestError> {
        let url = self.url(&format!("/ingest/database/{database}"));
        let response = self.client.put(&url, json!({}), true).await?;
        ResponseParser::raise_error(&url, &response, -1, -1)?;
        Ok(())
    }

    pub async fn database_status(&self, database: &str, family: &str) -> Result<DatabaseStatus, IngestError> {
        let url = self.url("/replication/config");
        let response = self.client.get(&url, json!({}), true).await?;
        ResponseParser::raise_error(&url, &response, -1, -1)?;
        Ok(ResponseParser::parse_database_status(&response, database, family))
    }

    pub async fn start_transaction(&self, database: &str) -> Result<i64, IngestError> {
        let url = self.url("/ingest/trans");
        let response = self
            .client
            .post(&url, json!({ "database": database }), true, false)
            .await?;
        ResponseParser::raise_error(&url, &response, -1, -1)?;
        response
            .pointer("/transaction/id")
            .and_then(Value::as_i64)
            .ok_or_else(|| IngestError::Invariant(format!("{url} response missing transaction.id")))
    }

    pub async fn list_transactions(
        &self,
        database: &str,
        states: &[TransactionState],
    ) -> Result<Vec<i64>, IngestError> {
        let url = self.url(&format!("/ingest/trans?database={database}"));
        let response = self.client.get(&url, json!({}), true).await?;
        ResponseParser::raise_error(&url, &response, -1, -1)?;
        Ok(ResponseParser::filter_transactions(&response, database, states))
    }

    /// `PUT /ingest/trans/{id}?abort=0|1`, long operation.
    /// Called from the ingester's `finally` block, so failures here must
    /// still let the caller proceed to `unlock_contribfiles`.
    pub async fn close_transaction(&self, transaction_id: i64, commit: bool) -> Result<(), IngestError> {
        let abort = if commit { 0 } else { 1 };
        let url = self.url(&format!("/ingest/trans/{transaction_id}?abort={abort}"));
        let response = self.client.put(&url, json!({}), true).await?;
        ResponseParser::raise_error(&url, &response, -1, -1)?;
        Ok(())
    }

    /// `POST /ingest/chunk`: locate the single worker owning `chunk`.
    pub async fn locate_chunk(&self, database: &str, chunk: i32) -> Result<(Vec<String>, u16), IngestError> {
        let url = self.url("/ingest/chunk");
        let response = self
            .client
            .post(&url, json!({ "chunk": chunk, "database": database }), true, false)
            .await?;
        ResponseParser::raise_error(&url, &response, -1, -1)?;
        ResponseParser::get_chunk_location(&response)
            .ok_or_else(|| IngestError::Invariant(format!("{url} response missing location")))
    }

    /// `GET /ingest/regular`: locate every worker that should receive a
    /// copy of a regular-table file.
    pub async fn locate_regular(&self, database: &str, table: &str) -> Result<Vec<(Vec<String>, u16)>, IngestError> {
        let url = self.url("/ingest/regular");
        let response = self
            .client
            .get(&url, json!({ "database": database, "table": table }), true)
            .await?;
        ResponseParser::raise_error(&url, &response, -1, -1)?;
        Ok(ResponseParser::get_regular_table_locations(&response))
    }

    pub async fn build_secondary_index(&self, index_json: &Value) -> Result<(), IngestError> {
        let url = self.url("/ingest/index/secondary");
        let response = self.client.post(&url, index_json.clone(), true, true).await?;
        ResponseParser::raise_error(&url, &response, -1, -1)?;
        Ok(())
    }

    pub async fn create_sql_index(&self, index_json: &Value) -> Result<(), IngestError> {
        let url = self.url("/replication/sql/index");
        let response = self.client.post(&url, index_json.clone(), true, true).await?;
        ResponseParser::raise_error(&url, &response, -1, -1)?;
        Ok(())
    }

    pub async fn deploy_table_stats(&self, database: &str, table: &str) -> Result<(), IngestError> {
        let url = self.url("/ingest/table-stats/");
        let response = self
            .client
            .post(&url, json!({ "database": database, "table": table }), true, true)
            .await?;
        ResponseParser::raise_error(&url, &response, -1, -1)?;
        Ok(())
    }

    /// Dispatches an admin [`TransactionAdminCommand`].
    pub async fn transaction_admin(
        &self,
        command: TransactionAdminCommand,
        database: &str,
        transaction_id: Option<i64>,
    ) -> Result<Value, IngestError> {
        match command {
            TransactionAdminCommand::Start => {
                let id = self.start_transaction(database).await?;
                Ok(json!({ "transaction_id": id }))
            }
            TransactionAdminCommand::Close => {
                let id = transaction_id
                    .ok_or_else(|| IngestError::Invariant("close requires --transaction-id".to_string()))?;
                self.close_transaction(id, true).await?;
                Ok(json!({ "closed": id }))
            }
            TransactionAdminCommand::CloseAll => {
                let started = self
                    .list_transactions(database, &[TransactionState::Started, TransactionState::IsStarting])
                    .await?;
                for id in &started {
                    self.close_transaction(*id, true).await?;
                }
                Ok(json!({ "closed": started }))
            }
            TransactionAdminCommand::AbortAll => {
                let started = self
                    .list_transactions(
                        database,
                        &[
                            TransactionState::Started,
                            TransactionState::IsStarting,
                            TransactionState::IsFinishing,
                        ],
                    )
                    .await?;
                for id in &started {
                    self.close_transaction(*id, false).await?;
                }
                Ok(json!({ "aborted": started }))
            }
            TransactionAdminCommand::ListStarted => {
                let started = self
                    .list_transactions(database, &[TransactionState::Started, TransactionState::IsStarting])
                    .await?;
                Ok(json!({ "started": started }))
            }
        }
    }
}

fn build_config_payload(database: &str, params: &ConfigParams) -> Value {
    let mut payload = json!({ "database": database });
    let obj = payload.as_object_mut().unwrap();
    if let Some(v) = &params.cainfo {
        obj.insert("CAINFO".to_string(), json!(v));
    }
    if let Some(v) = params.ssl_verifypeer {
        obj.insert("SSL_VERIFYPEER".to_string(), json!(v as i32));
    }
    if let Some(v) = params.low_speed_limit {
        obj.insert("LOW_SPEED_LIMIT".to_string(), json!(v));
    }
    if let Some(v) = params.low_speed_time {
        obj.insert("LOW_SPEED_TIME".to_string(), json!(v));
    }
    if let Some(v) = params.async_proc_limit {
        obj.insert("ASYNC_PROC_LIMIT".to_string(), json!(v));
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ConfigParams {
        ConfigParams {
            cainfo: Some("/etc/ssl/ca.pem".to_string()),
            ssl_verifypeer: Some(true),
            low_speed_limit: Some(1024),
            low_speed_time: Some(60),
            async_proc_limit: None,
        }
    }

    #[test]
    fn config_payload_carries_only_set_params() {
        let payload = build_config_payload("gaia", &params());
        assert_eq!(payload["database"], json!("gaia"));
        assert_eq!(payload["SSL_VERIFYPEER"], json!(1));
        assert_eq!(payload["LOW_SPEED_LIMIT"], json!(1024));
        assert!(payload.get("ASYNC_PROC_LIMIT").is_none());
    }

    #[test]
    fn url_joins_base_and_path() {
        let server = ReplicationServer::new(
            HttpClient::new(
                ingest_core::Credentials::new("/nonexistent"),
                34,
                std::time::Duration::from_secs(5),
            )
            .unwrap(),
            "http://host:25081/",
        );
        assert_eq!(server.url("/meta/version"), "http://host:25081/meta/version");
    }
}
