use crate::contribution::Contribution;
use crate::error::IngestError;
use crate::server::{ConfigParams, ReplicationServer};
use ingest_core::FileFormats;
use ingest_http::{DatabaseStatus, LoadBalancedUrl, TransactionState};
use ingest_queue::{ContribRow, ContributionQueue};
use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

const LOCK_ACQUIRE_POLL: Duration = Duration::from_secs(10);
const CONTRIBUTION_POLL: Duration = Duration::from_secs(5);
const CHUNK_LOCATION_CACHE_SIZE: usize = 4096;

/// Per-worker main loop that composes the queue, the server, and the
/// contribution state machine into one ingest run for a single database.
pub struct Ingester {
    queue: ContributionQueue,
    server: ReplicationServer,
    worker_id: String,
    database: String,
    family: String,
    charset_name: String,
    formats: FileFormats,
    root_url: LoadBalancedUrl,
    chunk_location_cache: AsyncMutex<LruCache<i32, (String, u16)>>,
}

impl Ingester {
    pub fn new(
        queue: ContributionQueue,
        server: ReplicationServer,
        worker_id: String,
        database: String,
        family: String,
        charset_name: String,
        formats: FileFormats,
        mirrors: Vec<String>,
    ) -> Result<Self, IngestError> {
        let root_url = LoadBalancedUrl::new("", mirrors)
            .map_err(|e| IngestError::Invariant(e.to_string()))?;
        Ok(Self {
            queue,
            server,
            worker_id,
            database,
            family,
            charset_name,
            formats,
            root_url,
            chunk_location_cache: AsyncMutex::new(LruCache::new(
                NonZeroUsize::new(CHUNK_LOCATION_CACHE_SIZE).unwrap(),
            )),
        })
    }

    /// Refuses to start an ingest run that would race a prior one.
    pub async fn check_sanity(&self) -> Result<(), IngestError> {
        match self.server.database_status(&self.database, &self.family).await? {
            DatabaseStatus::Published => Err(IngestError::SanityCheck(format!(
                "database {} is already published",
                self.database
            ))),
            DatabaseStatus::RegisteredNotPublished => {
                let inprogress = self.queue.select_inprogress_contribfiles(&self.database).await?;
                if !inprogress.is_empty() {
                    return Err(IngestError::SanityCheck(format!(
                        "{} contribution(s) are already locked for {}, a concurrent run may be active",
                        inprogress.len(),
                        self.database
                    )));
                }
                let started = self
                    .server
                    .list_transactions(
                        &self.database,
                        &[
                            TransactionState::Started,
                            TransactionState::IsStarting,
                            TransactionState::IsFinishing,
                        ],
                    )
                    .await?;
                if !started.is_empty() {
                    return Err(IngestError::SanityCheck(format!(
                        "{} transaction(s) already in progress for {}, a concurrent run may be active",
                        started.len(),
                        self.database
                    )));
                }
                Ok(())
            }
            DatabaseStatus::NotRegistered => Ok(()),
        }
    }

    /// One-time-per-dataset bootstrap, meant to be invoked by exactly one
    /// worker upstream of any `ingest()` call.
    pub async fn database_register_and_config(
        &self,
        database_json: &Value,
        tables_json: &[&Value],
        params: &ConfigParams,
    ) -> Result<(), IngestError> {
        self.server.register_database(database_json).await?;
        for table_json in tables_json {
            self.server.register_table(table_json).await?;
        }
        self.server.set_config(&self.database, params).await?;
        Ok(())
    }

    /// The hot loop.
    #[tracing::instrument(skip(self), fields(database = %self.database))]
    pub async fn ingest(&self, fraction: u32) -> Result<(), IngestError> {
        self.queue.set_transaction_size(&self.database, fraction).await?;

        loop {
            let locked = loop {
                let locked = self.queue.lock_contribfiles(&self.database, &self.worker_id).await?;
                if !locked.is_empty() {
                    break locked;
                }
                if self.queue.all_succeed(&self.database).await? {
                    tracing::info!("all contributions succeeded, ingest complete");
                    return Ok(());
                }
                tokio::time::sleep(LOCK_ACQUIRE_POLL).await;
            };

            let outcome = self.run_transaction(&locked).await;
            self.queue
                .unlock_contribfiles(&self.worker_id, outcome.is_ok())
                .await?;
            outcome?;
        }
    }

    /// Runs one super-transaction over `locked`. Always closes the
    /// transaction it opened before returning, success or failure; the
    /// caller is then responsible for `unlock_contribfiles`.
    async fn run_transaction(&self, locked: &[ContribRow]) -> Result<(), IngestError> {
        let transaction_id = self.server.start_transaction(&self.database).await?;

        let outcome: Result<(), IngestError> = async {
            let mut contributions = self.build_contributions(locked).await?;
            self.ingest_all_contributions(transaction_id, &mut contributions).await
        }
        .await;

        if let Err(close_err) = self.server.close_transaction(transaction_id, outcome.is_ok()).await {
            tracing::error!(error = %close_err, transaction_id, "failed to close transaction during cleanup");
        }

        outcome
    }

    /// Resolves the target worker(s) for each locked row.
    async fn build_contributions(&self, locked: &[ContribRow]) -> Result<Vec<Contribution>, IngestError> {
        let mut contributions = Vec::with_capacity(locked.len());

        for row in locked {
            let url = self.root_url.join(&row.filepath);
            let spec = row.into();

            match row.chunk_id {
                Some(chunk_id) => {
                    let (host, port) = self.resolve_chunk_worker(chunk_id).await?;
                    contributions.push(Contribution::new(
                        spec,
                        host,
                        port,
                        url,
                        self.charset_name.clone(),
                    ));
                }
                None => {
                    let locations = self.server.locate_regular(&self.database, &row.table).await?;
                    for (hosts, port) in locations {
                        let host = self.pick_reachable(&hosts, port).await;
                        contributions.push(Contribution::new(
                            row.into(),
                            host,
                            port,
                            url.clone(),
                            self.charset_name.clone(),
                        ));
                    }
                }
            }
        }

        Ok(contributions)
    }

    async fn resolve_chunk_worker(&self, chunk_id: i32) -> Result<(String, u16), IngestError> {
        if let Some(cached) = self.chunk_location_cache.lock().await.get(&chunk_id) {
            return Ok(cached.clone());
        }

        let (hosts, port) = self.server.locate_chunk(&self.database, chunk_id).await?;
        let host = self.pick_reachable(&hosts, port).await;

        self.chunk_location_cache
            .lock()
            .await
            .put(chunk_id, (host.clone(), port));
        Ok((host, port))
    }

    /// Picks the first reachable mirror FQDN, falling back to the first
    /// candidate if none answer the probe.
    async fn pick_reachable(&self, hosts: &[String], port: u16) -> String {
        for host in hosts {
            let probe = format!("http://{host}:{port}/meta/version");
            if self.server.client().is_reachable(&probe).await {
                return host.clone();
            }
        }
        tracing::warn!(?hosts, port, "no mirror answered the reachability probe, using the first");
        hosts.first().cloned().unwrap_or_default()
    }

    /// Single-threaded cooperative poll loop over one transaction's
    /// contributions.
    async fn ingest_all_contributions(
        &self,
        transaction_id: i64,
        contributions: &mut [Contribution],
    ) -> Result<(), IngestError> {
        loop {
            let mut started = 0u32;
            let mut notfinished = 0u32;
            let mut justfinished = 0u32;
            let mut alreadyfinished = 0u32;

            for c in contributions.iter_mut() {
                if c.finished() {
                    alreadyfinished += 1;
                } else if c.request_id().is_none() {
                    c.start_async(self.server.client(), transaction_id, &self.formats).await?;
                    started += 1;
                } else if c.monitor(self.server.client()).await? {
                    justfinished += 1;
                } else {
                    notfinished += 1;
                }
            }

            tracing::debug!(
                started,
                notfinished,
                justfinished,
                alreadyfinished,
                "contribution poll pass complete"
            );

            if started + notfinished == 0 {
                return Ok(());
            }
            tokio::time::sleep(CONTRIBUTION_POLL).await;
        }
    }
}
