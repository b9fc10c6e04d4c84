use crate::server::TransactionAdminCommand;
use clap::Parser;
use std::time::Duration;

/// CLI surface for the ingest orchestrator binary, one process per worker.
/// Every flag falls back to an environment variable of the same
/// name so a deployment can be driven entirely by pod env vars.
#[derive(Debug, Parser)]
#[clap(author, name = "ingest-agent", version, about)]
pub struct Args {
    /// Postgres connection string backing the contribution queue.
    #[clap(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Base URL of the replication/ingest REST API.
    #[clap(long, env = "SERVER_URL")]
    pub server_url: String,

    /// Remote metadata.json describing the dataset to ingest.
    #[clap(long, env = "METADATA_URL")]
    pub metadata_url: String,

    /// Catalog database (schema) name.
    #[clap(long, env = "DATABASE")]
    pub database: String,

    #[clap(long, env = "NUM_STRIPES", default_value_t = 340)]
    pub num_stripes: u32,

    #[clap(long, env = "NUM_SUB_STRIPES", default_value_t = 3)]
    pub num_sub_stripes: u32,

    /// Path to the single-line `auth_key` file; falls back to an
    /// interactive prompt when absent.
    #[clap(long, env = "CREDENTIALS_FILE", default_value = "credentials")]
    pub credentials_file: String,

    /// Identity this process locks rows under; defaults to the pod hostname.
    #[clap(long, env = "WORKER_ID")]
    pub worker_id: Option<String>,

    /// Comma-separated data mirror roots the load balancer rotates across.
    #[clap(long, env = "DATA_MIRRORS", value_delimiter = ',')]
    pub data_mirrors: Vec<String>,

    #[clap(long, env = "PROTOCOL_VERSION", default_value_t = ingest_core::PROTOCOL_VERSION)]
    pub protocol_version: i32,

    /// HTTP read/write timeout for short operations, in seconds.
    #[clap(long, env = "READ_WRITE_TIMEOUT_SECS", default_value_t = 30)]
    pub read_write_timeout_secs: u64,

    #[clap(subcommand)]
    pub command: Command,
}

impl Args {
    pub fn worker_id(&self) -> String {
        self.worker_id
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "unknown-worker".to_string())
    }

    pub fn read_write_timeout(&self) -> Duration {
        Duration::from_secs(self.read_write_timeout_secs)
    }
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// One-time-per-dataset setup: create the queue schema, load the
    /// manifest, populate `contribfile_queue`, register the database and
    /// tables with the server, and configure ingest parameters.
    Bootstrap,
    /// Run the hot loop against an already-bootstrapped dataset.
    Ingest {
        /// Inverse of how many transactions to split the remaining work
        /// into: `batch_size = floor(unfinished / fraction) + 1`.
        #[clap(long, default_value_t = 4)]
        fraction: u32,
    },
    /// Dispatch a transaction admin command directly against the server.
    Admin {
        #[clap(value_enum)]
        command: TransactionAdminCommand,
        #[clap(long)]
        transaction_id: Option<i64>,
    },
}
