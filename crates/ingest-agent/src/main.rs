use anyhow::Context;
use clap::Parser;
use ingest_agent::{Args, Command, ConfigParams, Ingester, ReplicationServer};
use ingest_core::{Credentials, MIN_SUPPORTED_MANIFEST_VERSION};
use ingest_http::HttpClient;
use ingest_manifest::{HttpDocumentLoader, Manifest};
use ingest_queue::ContributionQueue;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

const MAX_SUPPORTED_MANIFEST_VERSION: i32 = 100;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = Args::parse();
    if let Err(err) = run(args).await {
        tracing::error!(error = ?err, "ingest-agent exited with an error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let worker_id = args.worker_id();
    let credentials = Credentials::new(&args.credentials_file);
    let client = HttpClient::new(credentials, args.protocol_version, args.read_write_timeout())
        .context("constructing HTTP client")?;
    let server = ReplicationServer::new(client, &args.server_url);

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&args.database_url)
        .await
        .context("connecting to the contribution queue database")?;
    let queue = ContributionQueue::new(pool);

    match args.command {
        Command::Bootstrap => bootstrap(&args, server, queue, worker_id).await,
        Command::Ingest { fraction } => ingest(&args, server, queue, worker_id, fraction).await,
        Command::Admin { command, transaction_id } => {
            let result = server.transaction_admin(command, &args.database, transaction_id).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
    }
}

async fn load_manifest(args: &Args) -> anyhow::Result<Manifest> {
    let loader = HttpDocumentLoader::new();
    Manifest::load(
        &args.metadata_url,
        &args.database,
        args.num_stripes,
        args.num_sub_stripes,
        &loader,
        MIN_SUPPORTED_MANIFEST_VERSION,
        MAX_SUPPORTED_MANIFEST_VERSION,
    )
    .await
    .context("loading dataset manifest")
}

async fn bootstrap(
    args: &Args,
    server: ReplicationServer,
    queue: ContributionQueue,
    worker_id: String,
) -> anyhow::Result<()> {
    tracing::info!(database = %args.database, worker_id, "bootstrapping dataset");

    queue.ensure_schema().await?;
    queue.init_mutex().await?;

    let manifest = load_manifest(args).await?;
    let inserted = queue.insert_contribfiles(&manifest).await?;
    tracing::info!(inserted, "contribfile_queue populated");

    let ingester = Ingester::new(
        queue,
        server,
        worker_id,
        args.database.clone(),
        manifest.family(),
        manifest.charset_name().to_string(),
        manifest.formats().clone(),
        args.data_mirrors.clone(),
    )?;
    ingester.check_sanity().await?;

    let tables_json = manifest.ordered_tables_json();
    let params = ConfigParams {
        cainfo: None,
        ssl_verifypeer: Some(true),
        low_speed_limit: Some(1024),
        low_speed_time: Some(60),
        async_proc_limit: Some(4),
    };
    ingester
        .database_register_and_config(manifest.database_json(), &tables_json, &params)
        .await?;

    tracing::info!(database = %args.database, "bootstrap complete");
    Ok(())
}

async fn ingest(
    args: &Args,
    server: ReplicationServer,
    queue: ContributionQueue,
    worker_id: String,
    fraction: u32,
) -> anyhow::Result<()> {
    let manifest = load_manifest(args).await?;

    let ingester = Ingester::new(
        queue,
        server,
        worker_id,
        args.database.clone(),
        manifest.family(),
        manifest.charset_name().to_string(),
        manifest.formats().clone(),
        args.data_mirrors.clone(),
    )?;

    ingester.check_sanity().await?;
    ingester.ingest(fraction).await?;
    Ok(())
}
