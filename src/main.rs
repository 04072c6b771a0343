use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use hivesearch::app::{builtin_classes, App};
use hivesearch::config::AppConfig;
use hivesearch::ml::ModelSet;
use hivesearch::queue::{IndexQueue, TaskQueue};
use hivesearch::server;
use hivesearch::store::Store;
use hivesearch::telemetry;

#[derive(Parser)]
#[command(
    name = "hivesearch",
    about = "A self-hosted enterprise knowledge search backend",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/hivesearch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full backend: workers, indexer, scheduler, HTTP API
    Serve,

    /// Create the data directory and database schema
    Init,

    /// Print queue depths and store counts
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            let models = ModelSet::remote(&config.models)?;
            let app = App::bootstrap(config, builtin_classes(), models).await?;
            app.start_background();
            server::run_server(app.clone()).await?;
            app.shutdown().await;
        }
        Commands::Init => {
            std::fs::create_dir_all(&config.data_dir)?;
            Store::open(&config.store_path()).await?;
            TaskQueue::open(&config.task_queue_path()).await?;
            IndexQueue::open(&config.index_queue_path()).await?;
            telemetry::load_or_create_install_id(&config.install_id_path())?;
            println!("initialized {}", config.data_dir.display());
        }
        Commands::Status => {
            let store = Store::open(&config.store_path()).await?;
            let tasks = TaskQueue::open(&config.task_queue_path()).await?;
            let index_queue = IndexQueue::open(&config.index_queue_path()).await?;

            println!("sources:        {}", store.load_sources().await?.len());
            println!("documents:      {}", store.count_documents(None).await?);
            println!("chunks:         {}", store.count_chunks().await?);
            println!("crawl tasks:    {}", tasks.len().await?);
            println!("docs to index:  {}", index_queue.len().await?);
        }
    }

    Ok(())
}
