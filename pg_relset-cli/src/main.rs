//! Administration and coordinator CLI for pg_relset clusters.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use pg_relset::coordination_store::EtcdStore;
use pg_relset::model::Table;
use pg_relset::{Cluster, Settings};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pg_relset", about = "CDC control plane for PostgreSQL replication sets")]
struct Cli {
    /// Path to a TOML settings file. Falls back to `PG_RELSET_*` env vars.
    #[arg(long, env = "PG_RELSET_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the cluster root entry in the coordination store.
    Initialize,

    /// Create a new replication set.
    CreateSet {
        set_name: String,
        /// Member database connection strings.
        #[arg(long = "dsn", required = true)]
        dsns: Vec<String>,
        /// Path to a JSON file listing the captured tables.
        #[arg(long)]
        tables: PathBuf,
    },

    /// Reconcile a replication set's membership and table list.
    UpdateSet {
        set_name: String,
        #[arg(long = "dsn", required = true)]
        dsns: Vec<String>,
        #[arg(long)]
        tables: PathBuf,
    },

    /// Remove a replication set.
    DropSet { set_name: String },

    /// Re-stamp the cluster's software version.
    Upgrade {
        #[arg(long)]
        force: bool,
    },

    /// Run the coordinator loop for one member database.
    RunCoordinator {
        dsn: String,
        #[arg(long = "set", required = true)]
        sets: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    let store = Arc::new(EtcdStore::connect(&settings.coordination_endpoints).await?);
    let cluster = Cluster::new(settings.cluster_name.clone(), store);

    match cli.command {
        Command::Initialize => {
            pg_relset::admin::initialize_cluster(&cluster).await?;
            println!("cluster {:?} initialized", cluster.name());
        }
        Command::CreateSet { set_name, dsns, tables } => {
            let tables = load_tables(&tables)?;
            pg_relset::admin::create_set(&cluster, &set_name, &dsns, tables).await?;
            println!("replication set {set_name:?} created");
        }
        Command::UpdateSet { set_name, dsns, tables } => {
            let tables = load_tables(&tables)?;
            pg_relset::admin::update_set(&cluster, &set_name, &dsns, tables).await?;
            println!("replication set {set_name:?} updated");
        }
        Command::DropSet { set_name } => {
            pg_relset::admin::drop_set(&cluster, &set_name).await?;
            println!("replication set {set_name:?} dropped");
        }
        Command::Upgrade { force } => {
            pg_relset::admin::upgrade_cluster(&cluster, force).await?;
            println!("cluster {:?} upgraded", cluster.name());
        }
        Command::RunCoordinator { dsn, sets } => {
            run_coordinator(&cluster, &settings, &dsn, &sets).await?;
        }
    }

    Ok(())
}

fn load_tables(path: &PathBuf) -> Result<Vec<Table>, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

async fn run_coordinator(
    cluster: &Cluster,
    settings: &Settings,
    dsn: &str,
    sets: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    use pg_relset::consumer::Consumer;
    use pg_relset::coordinator::Coordinator;
    use tokio::sync::mpsc;

    let (client, connection_task) = Coordinator::connect(dsn).await?;

    let mut coordinator = Coordinator::new();
    let handle = coordinator.handle();
    let coordinator_client = client.clone();
    let coordinator_task = tokio::spawn(async move { coordinator.run(coordinator_client).await });

    let consumer_group = settings.consumer_identity();
    let mut consumer_tasks = Vec::new();
    let mut stop_handles = Vec::new();
    for set_name in sets {
        let (tx, rx) = mpsc::channel(1);
        handle.subscribe(set_name.clone(), rx).await?;
        let mut consumer = Consumer::new(
            client.clone(),
            set_name.clone(),
            cluster,
            consumer_group.clone(),
            std::time::Duration::from_millis(settings.poll_interval_ms),
        );
        stop_handles.push(consumer.stop_handle());
        let cluster = cluster.clone();
        consumer_tasks.push(tokio::spawn(async move { consumer.run(&cluster, tx).await }));
    }

    tokio::signal::ctrl_c().await?;
    for stop in &stop_handles {
        stop.request();
    }
    for task in consumer_tasks {
        let _ = task.await;
    }
    handle.stop();
    let _ = coordinator_task.await;
    connection_task.abort();
    Ok(())
}
