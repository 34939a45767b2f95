mod config;
mod serve_cmd;
mod status_cmd;

use anyhow::Context;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use taskmaster_core::{CoreConfig, TaskSpec};

#[derive(Parser)]
#[command(name = "taskmaster", about = "Resource-aware distributed task orchestrator")]
struct Cli {
    /// Database URL (overrides TASKMASTER_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a taskmaster config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/taskmaster")]
        db_url: String,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the database (if needed) and run migrations
    DbInit,
    /// Run the Master loop: bootstrap, dispatch, and reconnect until interrupted
    Serve,
    /// Submit a task for execution
    Submit {
        /// Docker image to run
        #[arg(long)]
        image: String,
        /// Command to execute inside the container
        #[arg(long)]
        command: Option<String>,
        /// Required CPU cores
        #[arg(long, default_value_t = 1.0)]
        cpu: f64,
        /// Required memory, in gigabytes
        #[arg(long, default_value_t = 1.0)]
        memory: f64,
        /// Required storage, in gigabytes
        #[arg(long)]
        storage: Option<f64>,
        /// Required GPUs
        #[arg(long)]
        gpu: Option<f64>,
        /// Submitting user's id, for filtering and audit
        #[arg(long)]
        user: Option<String>,
    },
    /// Cancel a pending or running task
    Cancel {
        task_id: Uuid,
    },
    /// Worker registry inspection
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },
    /// Show task status, optionally narrowed to a user or worker
    Status {
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        worker: Option<String>,
    },
}

#[derive(Subcommand)]
enum WorkerCommands {
    /// List every registered worker and its current allocation
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve => {
            let db_config = config::resolve_db_config(cli.database_url.as_deref());
            let core_config = CoreConfig::from_env();
            serve_cmd::run_serve(db_config, core_config).await?;
        }
        Commands::Submit {
            image,
            command,
            cpu,
            memory,
            storage,
            gpu,
            user,
        } => {
            let db_config = config::resolve_db_config(cli.database_url.as_deref());
            let core = serve_cmd::bootstrap_core(&db_config, CoreConfig::from_env()).await?;
            let task_id = core
                .submit(TaskSpec {
                    docker_image: image,
                    command,
                    cpu_required: cpu,
                    memory_required: memory,
                    storage_required: storage,
                    gpu_required: gpu,
                    user_id: user,
                })
                .await?;
            println!("submitted task {task_id}");
            println!(
                "note: dispatch happens on the running `taskmaster serve` process's next pass; this command only persists the submission"
            );
        }
        Commands::Cancel { task_id } => {
            let db_config = config::resolve_db_config(cli.database_url.as_deref());
            let core = serve_cmd::bootstrap_core(&db_config, CoreConfig::from_env()).await?;
            core.cancel(task_id).await?;
            println!("cancel requested for task {task_id}");
        }
        Commands::Worker { command } => match command {
            WorkerCommands::List => {
                let db_config = config::resolve_db_config(cli.database_url.as_deref());
                let pool = taskmaster_db::pool::create_pool(&db_config).await?;
                status_cmd::run_worker_list(&pool).await?;
                pool.close().await;
            }
        },
        Commands::Status { user, worker } => {
            let db_config = config::resolve_db_config(cli.database_url.as_deref());
            let pool = taskmaster_db::pool::create_pool(&db_config).await?;
            status_cmd::run_status(&pool, user.as_deref(), worker.as_deref()).await?;
            pool.close().await;
        }
    }

    Ok(())
}

fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    Ok(())
}

async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let db_config = config::resolve_db_config(cli_db_url);

    println!("Initializing taskmaster database...");

    taskmaster_db::pool::ensure_database_exists(&db_config)
        .await
        .context("failed to ensure database exists")?;

    let pool = taskmaster_db::pool::create_pool(&db_config).await?;
    taskmaster_db::pool::run_migrations(&pool).await?;

    let counts = taskmaster_db::pool::table_counts(&pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    pool.close().await;
    println!("taskmaster db-init complete.");
    Ok(())
}
