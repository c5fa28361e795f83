use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use execplane::config::{ExecplaneConfig, LogFormat};
use execplane::model::{Actor, Role};
use execplane::orchestrator::ClusterAccess;
use execplane::query::{list_executions, ExecutionQuery};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "execplane",
    about = "Control plane for geospatial script executions on a container cluster",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $EXECPLANE_CONFIG, then /etc/execplane/execplane.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scheduler + workers)
    Serve {
        /// Bind address, overrides the config file
        #[arg(long)]
        bind: Option<String>,
    },

    /// Create or upgrade the database schema and exit
    Migrate,

    /// Compute cluster capacity once and print it
    ClusterStatus {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Inspect executions
    Executions {
        #[command(subcommand)]
        action: ExecutionsAction,
    },
}

#[derive(Subcommand)]
enum ExecutionsAction {
    /// List executions, newest first
    List {
        /// Only executions in this status (repeatable)
        #[arg(long)]
        status: Vec<String>,

        /// Only executions of this user
        #[arg(long)]
        user: Option<Uuid>,

        /// Page size
        #[arg(long, default_value = "20")]
        limit: u32,
    },
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_tracing(format: LogFormat) {
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter());
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // The log format comes from the config, so loading it reports through a
    // scoped text subscriber.
    let bootstrap = tracing_subscriber::fmt().with_env_filter(env_filter()).finish();
    let mut cfg = tracing::subscriber::with_default(bootstrap, || {
        ExecplaneConfig::resolve(cli.config.as_deref())
    })?;
    if cli.json_logs {
        cfg.logging.format = LogFormat::Json;
    }
    init_tracing(cfg.logging.format);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                cfg.server.bind = bind;
            }
            tracing::info!(bind = %cfg.server.bind, "Starting execplane daemon");
            execplane::serve(cfg).await?;
        }
        Commands::Migrate => {
            let path = cfg.server.database_path.to_string_lossy().to_string();
            execplane::storage::open_pool(&path)?;
            println!("Database at {path} is up to date.");
        }
        Commands::ClusterStatus { json } => {
            let access = ClusterAccess::connect_docker(&cfg.registry).await;
            let cache = execplane::build_status_cache(&cfg, &access);
            let status = cache.refresh().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("\nCluster status ({})", status.computed_at.to_rfc3339());
                println!("Swarm active: {}", status.swarm_active);
                if let Some(err) = &status.error {
                    println!("Error:        {err}");
                }
                println!(
                    "{:<20} | {:<8} | {:<10} | {:>6} | {:>10} | {:>14}",
                    "Hostname", "Role", "State", "Tasks", "Free CPUs", "Free memory MB"
                );
                println!("{:-<20}-|-{:-<8}-|-{:-<10}-|-{:->6}-|-{:->10}-|-{:->14}", "", "", "", "", "", "");
                for node in &status.nodes {
                    println!(
                        "{:<20} | {:<8} | {:<10} | {:>6} | {:>10.2} | {:>14}",
                        node.hostname,
                        node.role,
                        node.state,
                        node.task_count,
                        node.available.nano_cpus as f64 / 1e9,
                        node.available.memory_bytes / (1024 * 1024),
                    );
                }
                println!(
                    "\n{} node(s), room for {} more default-sized task(s)\n",
                    status.totals.nodes, status.totals.available_capacity
                );
            }
        }
        Commands::Executions { action } => match action {
            ExecutionsAction::List { status, user, limit } => {
                let path = cfg.server.database_path.to_string_lossy().to_string();
                let pool = execplane::storage::open_pool(&path)?;
                let conn = pool.get()?;

                let operator = Actor {
                    user_id: Uuid::nil(),
                    role: Role::Superadmin,
                };
                let mut params = HashMap::new();
                if !status.is_empty() {
                    params.insert("status".to_string(), status.join(","));
                }
                if let Some(user) = user {
                    params.insert("user_id".to_string(), user.to_string());
                }
                params.insert("per_page".to_string(), limit.to_string());
                let q = ExecutionQuery::parse(&params, &operator)?;
                let (records, total) = list_executions(&conn, &operator, &q)?;

                if records.is_empty() {
                    println!("No executions found.");
                } else {
                    println!("{:<36} | {:<9} | {:>8} | Created", "Execution", "Status", "Progress");
                    println!("{:-<36}-|-{:-<9}-|-{:->8}-|-{:-<25}", "", "", "", "");
                    for r in &records {
                        let e = &r.execution;
                        println!(
                            "{:<36} | {:<9} | {:>7}% | {}",
                            e.id,
                            e.status.as_str(),
                            e.progress,
                            e.created_at.to_rfc3339()
                        );
                    }
                    println!("({} of {total} shown)", records.len());
                }
            }
        },
    }

    Ok(())
}
