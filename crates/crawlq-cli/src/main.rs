use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crawlq_core::queue::MessageQueue;
use crawlq_core::record::{Filter, FindOptions, RecordStore, SortOrder};
use crawlq_core::{PlanRegistry, ResultHandler, Task, TracingWorkerReporter, WorkerConfig, WorkerPool};
use crawlq_db::{Database, DatabaseConfig, QueueConfig};
use crawlq_plans::ReqwestFetcher;

#[derive(Parser)]
#[command(name = "crawlq", version, about = "Queue-driven crawl and extraction worker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume tasks from the queue and run them through the plans
    Worker {
        /// Number of concurrent workers
        #[arg(short, long, env = "CRAWLQ_WORKERS", default_value_t = 3)]
        workers: usize,

        /// Queue to consume from and publish child tasks to
        #[arg(short, long, env = "CRAWLQ_QUEUE", default_value = "parser_queue")]
        queue: String,

        /// Deadline for a single plan execution, in seconds
        #[arg(long, env = "CRAWLQ_PLAN_TIMEOUT_SECS")]
        plan_timeout: Option<u64>,
    },

    /// Publish a root task
    Seed {
        /// URL to start from
        #[arg(short, long)]
        url: String,

        /// Plan to run (defaults to the plan that matches the URL)
        #[arg(short, long)]
        plan: Option<String>,

        /// How many link hops to follow from this URL
        #[arg(short, long, default_value_t = 1)]
        max_depth: u32,

        /// Plan option as key=value; the value is parsed as JSON when possible
        #[arg(short, long = "option", value_parser = parse_option)]
        options: Vec<(String, serde_json::Value)>,

        #[arg(short, long, env = "CRAWLQ_QUEUE", default_value = "parser_queue")]
        queue: String,
    },

    /// Query stored records
    Records {
        /// JSON filter, e.g. '{"plan_name": "hackernews", "depth": {"gt": 0}}'
        #[arg(short, long)]
        filter: Option<String>,

        #[arg(short, long, default_value_t = 20)]
        limit: u64,

        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Sort key as field:asc or field:desc; repeatable
        #[arg(short, long, value_parser = parse_sort)]
        sort: Vec<(String, SortOrder)>,
    },

    /// List registered plans
    Plans,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("crawlq=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Worker {
            workers,
            queue,
            plan_timeout,
        } => cmd_worker(workers, queue, plan_timeout).await?,
        Commands::Seed {
            url,
            plan,
            max_depth,
            options,
            queue,
        } => cmd_seed(&url, plan, max_depth, options, &queue).await?,
        Commands::Records {
            filter,
            limit,
            offset,
            sort,
        } => cmd_records(filter.as_deref(), limit, offset, sort).await?,
        Commands::Plans => cmd_plans()?,
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(db)
}

fn build_registry() -> Result<PlanRegistry> {
    let registry = PlanRegistry::new();
    let fetcher = ReqwestFetcher::new().context("Failed to create HTTP client")?;
    crawlq_plans::register_builtin(&registry, fetcher).map_err(|e| anyhow::anyhow!(e))?;
    Ok(registry)
}

async fn cmd_worker(workers: usize, queue_name: String, plan_timeout: Option<u64>) -> Result<()> {
    if workers == 0 {
        bail!("--workers must be at least 1");
    }

    let db = connect_db().await?;
    let mut queue_config = QueueConfig::from_env()
        .map_err(|e| anyhow::anyhow!(e))?
        .with_name(&queue_name);
    if std::env::var("CRAWLQ_QUEUE_PREFETCH").is_err() {
        queue_config = queue_config.with_prefetch(workers);
    }
    let queue = db.message_queue(queue_config);
    queue
        .declare_queue(&queue_name)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    let registry = Arc::new(build_registry()?);
    let handler = ResultHandler::new(db.record_store(), queue.clone(), &queue_name);

    let mut config = WorkerConfig::default().with_workers(workers);
    if let Some(secs) = plan_timeout {
        config = config.with_plan_timeout(Duration::from_secs(secs));
    }
    let pool = WorkerPool::new(registry, handler, config);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let inbound = queue
        .consume(&queue_name, cancel.clone())
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    tracing::info!(
        queue = %queue_name,
        workers,
        consumer = %queue.consumer_id(),
        "Consuming tasks"
    );

    pool.run(inbound, cancel, Arc::new(TracingWorkerReporter))
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    queue.join_pollers().await;
    match queue.release_unacked().await {
        Ok(0) => {}
        Ok(released) => tracing::info!(released, "Returned unprocessed messages to the queue"),
        Err(e) => tracing::warn!(error = %e, "Failed to release unprocessed messages"),
    }

    tracing::info!("Worker pool stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    tracing::info!("Shutdown signal received, finishing in-flight tasks");
    cancel.cancel();
}

async fn cmd_seed(
    url: &str,
    plan: Option<String>,
    max_depth: u32,
    options: Vec<(String, serde_json::Value)>,
    queue_name: &str,
) -> Result<()> {
    let registry = build_registry()?;
    let plan = match plan {
        Some(name) => {
            registry.get(&name).map_err(|e| anyhow::anyhow!(e))?;
            name
        }
        None => registry
            .find_for_url(url)
            .map(|p| p.name().to_string())
            .with_context(|| format!("No plan matches {url}; pass --plan"))?,
    };

    let task = options
        .into_iter()
        .fold(Task::new(url, &plan, max_depth), |task, (k, v)| {
            task.with_option(k, v)
        });
    let body = task.to_message().map_err(|e| anyhow::anyhow!(e))?;

    let db = connect_db().await?;
    let queue = db.message_queue(QueueConfig::default().with_name(queue_name));
    queue
        .declare_queue(queue_name)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    queue
        .publish(queue_name, &body, true)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    tracing::info!(%url, %plan, max_depth, queue = %queue_name, "Seeded task");
    Ok(())
}

async fn cmd_records(
    filter: Option<&str>,
    limit: u64,
    offset: u64,
    sort: Vec<(String, SortOrder)>,
) -> Result<()> {
    let filter = match filter {
        Some(raw) => {
            let value: serde_json::Value =
                serde_json::from_str(raw).context("Invalid JSON in --filter")?;
            Filter::from_json(&value).map_err(|e| anyhow::anyhow!(e))?
        }
        None => Filter::new(),
    };

    let options = sort.into_iter().fold(
        FindOptions::default().with_limit(limit).with_offset(offset),
        |options, (field, order)| options.sort_by(field, order),
    );

    let db = connect_db().await?;
    let store = db.record_store();
    let total = store.count(&filter).await.map_err(|e| anyhow::anyhow!(e))?;
    let records = store
        .find(&filter, &options)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    tracing::info!(shown = records.len(), total, "Records");
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

fn cmd_plans() -> Result<()> {
    let registry = build_registry()?;
    let mut names = registry.list();
    names.sort();
    for name in names {
        println!("{name}");
    }
    Ok(())
}

fn parse_option(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn parse_sort(raw: &str) -> Result<(String, SortOrder), String> {
    let (field, order) = raw.split_once(':').unwrap_or((raw, "asc"));
    let order = match order.to_ascii_lowercase().as_str() {
        "asc" => SortOrder::Asc,
        "desc" => SortOrder::Desc,
        other => return Err(format!("sort order must be asc or desc, got '{other}'")),
    };
    if field.is_empty() {
        return Err("sort field is empty".to_string());
    }
    Ok((field.to_string(), order))
}
