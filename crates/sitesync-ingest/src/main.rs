//! sitesync daemon.
//!
//! Watches relays for changes to deployed sites and keeps their published
//! output current.
//!
//! # Usage
//!
//! ```bash
//! # Register a deployed domain
//! sitesync domain add blog.example.com 30512:<owner-pubkey-hex>:blog
//!
//! # Run the watcher and the render scheduler in one process
//! sitesync run
//!
//! # Or run them separately against the same database
//! sitesync --db /data/sitesync.db watch --min-cycle 10
//! sitesync --db /data/sitesync.db render --render-command cli
//! ```
//!
//! # Graceful Shutdown
//!
//! SIGINT (Ctrl+C) and SIGTERM cancel both loops; each stops at its next
//! await point and closes its relay sessions.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use sitesync_core::SiteAddr;
use sitesync_core::metrics::{init_metrics, start_metrics_server};
use sitesync_ingest::router::OutboxConfig;
use sitesync_ingest::{
    CommandPublisher, DomainStatus, FetchConfig, NostrTransport, RenderScheduler, SchedulerConfig,
    Store, SystemClock, WatchConfig, Watcher,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Relay change watcher and render scheduler.
#[derive(Parser, Debug)]
#[command(name = "sitesync")]
#[command(about = "Keeps relay-published sites rendered and current")]
#[command(version)]
struct Cli {
    /// SQLite database path
    #[arg(long, env = "SITESYNC_DB", default_value = "./data/sitesync.db", global = true)]
    db: PathBuf,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9090", global = true)]
    metrics_port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the Change Watcher loop
    Watch(WatchArgs),
    /// Run the Render Scheduler loop
    Render(RenderArgs),
    /// Run both loops in one process
    Run {
        #[command(flatten)]
        watch: WatchArgs,
        #[command(flatten)]
        render: RenderArgs,
    },
    /// Inspect or seed domain records
    Domain {
        #[command(subcommand)]
        action: DomainCommand,
    },
}

#[derive(Args, Debug, Clone)]
struct WatchArgs {
    /// Relays carrying site configurations (comma-separated)
    #[arg(long, value_delimiter = ',')]
    registry_relays: Option<Vec<String>>,

    /// Relays queried for authors' relay lists (comma-separated)
    #[arg(long, value_delimiter = ',')]
    discovery_relays: Option<Vec<String>>,

    /// Relays used for authors without a relay list (comma-separated)
    #[arg(long, value_delimiter = ',')]
    fallback_relays: Option<Vec<String>>,

    /// Extra relay URL prefixes never to contact (comma-separated)
    #[arg(long, value_delimiter = ',')]
    blacklist: Vec<String>,

    /// Relays scanned concurrently
    #[arg(long, default_value = "100")]
    max_relays: usize,

    /// Authors per relay query
    #[arg(long, default_value = "100")]
    author_batch: usize,

    /// Events per page
    #[arg(long, default_value = "1000")]
    page_size: usize,

    /// Seconds allowed for one author batch on one relay
    #[arg(long, default_value = "20")]
    batch_deadline: u64,

    /// Relay connect timeout in seconds
    #[arg(long, default_value = "3")]
    connect_timeout: u64,

    /// Seconds allowed for a registry query
    #[arg(long, default_value = "30")]
    registry_wait: u64,

    /// Seconds subtracted from the cycle start when advancing watermarks
    #[arg(long, default_value = "60")]
    sync_buffer: u64,

    /// Minimum seconds between cycle starts
    #[arg(long, default_value = "10")]
    min_cycle: u64,
}

impl WatchArgs {
    fn config(&self) -> WatchConfig {
        let defaults = WatchConfig::default();
        let mut blacklist = defaults.blacklist;
        blacklist.extend(self.blacklist.iter().cloned());

        WatchConfig {
            registry_relays: self
                .registry_relays
                .clone()
                .unwrap_or(defaults.registry_relays),
            outbox: OutboxConfig {
                discovery_relays: self
                    .discovery_relays
                    .clone()
                    .unwrap_or(defaults.outbox.discovery_relays),
                fallback_relays: self
                    .fallback_relays
                    .clone()
                    .unwrap_or(defaults.outbox.fallback_relays),
                batch: self.author_batch,
                wait: Duration::from_secs(self.batch_deadline),
            },
            blacklist,
            fetch: FetchConfig {
                page_size: self.page_size,
                author_batch: self.author_batch,
                batch_deadline: Duration::from_secs(self.batch_deadline),
                max_concurrent_relays: self.max_relays,
                ..Default::default()
            },
            connect_timeout: Duration::from_secs(self.connect_timeout),
            registry_wait: Duration::from_secs(self.registry_wait),
            sync_buffer: Duration::from_secs(self.sync_buffer),
            min_cycle: Duration::from_secs(self.min_cycle),
        }
    }
}

#[derive(Args, Debug, Clone)]
struct RenderArgs {
    /// Program that renders and publishes a site
    #[arg(long, default_value = "cli")]
    render_command: String,

    /// Arguments placed before the site, domain and paths (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "release_website_zip")]
    render_args: Vec<String>,

    /// Relay hints embedded in the site naddr passed to the renderer (comma-separated)
    #[arg(long, value_delimiter = ',')]
    site_relays: Option<Vec<String>>,

    /// Seconds to sleep when idle or after a failed render
    #[arg(long, default_value = "3")]
    idle_interval: u64,
}

#[derive(Subcommand, Debug)]
enum DomainCommand {
    /// Insert or update a domain
    Add {
        domain: String,
        /// Site address, an naddr or a `kind:pubkey:identifier` coordinate
        site: String,
        #[arg(long, value_enum, default_value = "deployed")]
        status: StatusArg,
    },
    /// Print every domain with its watermarks
    List,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum StatusArg {
    Reserved,
    Deployed,
    Released,
}

impl From<StatusArg> for DomainStatus {
    fn from(status: StatusArg) -> Self {
        match status {
            StatusArg::Reserved => Self::Reserved,
            StatusArg::Deployed => Self::Deployed,
            StatusArg::Released => Self::Released,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("sitesync_ingest=debug".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let (watch, render) = match cli.command {
        Command::Domain { action } => return domain_command(&cli.db, action),
        Command::Watch(watch) => (Some(watch), None),
        Command::Render(render) => (None, Some(render)),
        Command::Run { watch, render } => (Some(watch), Some(render)),
    };

    tracing::info!("sitesync starting...");
    tracing::info!("  Database: {}", cli.db.display());

    if cli.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(cli.metrics_port, metrics_handle)
            .await
            .context("Failed to start metrics server")?;
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        signal.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let watcher = watch.map(|args| {
        let db = cli.db.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = run_watcher(&db, &args, shutdown.clone()).await;
            if result.is_err() {
                shutdown.cancel();
            }
            result
        })
    });
    let scheduler = render.map(|args| {
        let db = cli.db.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = run_scheduler(&db, &args, shutdown.clone()).await;
            if result.is_err() {
                shutdown.cancel();
            }
            result
        })
    });

    if let Some(task) = watcher {
        task.await.context("Watcher task panicked")??;
    }
    if let Some(task) = scheduler {
        task.await.context("Scheduler task panicked")??;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn open_store(db: &Path) -> Result<Arc<Store>> {
    let store =
        Store::open(db).with_context(|| format!("Failed to open store at {}", db.display()))?;
    Ok(Arc::new(store))
}

async fn run_watcher(db: &Path, args: &WatchArgs, shutdown: CancellationToken) -> Result<()> {
    let store = open_store(db)?;
    let config = args.config();

    tracing::info!("Change watcher configuration:");
    tracing::info!("  Registry relays: {:?}", config.registry_relays);
    tracing::info!("  Discovery relays: {:?}", config.outbox.discovery_relays);
    tracing::info!("  Max concurrent relays: {}", config.fetch.max_concurrent_relays);
    tracing::info!("  Batch deadline: {:?}", config.fetch.batch_deadline);

    // Queries outlive the batch deadline so an unfinished page is reported
    // as a deadline abort rather than a query error.
    let transport = Arc::new(NostrTransport::new(
        config.fetch.batch_deadline + Duration::from_secs(5),
    ));
    let mut watcher = Watcher::new(config, store, transport, Arc::new(SystemClock))
        .context("Failed to start change watcher")?;
    watcher.run(shutdown).await;
    Ok(())
}

async fn run_scheduler(db: &Path, args: &RenderArgs, shutdown: CancellationToken) -> Result<()> {
    let store = open_store(db)?;
    tracing::info!(
        "Render command: {} {}",
        args.render_command,
        args.render_args.join(" ")
    );

    let mut publisher = CommandPublisher::new(args.render_command.clone(), args.render_args.clone());
    if let Some(relays) = &args.site_relays {
        publisher = publisher.with_site_relays(relays.clone());
    }
    let publisher = Arc::new(publisher);
    let scheduler = RenderScheduler::new(
        store,
        publisher,
        Arc::new(SystemClock),
        SchedulerConfig {
            idle_interval: Duration::from_secs(args.idle_interval),
        },
    );
    scheduler.run(shutdown).await;
    Ok(())
}

fn domain_command(db: &Path, action: DomainCommand) -> Result<()> {
    let store = open_store(db)?;

    match action {
        DomainCommand::Add {
            domain,
            site,
            status,
        } => {
            let addr: SiteAddr = site
                .parse()
                .with_context(|| format!("Invalid site address '{}'", site))?;
            let status = DomainStatus::from(status);
            store
                .upsert_domain(&domain, &addr, status)
                .with_context(|| format!("Failed to save domain {}", domain))?;
            tracing::info!(domain = %domain, site = %addr, status = status.as_str(), "Domain saved");
        }
        DomainCommand::List => {
            for record in store.list_domains()? {
                println!(
                    "{}\t{}\t{}\trendered={}\tupdated={}\tfetched={}",
                    record.domain,
                    record.status.as_str(),
                    record.site,
                    record.rendered,
                    record.updated,
                    record.fetched
                );
            }
        }
    }
    Ok(())
}
