use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kwatch_core::{build_catalog, Catalog, EventSink, VersionPreferences};
use kwatch_kubehub::{EventHandler, WatchDriver};
use kwatch_persist::{LogSink, SqliteSink};
use metrics::gauge;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "kwatch", version, about = "Watch every resource type in a cluster and record each change")]
struct Cli {
    /// Log filter (tracing EnvFilter syntax)
    #[arg(long = "log", env = "KWATCH_LOG", global = true, default_value = "info")]
    log: String,

    /// Log line format
    #[arg(long = "log-format", env = "KWATCH_LOG_FORMAT", value_enum, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Serve Prometheus metrics on host:port
    #[arg(long = "metrics-addr", env = "KWATCH_METRICS_ADDR", global = true)]
    metrics_addr: Option<SocketAddr>,

    /// Use the in-cluster service account config instead of kubeconfig
    #[arg(long = "in-cluster", env = "KWATCH_IN_CLUSTER", global = true, action = ArgAction::SetTrue)]
    in_cluster: bool,

    /// Extra deprecated=preferred group/version pair, e.g. batch/v1beta1=batch/v1
    #[arg(long = "prefer-version", global = true, value_parser = parse_preference)]
    prefer_version: Vec<(String, String)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum LogFormat { Text, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum SinkKind { Log, Sqlite }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch every watchable resource type and record changes until interrupted
    Run(RunArgs),
    /// Print the watch catalog built from server discovery, then exit
    Discover {
        #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Human)]
        output: Output,
    },
    /// Show the most recent events stored by the sqlite sink
    History {
        #[arg(long = "database-url", env = "DATABASE_URL")]
        database_url: String,
        #[arg(long = "limit", default_value_t = 20)]
        limit: usize,
        #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Human)]
        output: Output,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Where events go
    #[arg(long = "sink", env = "KWATCH_SINK", value_enum, default_value_t = SinkKind::Log)]
    sink: SinkKind,

    /// SQLite database path or sqlite:// URL (required for --sink sqlite)
    #[arg(long = "database-url", env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Number of pooled sqlite connections
    #[arg(long = "db-pool-size", env = "KWATCH_DB_POOL_SIZE", default_value_t = 4)]
    db_pool_size: usize,
}

fn parse_preference(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((deprecated, preferred)) if !deprecated.is_empty() && !preferred.is_empty() => {
            Ok((deprecated.to_string(), preferred.to_string()))
        }
        _ => Err(format!("expected DEPRECATED=PREFERRED, got {:?}", s)),
    }
}

/// Logs go to `writer`; stdout stays reserved for command output such as `-o json`.
fn subscriber<W>(level: &str, format: LogFormat, writer: W) -> Box<dyn tracing::Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = tracing_subscriber::EnvFilter::from_str(level).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(writer);
    match format {
        LogFormat::Text => Box::new(builder.finish()),
        LogFormat::Json => Box::new(builder.json().finish()),
    }
}

fn init_tracing(level: &str, format: LogFormat) {
    subscriber(level, format, std::io::stderr).init();
}

fn init_metrics(addr: Option<SocketAddr>) {
    if let Some(sock) = addr {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(_) => info!(addr = %sock, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        }
    }
}

fn preferences(pairs: &[(String, String)]) -> VersionPreferences {
    pairs
        .iter()
        .fold(VersionPreferences::new(), |prefs, (deprecated, preferred)| prefs.with_override(deprecated, preferred))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log, cli.log_format);
    init_metrics(cli.metrics_addr);

    if let Err(e) = dispatch(cli).await {
        error!(error = ?e, "fatal");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let prefs = preferences(&cli.prefer_version);
    match cli.command {
        Commands::Run(args) => run(cli.in_cluster, &prefs, args).await,
        Commands::Discover { output } => {
            let catalog = load_catalog(cli.in_cluster, &prefs).await?.1;
            print_catalog(&catalog, output)
        }
        Commands::History { database_url, limit, output } => {
            let store = SqliteSink::open(&database_url, 1)?;
            let rows = store.recent(limit)?;
            match output {
                Output::Human => {
                    println!("{:<8} {:<8} {:<40} {:<50} AGE", "ID", "TYPE", "RESOURCE", "NAMESPACE/NAME");
                    for r in rows {
                        let resource = if r.resource_group.is_empty() {
                            r.resource_type.clone()
                        } else {
                            format!("{}.{}", r.resource_type, r.resource_group)
                        };
                        let key = if r.namespace.is_empty() { r.resource_name.clone() } else { format!("{}/{}", r.namespace, r.resource_name) };
                        println!("{:<8} {:<8} {:<40} {:<50} {}", r.id, r.event_type, resource, key, render_age(r.observed_at));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
            Ok(())
        }
    }
}

async fn load_catalog(in_cluster: bool, prefs: &VersionPreferences) -> Result<(kube::Client, Catalog)> {
    let client = kwatch_kubehub::connect(in_cluster).await?;
    let entries = kwatch_kubehub::discover(&client).await.context("discovering server resources")?;
    let catalog = build_catalog(&entries, prefs);
    let s = catalog.stats();
    info!(
        targets = catalog.len(),
        deprecated = s.deprecated_entries,
        malformed = s.malformed_entries,
        empty = s.empty_entries,
        subresources = s.subresources,
        unwatchable = s.unwatchable,
        duplicates = s.duplicates,
        "catalog built"
    );
    Ok((client, catalog))
}

fn print_catalog(catalog: &Catalog, output: Output) -> Result<()> {
    let targets = catalog.sorted();
    match output {
        Output::Human => {
            for t in targets {
                let scope = if t.namespaced { "namespaced" } else { "cluster" };
                println!("{} • {} • {} • {}", t.gvr.api_version(), t.gvr.resource, t.kind, scope);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&targets)?),
    }
    Ok(())
}

fn open_sink(args: &RunArgs) -> Result<Arc<dyn EventSink>> {
    let sink: Arc<dyn EventSink> = match args.sink {
        SinkKind::Log => Arc::new(LogSink),
        SinkKind::Sqlite => {
            let url = args
                .database_url
                .as_deref()
                .context("--database-url (or DATABASE_URL) is required with --sink sqlite")?;
            Arc::new(SqliteSink::open(url, args.db_pool_size).context("unable to open event database")?)
        }
    };
    Ok(sink)
}

async fn run(in_cluster: bool, prefs: &VersionPreferences, args: RunArgs) -> Result<()> {
    let (client, catalog) = load_catalog(in_cluster, prefs).await?;
    let sink = open_sink(&args)?;
    info!(sink = sink.name(), "event sink ready");

    let watched = catalog.len();
    gauge!("k8s_watched_resources_total", watched as f64);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let mut driver = WatchDriver::new(client);
    for target in catalog {
        info!(gvr = %target.gvr, "setting up watcher");
        let handler = EventHandler::new(target.identity(), Arc::clone(&sink));
        driver.register(target, handler);
    }
    driver.start(&cancel);

    if driver.wait_for_cache_sync(&cancel).await {
        info!(count = watched, "actively watching {} resource types", watched);
        cancel.cancelled().await;
    }

    info!("shutting down watches");
    driver.join().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received"),
        _ = terminate => info!("SIGTERM received"),
    }
}

fn render_age(ts: i64) -> String {
    if ts <= 0 { return "-".to_string(); }
    let now = kwatch_persist::now_ts();
    let mut secs = (now - ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
