use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use keel_api::{serve, ApiConfig};
use keel_client::Client;
use keel_core::{Configuration, DeleteOptions, Selector, WatchEvent};
use keel_persist::SqliteStore;
use keel_store::{KvStore, MemStore};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel Configuration registry")]
struct Cli {
    /// API server base URL
    #[arg(long = "server", env = "KEEL_SERVER", global = true, default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum StoreKind { Mem, Sqlite }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the Configuration API over HTTP
    Serve {
        #[arg(long = "listen", env = "KEEL_LISTEN", default_value = "127.0.0.1:8080")]
        listen: String,
        #[arg(long = "store", env = "KEEL_STORE", value_enum, default_value_t = StoreKind::Mem)]
        store: StoreKind,
        /// SQLite file (default ~/.keel/keel.db)
        #[arg(long = "db-path", env = "KEEL_DB_PATH")]
        db_path: Option<String>,
        /// Deadline for non-watch requests
        #[arg(long = "request-timeout-secs", env = "KEEL_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
        request_timeout_secs: u64,
    },
    /// Show one Configuration
    Get { name: String },
    /// List Configurations
    Ls {
        #[arg(short = 'l', long = "selector", default_value = "")]
        selector: String,
        #[arg(long = "field-selector", default_value = "")]
        field_selector: String,
    },
    /// Create a Configuration from a JSON or YAML file ("-" reads stdin)
    Create {
        #[arg(short = 'f', long = "filename")]
        file: String,
    },
    /// Update a Configuration from a JSON or YAML file ("-" reads stdin)
    Update {
        #[arg(short = 'f', long = "filename")]
        file: String,
    },
    /// Delete a Configuration
    Delete {
        name: String,
        /// Only delete if the stored resourceVersion still matches
        #[arg(long = "resource-version")]
        resource_version: Option<String>,
    },
    /// Stream changes as they happen
    Watch {
        #[arg(short = 'l', long = "selector", default_value = "")]
        selector: String,
        #[arg(long = "field-selector", default_value = "")]
        field_selector: String,
        /// Resume after this resourceVersion (default: now)
        #[arg(long = "resource-version", default_value = "")]
        resource_version: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let client = Client::new(cli.server.clone());
    let cfgs = client.configurations();

    match cli.command {
        Commands::Serve { listen, store: kind, db_path, request_timeout_secs } => {
            init_metrics();
            let t0 = Instant::now();
            let store: Arc<dyn KvStore> = match kind {
                StoreKind::Mem => Arc::new(MemStore::new()),
                StoreKind::Sqlite => Arc::new(match db_path.as_deref() {
                    Some(p) => SqliteStore::open(p)?,
                    None => SqliteStore::open_default()?,
                }),
            };
            let config = ApiConfig { request_timeout: Duration::from_secs(request_timeout_secs), ..ApiConfig::from_env() };
            let shutdown = config.shutdown.clone();
            let listener = TcpListener::bind(&listen).await.with_context(|| format!("binding {}", listen))?;
            info!(listen = %listen, store = ?kind, db_path = ?db_path, took_ms = %t0.elapsed().as_millis(), "serve: ready");
            serve(listener, keel_api::app(store, config), async move {
                let _ = signal::ctrl_c().await;
                info!("serve: shutdown requested");
                shutdown.cancel();
            })
            .await?;
        }
        Commands::Get { name } => {
            let cfg = cfgs.get(&name).await?;
            match cli.output {
                Output::Human => print_table(std::slice::from_ref(&cfg)),
                Output::Json => println!("{}", serde_json::to_string_pretty(&cfg)?),
            }
        }
        Commands::Ls { selector, field_selector } => {
            let list = cfgs.list(&Selector::parse(&selector)?, &Selector::parse(&field_selector)?).await?;
            match cli.output {
                Output::Human => print_table(&list.items),
                Output::Json => println!("{}", serde_json::to_string_pretty(&list)?),
            }
        }
        Commands::Create { file } => {
            let cfg = cfgs.create(&read_object(&file)?).await?;
            print_result("created", &cfg, cli.output)?;
        }
        Commands::Update { file } => {
            let cfg = cfgs.update(&read_object(&file)?).await?;
            print_result("updated", &cfg, cli.output)?;
        }
        Commands::Delete { name, resource_version } => {
            let cfg = cfgs.delete_with(&name, &DeleteOptions { resource_version }).await?;
            print_result("deleted", &cfg, cli.output)?;
        }
        Commands::Watch { selector, field_selector, resource_version } => {
            let mut w = cfgs.watch(&Selector::parse(&selector)?, &Selector::parse(&field_selector)?, &resource_version).await?;
            loop {
                let item = tokio::select! {
                    _ = signal::ctrl_c() => break,
                    item = w.recv() => item,
                };
                let Some(item) = item else { break };
                let ev = item?;
                match cli.output {
                    Output::Human => println!("{}", render_event(&ev)),
                    Output::Json => println!("{}", serde_json::to_string(&ev)?),
                }
            }
        }
    }

    Ok(())
}

/// JSON or YAML; YAML is a superset so one parser covers both.
fn read_object(path: &str) -> Result<Configuration> {
    let text = if path == "-" {
        std::io::read_to_string(std::io::stdin())?
    } else {
        std::fs::read_to_string(Path::new(path)).with_context(|| format!("reading {}", path))?
    };
    parse_object(&text).with_context(|| format!("parsing {}", path))
}

fn parse_object(text: &str) -> Result<Configuration> {
    Ok(serde_yaml::from_str(text)?)
}

fn print_result(verb: &str, cfg: &Configuration, output: Output) -> Result<()> {
    match output {
        Output::Human => println!("configuration/{} {} (rv {})", cfg.metadata.name, verb, cfg.metadata.resource_version),
        Output::Json => println!("{}", serde_json::to_string_pretty(cfg)?),
    }
    Ok(())
}

fn print_table(items: &[Configuration]) {
    let width = items.iter().map(|c| c.metadata.name.len()).max().unwrap_or(0).max(4);
    println!("{:<width$}  {:<16}  {:>5}  {:>6}  AGE", "NAME", "TYPE", "FLAGS", "RV", width = width);
    for c in items {
        println!(
            "{:<width$}  {:<16}  {:>5}  {:>6}  {}",
            c.metadata.name,
            c.type_,
            c.flags.len(),
            c.metadata.resource_version,
            render_age(c.metadata.creation_timestamp.as_deref(), chrono::Utc::now()),
            width = width
        );
    }
}

fn render_event(ev: &WatchEvent<Configuration>) -> String {
    match ev.object() {
        Some(c) => format!("{:<8} {} type={} rv={}", ev.type_str(), c.metadata.name, c.type_, c.metadata.resource_version),
        None => ev.type_str().to_string(),
    }
}

fn render_age(created: Option<&str>, now: chrono::DateTime<chrono::Utc>) -> String {
    let Some(ts) = created.and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok()) else {
        return "-".to_string();
    };
    let mut secs = (now.timestamp() - ts.timestamp()).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
