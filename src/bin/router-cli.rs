use std::path::PathBuf;

use clap::{Parser, Subcommand};
use duplex_router::admin::handlers::SystemStatus;
use duplex_router::config::{load_config, AdminConfig};
use duplex_router::registry::WorkerRecord;
use reqwest::header::AUTHORIZATION;
use serde::de::DeserializeOwned;

#[derive(Parser)]
#[command(name = "router-cli")]
#[command(about = "Inspect a running duplex router through its admin API", long_about = None)]
struct Cli {
    /// Router base URL. Defaults to the listener in --config, or localhost:8080.
    #[arg(short, long)]
    url: Option<String>,

    /// Admin API key. Defaults to the key in --config.
    #[arg(short, long)]
    key: Option<String>,

    /// Router config file to take the URL and key from.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show router health and capacity totals
    Status,
    /// List worker records
    Workers,
}

/// Authenticated client for the `/admin` routes.
struct AdminClient {
    http: reqwest::Client,
    base: String,
    key: String,
}

impl AdminClient {
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Box<dyn std::error::Error>> {
        let res = self
            .http
            .get(format!("{}/admin/{}", self.base, path))
            .header(AUTHORIZATION, format!("Bearer {}", self.key))
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(format!("admin API returned {status}: {body}").into());
        }
        Ok(res.json().await?)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let (config_url, config_key) = match &cli.config {
        Some(path) => {
            let config = load_config(path)?;
            (Some(base_url(&config.listener.bind_address)), Some(config.admin.api_key))
        }
        None => (None, None),
    };

    let client = AdminClient {
        http: reqwest::Client::new(),
        base: cli
            .url
            .or(config_url)
            .unwrap_or_else(|| "http://localhost:8080".to_string())
            .trim_end_matches('/')
            .to_string(),
        key: cli
            .key
            .or(config_key)
            .unwrap_or_else(|| AdminConfig::default().api_key),
    };

    match cli.command {
        Commands::Status => {
            let status: SystemStatus = client.get("status").await?;
            print!("{}", render_status(&status));
        }
        Commands::Workers => {
            let workers: Vec<WorkerRecord> = client.get("workers").await?;
            print!("{}", render_workers(&workers));
        }
    }

    Ok(())
}

/// URL for a listener bind address, mapping wildcard hosts to localhost.
fn base_url(bind_address: &str) -> String {
    match bind_address.rsplit_once(':') {
        Some(("0.0.0.0" | "[::]", port)) => format!("http://localhost:{port}"),
        Some((host, port)) => format!("http://{host}:{port}"),
        None => format!("http://localhost:{bind_address}"),
    }
}

fn render_status(status: &SystemStatus) -> String {
    format!(
        "router {} ({})\n\
         workers:      {} ({} ready)\n\
         connections:  {} active, {} per worker max\n\
         sessions:     {}\n",
        status.version,
        status.status,
        status.workers,
        status.ready_workers,
        status.active_connections,
        status.max_connections_per_worker,
        status.live_sessions,
    )
}

fn render_workers(workers: &[WorkerRecord]) -> String {
    if workers.is_empty() {
        return "no workers\n".to_string();
    }
    let width = workers.iter().map(|w| w.id.len()).max().unwrap_or(0).max(2);
    let mut out = format!("{:<width$}  {:>6}  STATUS\n", "ID", "ACTIVE");
    let mut sorted: Vec<_> = workers.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    for w in sorted {
        out.push_str(&format!("{:<width$}  {:>6}  {}\n", w.id, w.active_connections, w.status));
    }
    out
}
