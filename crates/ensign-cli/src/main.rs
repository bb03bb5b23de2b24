//! # ensign
//!
//! Command line interface of the Ensign node.
//!
//! - `ensign serve` runs a node until interrupted.
//! - `ensign config` prints the configuration variables and their effective values.
//! - `ensign status` probes a running node and prints its service state as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ensign::config::{Config, VARIABLES};
use ensign::{o11y, Server};
use ensign_api::v1beta1::ensign_client::EnsignClient;
use ensign_api::v1beta1::{HealthCheck, ServiceState};
use tabled::{Table, Tabled};
use tonic::transport::{ClientTlsConfig, Endpoint};

const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Ensign: an event broker for publish/subscribe streams and EnSQL queries.
#[derive(Parser)]
#[command(name = "ensign", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the Ensign node.
    Serve {
        /// Configuration file (.toml, .yaml or .json); the environment is merged on top.
        #[arg(short = 'c', long)]
        conf_file: Option<PathBuf>,

        /// Address the gRPC server listens on, overriding the configuration.
        #[arg(short, long)]
        bindaddr: Option<String>,
    },

    /// Print the configuration variables and their effective values.
    Config {
        /// Print one variable per line instead of a table.
        #[arg(short, long)]
        list: bool,

        /// Configuration file to resolve effective values from.
        #[arg(short = 'c', long)]
        conf_file: Option<PathBuf>,
    },

    /// Probe the status of a running node.
    Status {
        /// Endpoint of the node to probe.
        #[arg(short, long, default_value = "localhost:5356")]
        endpoint: String,

        /// Connect without TLS.
        #[arg(short = 'S', long)]
        no_secure: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve { conf_file, bindaddr } => serve(conf_file, bindaddr).await,
        Commands::Config { list, conf_file } => config(list, conf_file),
        Commands::Status { endpoint, no_secure } => status(&endpoint, no_secure).await,
    };

    if let Err(err) = result {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn load_config(conf_file: Option<PathBuf>) -> anyhow::Result<Config> {
    match conf_file {
        Some(path) => Config::load(&path).with_context(|| format!("could not load {}", path.display())),
        None => Config::from_env().context("could not load configuration from the environment"),
    }
}

async fn serve(conf_file: Option<PathBuf>, bindaddr: Option<String>) -> anyhow::Result<()> {
    let mut conf = load_config(conf_file)?;
    if let Some(addr) = bindaddr {
        conf.bind_addr = addr;
        conf.mark().context("invalid bind address")?;
    }

    o11y::init_tracing(&conf);
    let server = Arc::new(Server::new(conf).context("could not create ensign server")?);

    let mut running = {
        let server = server.clone();
        tokio::spawn(async move { server.serve().await })
    };

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("could not listen for shutdown signal")?;
            tracing::info!("received interrupt, shutting down");
            server.shutdown().await.context("could not shut down ensign server")?;
            running.await.context("server task failed")??;
        }
        result = &mut running => {
            // The server stopped on its own; make sure the node is stopped too.
            server.shutdown().await.context("could not shut down ensign server")?;
            result.context("server task failed")??;
        }
    }
    Ok(())
}

#[derive(Tabled)]
struct VariableRow {
    #[tabled(rename = "Variable")]
    name: String,
    #[tabled(rename = "Type")]
    kind: String,
    #[tabled(rename = "Default")]
    default: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Description")]
    desc: String,
}

fn config(list: bool, conf_file: Option<PathBuf>) -> anyhow::Result<()> {
    let conf = match conf_file {
        Some(path) => load_config(Some(path))?,
        // Values are shown even when the environment alone does not validate.
        None => {
            let mut conf = Config::default();
            conf.apply_env(|name| std::env::var(name).ok())?;
            conf
        }
    };

    let rows: Vec<VariableRow> = VARIABLES
        .iter()
        .map(|var| VariableRow {
            name: var.env_name(),
            kind: var.kind.to_string(),
            default: var.default.to_string(),
            value: conf.value_of(var),
            desc: var.desc.to_string(),
        })
        .collect();

    if list {
        for row in rows {
            println!("{}={} ({}) {}", row.name, row.value, row.kind, row.desc);
        }
    } else {
        println!("{}", Table::new(rows));
    }
    Ok(())
}

async fn status(endpoint: &str, no_secure: bool) -> anyhow::Result<()> {
    let url = match (endpoint.contains("://"), no_secure) {
        (true, _) => endpoint.to_string(),
        (false, true) => format!("http://{endpoint}"),
        (false, false) => format!("https://{endpoint}"),
    };
    if no_secure && url.starts_with("https://") {
        bail!("cannot use --no-secure with an https endpoint");
    }

    let mut channel = Endpoint::from_shared(url.clone())
        .with_context(|| format!("invalid endpoint {url:?}"))?
        .connect_timeout(STATUS_TIMEOUT)
        .timeout(STATUS_TIMEOUT);
    if !no_secure {
        channel = channel
            .tls_config(ClientTlsConfig::new().with_webpki_roots())
            .context("could not configure tls")?;
    }

    let channel = channel
        .connect()
        .await
        .with_context(|| format!("could not connect to {url}"))?;
    let mut client = EnsignClient::new(channel);
    let state = client
        .status(HealthCheck::default())
        .await
        .context("could not get node status")?
        .into_inner();

    println!("{}", serde_json::to_string_pretty(&render(&state))?);
    Ok(())
}

fn render(state: &ServiceState) -> serde_json::Value {
    let timestamp = |ts: &Option<prost_types::Timestamp>| {
        ts.as_ref()
            .and_then(ensign_api::to_datetime)
            .map(|dt| dt.to_rfc3339())
    };
    let uptime = state
        .uptime
        .as_ref()
        .map(|d| format!("{}s", d.seconds));

    serde_json::json!({
        "status": state.status().as_str_name(),
        "version": state.version,
        "uptime": uptime,
        "not_before": timestamp(&state.not_before),
        "not_after": timestamp(&state.not_after),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use ensign_api::v1beta1::service_state;

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();

        let cli = Cli::parse_from(["ensign", "status", "--endpoint", "localhost:7777", "--no-secure"]);
        assert!(matches!(
            cli.command,
            Commands::Status { ref endpoint, no_secure: true } if endpoint == "localhost:7777"
        ));

        let cli = Cli::parse_from(["ensign", "serve", "--bindaddr", ":9000"]);
        assert!(matches!(cli.command, Commands::Serve { bindaddr: Some(_), conf_file: None }));
    }

    #[test]
    fn test_render() {
        let state = ServiceState {
            status: service_state::Status::Maintenance as i32,
            version: "0.1.0".into(),
            uptime: Some(prost_types::Duration { seconds: 42, nanos: 0 }),
            not_before: Some(ensign_api::now()),
            not_after: None,
        };

        let out = render(&state);
        assert_eq!(out["status"], "MAINTENANCE");
        assert_eq!(out["uptime"], "42s");
        assert!(out["not_before"].is_string());
        assert!(out["not_after"].is_null());
    }
}
