//! Trunkline node entry point.
//!
//! Bootstraps a federation node from the command line:
//! `trunkline <udp-port> [<seed-ip> <seed-port>]` or
//! `trunkline <udp-port> <seed-file>` where the seed file holds one
//! `ip port` pair per line.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use trunkline::config::{parse_ivr_config, parse_sms_config};
use trunkline::federation::{FederationNode, NodeConfig};

#[derive(Debug, Parser)]
#[command(name = "trunkline", about = "Federated telephony middleware node")]
struct Cli {
    /// UDP port for the federation endpoint.
    udp_port: u16,

    /// Seed node IP address, or a file with one "ip port" pair per line.
    seed: Option<String>,

    /// Seed node UDP port (when the previous argument is an IP address).
    seed_port: Option<u16>,

    /// IVR gateway configuration file.
    #[arg(long, default_value = "etc/ivr.conf")]
    ivr_config: PathBuf,

    /// SMS gateway configuration file.
    #[arg(long, default_value = "etc/sms.conf")]
    sms_config: PathBuf,
}

fn parse_seeds(cli: &Cli) -> Result<Vec<SocketAddr>> {
    match (&cli.seed, cli.seed_port) {
        (None, _) => Ok(Vec::new()),
        (Some(ip), Some(port)) => {
            let addr = format!("{ip}:{port}")
                .parse()
                .with_context(|| format!("{ip}:{port} is not a valid seed address"))?;
            Ok(vec![addr])
        }
        (Some(file), None) => {
            let content = std::fs::read_to_string(file)
                .with_context(|| format!("cannot read seed file {file}"))?;
            let mut seeds = Vec::new();
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let (ip, port) = line
                    .split_once(' ')
                    .with_context(|| format!("seed line {line:?} is not \"ip port\""))?;
                seeds.push(
                    format!("{}:{}", ip.trim(), port.trim())
                        .parse()
                        .with_context(|| format!("seed line {line:?} is not a valid address"))?,
                );
            }
            Ok(seeds)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let seeds = parse_seeds(&cli)?;

    let ivr = load_optional(&cli.ivr_config, parse_ivr_config)?;
    let sms = load_optional(&cli.sms_config, parse_sms_config)?;

    let node = FederationNode::create(NodeConfig {
        udp_port: cli.udp_port,
        ivr,
        sms,
        rpc_timeout: None,
    })
    .await?;
    node.join(&seeds).await?;
    info!("node running on udp port {}", cli.udp_port);

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    node.shutdown().await;
    Ok(())
}

fn load_optional<T>(
    path: &Path,
    parse: impl Fn(&Path) -> Result<T, trunkline::config::ConfigError>,
) -> Result<Option<T>> {
    if !path.exists() {
        info!("no configuration file at {}; feature disabled", path.display());
        return Ok(None);
    }
    Ok(Some(parse(path)?))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("trunkline=info".parse().expect("valid directive")),
        )
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}
