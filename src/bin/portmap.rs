use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dcc_portmap::nat::upnp::WAN_IP_CONNECTION_V2;
use dcc_portmap::{
    init_logging, GatewayEndpoint, LeaseConfig, LeaseManager, MappingEvent, MappingRequest,
    Protocol,
};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(author, version, about = "UPnP IGD port mapping client", long_about = None)]
struct Args {
    /// Control URL of the gateway's WAN connection service
    #[arg(short, long)]
    control_url: String,

    /// Service type of the WAN connection service
    #[arg(short, long, default_value = WAN_IP_CONNECTION_V2)]
    service_type: String,

    /// JSON file with lease manager settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Local address announced to the gateway (detected when omitted)
    #[arg(long)]
    internal_client: Option<Ipv4Addr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Map an internal port and print the external one
    Map {
        /// Internal port to expose
        #[arg(short, long)]
        port: u16,

        /// TCP or UDP
        #[arg(long, default_value = "TCP")]
        protocol: Protocol,

        /// Preferred external port (gateway chooses when omitted)
        #[arg(short, long)]
        external: Option<u16>,

        /// Lease duration in seconds (0 = indefinite)
        #[arg(short, long, default_value_t = 3600)]
        lease: u32,

        /// Fail rather than accept a different external port
        #[arg(long)]
        fixed: bool,

        /// Keep renewing until Ctrl-C, then release
        #[arg(long)]
        hold: bool,
    },

    /// Delete a mapping left behind by an earlier run
    Release {
        /// External port of the mapping
        #[arg(short, long)]
        external: u16,

        /// TCP or UDP
        #[arg(long, default_value = "TCP")]
        protocol: Protocol,
    },

    /// Print the gateway's external IPv4 address
    ExternalIp,

    /// List the gateway's mapping table
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<LeaseConfig>(&raw)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => LeaseConfig::default(),
    };
    if args.internal_client.is_some() {
        config.internal_client = args.internal_client;
    }

    let endpoint = GatewayEndpoint::from_control_url(&args.control_url, &args.service_type)?;
    let manager = LeaseManager::new(endpoint, config).context("creating lease manager")?;

    match args.command {
        Command::Map {
            port,
            protocol,
            external,
            lease,
            fixed,
            hold,
        } => {
            let mut request = MappingRequest::new(port, protocol, lease);
            if let Some(external) = external {
                request = request.with_external_port(external);
            }
            if fixed {
                request = request.fixed_port_only();
            }

            let mut events = manager.subscribe();
            let mapping = manager.request_mapping(request).await?;
            println!(
                "{} {} -> {}:{} (lease {}s)",
                mapping.protocol,
                mapping.external_port,
                manager.internal_client(),
                mapping.internal_port,
                mapping.lease_duration
            );

            if hold {
                let held = hold_mapping(&manager, &mut events).await;
                // Expired entries still get their best-effort delete
                manager.shutdown().await;
                held?;
            }
        }
        Command::Release { external, protocol } => {
            manager.remove_stale_mapping(protocol, external).await?;
            println!("Deleted {} {}", protocol, external);
        }
        Command::ExternalIp => {
            println!("{}", manager.external_address().await?);
        }
        Command::List => {
            let entries = manager.list_gateway_mappings().await?;
            if entries.is_empty() {
                println!("No mappings");
            }
            for entry in entries {
                println!(
                    "{:<4} {:>5} -> {}:{:<5} lease {:>6}s {} {}",
                    entry.protocol,
                    entry.external_port,
                    entry.internal_client,
                    entry.internal_port,
                    entry.lease_duration,
                    if entry.enabled { "enabled " } else { "disabled" },
                    entry.description
                );
            }
        }
    }

    Ok(())
}

async fn hold_mapping(
    manager: &LeaseManager,
    events: &mut tokio::sync::broadcast::Receiver<MappingEvent>,
) -> Result<()> {
    println!("Holding mapping, press Ctrl-C to release");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for Ctrl-C")?;
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(MappingEvent::Renewed(mapping)) => {
                    tracing::info!("Lease on port {} renewed", mapping.external_port);
                }
                Ok(MappingEvent::Expired { error, .. }) => {
                    return Err(anyhow::Error::new(error).context("renewal gave up"));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Skipped {} events", skipped);
                }
                Err(RecvError::Closed) => {
                    tracing::debug!("Event channel closed for {:?}", manager);
                    return Ok(());
                }
            },
        }
    }
}
