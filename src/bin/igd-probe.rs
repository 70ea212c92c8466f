use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use portgate::nat::upnp::bind_discovery_socket;
use portgate::{init_logging, GatewayStatus, IgdConfig, IgdGateway, PortProtocol};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProtocolArg {
    Udp,
    Tcp,
}

impl From<ProtocolArg> for PortProtocol {
    fn from(value: ProtocolArg) -> Self {
        match value {
            ProtocolArg::Udp => PortProtocol::Udp,
            ProtocolArg::Tcp => PortProtocol::Tcp,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Discover the UPnP gateway and manage port mappings", long_about = None)]
struct Args {
    /// Local bind address for the SSDP search
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Create a mapping for this external port
    #[arg(long)]
    forward: Option<u16>,

    /// Internal port for --forward (defaults to the external port)
    #[arg(long, default_value_t = 0)]
    internal_port: u16,

    /// Transport protocol of the mapping
    #[arg(long, value_enum, default_value_t = ProtocolArg::Udp)]
    protocol: ProtocolArg,

    /// Mapping description shown by the router
    #[arg(long, default_value = "portgate")]
    description: String,

    /// Remove the mapping for this external port
    #[arg(long)]
    delete: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = match &args.config {
        Some(path) => IgdConfig::from_json_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => IgdConfig::default(),
    };

    let socket = bind_discovery_socket(args.bind).await?;
    let gateway = IgdGateway::with_udp(config, socket.clone())?;

    println!("Searching for UPnP gateway...");
    let status = gateway.run_discovery(&socket).await?;
    println!("Status: {:?}", status);

    if status != GatewayStatus::Available {
        bail!("No UPnP gateway found");
    }

    if let Some(selected) = gateway.selected_gateway() {
        println!("Gateway: {}", selected);
    }
    match gateway.get_external_ip().await {
        Some(ip) => println!("External IP: {}", ip),
        None => println!("External IP: unknown"),
    }

    let protocol = PortProtocol::from(args.protocol);

    if let Some(port) = args.forward {
        if gateway.forward_port_with(port, &args.description, args.internal_port, protocol).await {
            println!("Forwarded {} {}", protocol, port);
        } else {
            bail!("Failed to forward {} {}", protocol, port);
        }
    }

    if let Some(port) = args.delete {
        if gateway.delete_forwarding_rule_with(port, protocol).await {
            println!("Removed {} {}", protocol, port);
        } else {
            bail!("Failed to remove {} {}", protocol, port);
        }
    }

    Ok(())
}
