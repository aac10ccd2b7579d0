use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use kadnet::{Contact, Content, GetParameter, Kad, KadConfig, KadId};

/// A known peer to join through, written as `IP:PORT/IDHEX`.
#[derive(Clone, Debug)]
struct BootstrapPeer {
    address: Ipv4Addr,
    port: u16,
    id: KadId,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, id_part) = s
            .rsplit_once('/')
            .context("bootstrap peer must include an id (format: IP:PORT/IDHEX)")?;
        let (ip_part, port_part) = addr_part
            .rsplit_once(':')
            .context("bootstrap peer must include a port (format: IP:PORT/IDHEX)")?;

        let address: Ipv4Addr = ip_part.parse().context("invalid IPv4 address")?;
        let port: u16 = port_part.parse().context("invalid port")?;
        let id = KadId::from_hex(id_part).context("id must be 40 hex characters")?;

        Ok(BootstrapPeer { address, port, id })
    }
}

#[derive(Parser, Debug)]
#[command(name = "kadnet")]
#[command(author, version, about = "Kademlia DHT node", long_about = None)]
struct Args {
    /// Name under which this node's state is saved and restored
    owner: String,

    /// Node id as a string (padded/truncated to 20 bytes); random when omitted
    #[arg(long)]
    id: Option<String>,

    /// Address to bind and advertise
    #[arg(long, default_value = "127.0.0.1")]
    ip: Ipv4Addr,

    /// UDP port; 0 picks an ephemeral one
    #[arg(long, default_value = "0")]
    port: u16,

    /// Known peer to join through, IP:PORT/IDHEX
    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Option<BootstrapPeer>,

    /// Restore this owner's node from its snapshot instead of starting fresh
    #[arg(long)]
    load: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = KadConfig::default();

    let node = if args.load {
        Kad::load_from_file(&args.owner, config).await?
    } else {
        let id = match &args.id {
            Some(text) => KadId::from_text(text),
            None => KadId::random(),
        };
        Kad::new(&args.owner, id, args.ip, args.port, config).await?
    };
    info!(id = %node.local_contact().id, port = node.port(), "node is up");

    if let Some(peer) = &args.bootstrap {
        node.connect(Contact::new(peer.id, peer.address, peer.port))
            .await
            .context("bootstrap failed")?;
        info!("joined the network");
    }

    println!("commands: put <key> <value> | get <key> | refresh | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !run_command(&node, line.trim()).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    node.shutdown().await?;
    Ok(())
}

/// Execute one console command; returns false when the driver should exit.
async fn run_command(node: &Kad, line: &str) -> bool {
    let mut parts = line.splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(""), ..) => {}

        (Some("put"), Some(key), Some(value)) => {
            let content = Content::new(KadId::from_text(key), value.as_bytes().to_vec())
                .with_owner(node.owner());
            match node.put(content).await {
                Ok(stored) => println!("stored on {stored} node(s)"),
                Err(e) => warn!(error = %e, "put failed"),
            }
        }

        (Some("get"), Some(key), None) => {
            match node.get(GetParameter::new(KadId::from_text(key)), 1).await {
                Ok(found) => {
                    for content in found {
                        println!("{}", String::from_utf8_lossy(&content.value));
                    }
                }
                Err(e) => warn!(error = %e, "get failed"),
            }
        }

        (Some("refresh"), None, None) => match node.refresh().await {
            Ok(()) => println!("refreshed"),
            Err(e) => warn!(error = %e, "refresh failed"),
        },

        (Some("quit"), None, None) | (Some("exit"), None, None) => return false,

        _ => println!("commands: put <key> <value> | get <key> | refresh | quit"),
    }
    true
}
