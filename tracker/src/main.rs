use clap::Parser;
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracker::changelog::ChangeLog;
use tracker::directory::Directory;
use tracker::geo::GeoClient;
use tracker::master::{MasterConfig, MasterEndpoint, MasterPoller};
use tracker::scheduler::UdpScheduler;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Master directories to query, as host:port
    #[clap(
        short,
        long,
        default_values = &["master1.forbidden.gg:27950", "master1.icy.gg:27950"]
    )]
    masters: Vec<String>,
    /// Game name sent in master queries
    #[clap(short, long, default_value = "Warfork")]
    game: String,
    /// Protocol versions to query, one master request each
    #[clap(short, long, default_values = &["22"])]
    protocols: Vec<String>,
    /// Seconds between master discovery cycles
    #[clap(long, default_value = "60")]
    master_interval: u64,
    /// Also query IPv6 masters and track IPv6 servers
    #[clap(long)]
    ipv6: bool,
    /// Disable region lookups over HTTP
    #[clap(long)]
    no_geo: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut masters = Vec::new();
    for spec in &args.masters {
        match parse_master(spec) {
            Some(endpoint) => masters.push(endpoint),
            None => warn!("skipping malformed master {:?}", spec),
        }
    }
    if masters.is_empty() {
        return Err("no usable master directories configured".into());
    }

    let config = MasterConfig {
        masters,
        game: args.game,
        protocols: args.protocols,
        interval: Duration::from_secs(args.master_interval),
        enable_ipv6: args.ipv6,
    };

    let scheduler = UdpScheduler::new();
    let directory = Arc::new(RwLock::new(Directory::new()));
    let log = Arc::new(RwLock::new(ChangeLog::new()));
    let geo = Arc::new(if args.no_geo {
        GeoClient::disabled()
    } else {
        GeoClient::new()
    });

    let poller = MasterPoller::new(
        config,
        scheduler,
        Arc::clone(&directory),
        Arc::clone(&log),
        geo,
    );
    let poller_handle = tokio::spawn(poller.run());

    // Periodic one-line status for the operator log.
    let stats_handle = {
        let directory = Arc::clone(&directory);
        let log = Arc::clone(&log);
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(60));
            tick.tick().await;
            loop {
                tick.tick().await;
                let (servers, players) = {
                    let dir = directory.read().await;
                    let (servers, players) = dir.snapshot();
                    (servers.len(), players.len())
                };
                let pending = log.read().await.len();
                info!(
                    "{} active server(s), {} player(s), {} pending event(s)",
                    servers, players, pending
                );
            }
        })
    };

    tokio::select! {
        result = poller_handle => {
            if let Err(e) = result {
                eprintln!("Master poller task panicked: {}", e);
            }
        }
        result = stats_handle => {
            if let Err(e) = result {
                eprintln!("Stats task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}

/// Parses a host:port master spec; the port defaults to 27950 when omitted.
fn parse_master(spec: &str) -> Option<MasterEndpoint> {
    match spec.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Some(MasterEndpoint {
            host: host.to_string(),
            port: port.parse().ok()?,
        }),
        None if !spec.is_empty() => Some(MasterEndpoint {
            host: spec.to_string(),
            port: 27950,
        }),
        _ => None,
    }
}
