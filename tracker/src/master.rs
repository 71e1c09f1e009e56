//! Master poller: periodic discovery of game servers from master directories.
//!
//! Each cycle resolves the configured master hostnames, sends one streaming
//! `getservers` query per resolved address and protocol version, and feeds
//! every decoded endpoint through the directory's get-or-create. New entries
//! get a poll task; known ones are a no-op.

use crate::changelog::ChangeLog;
use crate::directory::{Directory, ServerKey};
use crate::gameserver;
use crate::geo::GeoClient;
use crate::scheduler::UdpScheduler;
use log::{debug, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use wire::master::{self, Endpoint};
use wire::Family;

/// Idle timeout for master response bursts.
pub const STREAM_IDLE: Duration = Duration::from_millis(1000);

/// A configured master directory, resolved anew each cycle.
#[derive(Debug, Clone)]
pub struct MasterEndpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub masters: Vec<MasterEndpoint>,
    pub game: String,
    pub protocols: Vec<String>,
    pub interval: Duration,
    pub enable_ipv6: bool,
}

pub struct MasterPoller {
    config: MasterConfig,
    scheduler: UdpScheduler,
    directory: Arc<RwLock<Directory>>,
    log: Arc<RwLock<ChangeLog>>,
    geo: Arc<GeoClient>,
}

impl MasterPoller {
    pub fn new(
        config: MasterConfig,
        scheduler: UdpScheduler,
        directory: Arc<RwLock<Directory>>,
        log: Arc<RwLock<ChangeLog>>,
        geo: Arc<GeoClient>,
    ) -> Self {
        Self {
            config,
            scheduler,
            directory,
            log,
            geo,
        }
    }

    /// Runs discovery cycles forever; the first cycle starts immediately.
    pub async fn run(self) {
        let mut tick = interval(self.config.interval);
        loop {
            tick.tick().await;
            self.cycle().await;
        }
    }

    /// One discovery cycle across all configured masters.
    pub async fn cycle(&self) {
        for endpoint in &self.config.masters {
            let addrs = resolve(endpoint).await;
            if addrs.is_empty() {
                continue;
            }
            for addr in addrs {
                let family = match addr.ip() {
                    IpAddr::V4(_) => Family::V4,
                    IpAddr::V6(_) => Family::V6,
                };
                if family == Family::V6 && !self.config.enable_ipv6 {
                    continue;
                }
                for protocol in &self.config.protocols {
                    self.query_master(addr, family, protocol).await;
                }
            }
        }
    }

    /// Streams one master query and registers every decoded endpoint.
    async fn query_master(&self, addr: SocketAddr, family: Family, protocol: &str) {
        let payload = master::request(family, &self.config.game, protocol);
        let include_v6 = self.config.enable_ipv6;

        let (tx, mut rx) = mpsc::unbounded_channel::<Endpoint>();
        let scheduler = self.scheduler.clone();
        let ip = addr.ip().to_string();
        let port = addr.port();
        let stream = tokio::spawn(async move {
            scheduler
                .stream_request(family, &ip, port, &payload, STREAM_IDLE, |datagram| {
                    let (endpoints, done) = master::decode_response(family, datagram, include_v6);
                    for endpoint in endpoints {
                        if tx.send(endpoint).is_err() {
                            return false;
                        }
                    }
                    !done
                })
                .await;
        });

        let mut found = 0usize;
        while let Some(endpoint) = rx.recv().await {
            found += 1;
            self.register(endpoint).await;
        }
        if let Err(e) = stream.await {
            warn!("master query task failed: {}", e);
        }
        debug!(
            "master {} protocol {} reported {} server(s)",
            addr, protocol, found
        );
    }

    /// Directory get-or-create; a newly created entry gets its poll task.
    async fn register(&self, endpoint: Endpoint) {
        let key = ServerKey {
            family: endpoint.family,
            ip: endpoint.ip,
            port: endpoint.port,
        };
        let (id, created) = self.directory.write().await.get_or_create(&key);
        if created {
            gameserver::spawn(
                self.scheduler.clone(),
                Arc::clone(&self.directory),
                Arc::clone(&self.log),
                Arc::clone(&self.geo),
                id,
                key,
            );
        }
    }
}

/// Resolves one master hostname to socket addresses. Failure degrades to an
/// empty list so one dead master never aborts the cycle.
async fn resolve(endpoint: &MasterEndpoint) -> Vec<SocketAddr> {
    match lookup_host((endpoint.host.as_str(), endpoint.port)).await {
        Ok(addrs) => {
            let addrs: Vec<SocketAddr> = addrs.collect();
            info!("master {} resolved to {} address(es)", endpoint.host, addrs.len());
            addrs
        }
        Err(e) => {
            warn!("failed to resolve master {}: {}", endpoint.host, e);
            Vec::new()
        }
    }
}
