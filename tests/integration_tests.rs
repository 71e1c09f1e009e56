//! Integration tests for the discovery and polling pipeline.
//!
//! These tests validate cross-component interactions and real network
//! behavior against fake master and game servers on loopback sockets.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracker::changelog::{ChangeKind, ChangeLog};
use tracker::directory::Directory;
use tracker::geo::GeoClient;
use tracker::master::{MasterConfig, MasterEndpoint, MasterPoller};
use tracker::scheduler::UdpScheduler;
use wire::Family;

/// A loopback master that answers one `getservers` query with the given
/// endpoints and an EOT marker. Returns its port.
async fn fake_master(endpoints: Vec<([u8; 4], u16)>) -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();

    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
        assert!(buf[..len].starts_with(b"\xFF\xFF\xFF\xFFgetservers "));

        let mut response = wire::master::response_header(Family::V4);
        for (ip, entry_port) in &endpoints {
            response.push(b'\\');
            response.extend_from_slice(ip);
            response.extend_from_slice(&entry_port.to_be_bytes());
        }
        response.push(b'\\');
        response.extend_from_slice(wire::EOT_MARKER);
        socket.send_to(&response, peer).await.unwrap();
    });

    port
}

/// A loopback game server answering every `getstatus` with a fixed response
/// body. Returns its port.
async fn fake_game_server(body: &'static str) -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();

    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            assert_eq!(&buf[..len], b"\xFF\xFF\xFF\xFFgetstatus");

            let mut response = wire::status::response_header();
            response.extend_from_slice(body.as_bytes());
            if socket.send_to(&response, peer).await.is_err() {
                return;
            }
        }
    });

    port
}

/// WIRE EXCHANGE TESTS
mod wire_exchange_tests {
    use super::*;
    use wire::master::Endpoint;

    /// Streams a master query against a loopback master and decodes the
    /// endpoint list out of the burst.
    #[tokio::test]
    async fn master_query_roundtrip() {
        let port = fake_master(vec![([1, 2, 3, 4], 27960), ([10, 0, 0, 1], 44400)]).await;
        let scheduler = UdpScheduler::new();
        let request = wire::master::request(Family::V4, "Warfork", "22");

        let mut endpoints: Vec<Endpoint> = Vec::new();
        scheduler
            .stream_request(
                Family::V4,
                "127.0.0.1",
                port,
                &request,
                Duration::from_millis(500),
                |datagram| {
                    let (decoded, done) =
                        wire::master::decode_response(Family::V4, datagram, false);
                    endpoints.extend(decoded);
                    !done
                },
            )
            .await;

        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].ip, "1.2.3.4");
        assert_eq!(endpoints[0].port, 27960);
        assert_eq!(endpoints[1].ip, "10.0.0.1");
        assert_eq!(endpoints[1].port, 44400);
    }

    /// Queries a loopback game server and decodes the status response.
    #[tokio::test]
    async fn status_query_roundtrip() {
        let port =
            fake_game_server("sv_maxclients\\16\\mapname\\wdm1\n5 40 \"alice\" 1\n").await;
        let scheduler = UdpScheduler::new();

        let response = scheduler
            .request(
                Family::V4,
                "127.0.0.1",
                port,
                &wire::status::request(),
                Duration::from_millis(500),
            )
            .await
            .expect("status response");
        let status = wire::status::decode_response(&response).expect("decodable response");

        assert_eq!(
            status.info.get("sv_maxclients"),
            Some(&wire::InfoValue::Int(16))
        );
        assert_eq!(status.players.len(), 1);
        assert_eq!(status.players[0].name, "alice");
    }

    /// Concurrent requests stay within the scheduler's admission limit and
    /// all complete.
    #[tokio::test]
    async fn scheduler_handles_a_burst_of_requests() {
        let port = fake_game_server("sv_maxclients\\4\n").await;
        let scheduler = UdpScheduler::new();

        let mut handles = Vec::new();
        for _ in 0..25 {
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move {
                scheduler
                    .request(
                        Family::V4,
                        "127.0.0.1",
                        port,
                        &wire::status::request(),
                        Duration::from_millis(500),
                    )
                    .await
            }));
        }

        for handle in handles {
            let response = handle.await.unwrap();
            assert!(response.is_some());
        }
    }
}

/// END-TO-END DISCOVERY TESTS
mod discovery_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracker::directory::ServerKey;
    use tracker::gameserver;

    /// One full pipeline pass: the poller learns an endpoint from a fake
    /// master, the spawned poll task queries the fake game server, and the
    /// reconciled state lands in the directory and the change log.
    #[tokio::test]
    async fn discovery_to_change_log() {
        let game_port =
            fake_game_server("sv_maxclients\\8\\mapname\\wdm1\n7 35 \"alice\" 1\n").await;
        let master_port = fake_master(vec![([127, 0, 0, 1], game_port)]).await;

        let directory = Arc::new(RwLock::new(Directory::new()));
        let log = Arc::new(RwLock::new(ChangeLog::new()));
        // a registered cursor keeps events around for the assertions
        log.write().await.register_consumer(1, 0);

        let poller = MasterPoller::new(
            MasterConfig {
                masters: vec![MasterEndpoint {
                    host: "127.0.0.1".to_string(),
                    port: master_port,
                }],
                game: "Warfork".to_string(),
                protocols: vec!["22".to_string()],
                interval: Duration::from_secs(60),
                enable_ipv6: false,
            },
            UdpScheduler::new(),
            Arc::clone(&directory),
            Arc::clone(&log),
            Arc::new(GeoClient::disabled()),
        );
        poller.cycle().await;

        // wait for the poll task to finish its first exchange
        let mut events = Vec::new();
        for _ in 0..100 {
            sleep(Duration::from_millis(20)).await;
            let (read, _) = log.read().await.read_from(0);
            if read.len() >= 2 {
                events = read;
                break;
            }
        }

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ChangeKind::ServerAdd);
        assert_eq!(events[0].payload["ip"], "127.0.0.1");
        assert_eq!(events[0].payload["port"], game_port);
        assert_eq!(events[0].payload["mapname"], "wdm1");
        assert_eq!(events[1].kind, ChangeKind::PlayerAdd);
        assert_eq!(events[1].payload["name"], "alice");

        let dir = directory.read().await;
        assert_eq!(dir.len(), 1);
        let (servers, players) = dir.snapshot();
        assert_eq!(servers.len(), 1);
        assert_eq!(players.len(), 1);
    }

    /// Re-running a cycle against the same master must not create duplicate
    /// directory entries.
    #[tokio::test]
    async fn rediscovery_is_idempotent() {
        let game_port = fake_game_server("sv_maxclients\\8\n").await;
        let master_port_a = fake_master(vec![([127, 0, 0, 1], game_port)]).await;
        let master_port_b = fake_master(vec![([127, 0, 0, 1], game_port)]).await;

        let directory = Arc::new(RwLock::new(Directory::new()));
        let log = Arc::new(RwLock::new(ChangeLog::new()));

        let config = MasterConfig {
            masters: vec![
                MasterEndpoint {
                    host: "127.0.0.1".to_string(),
                    port: master_port_a,
                },
                MasterEndpoint {
                    host: "127.0.0.1".to_string(),
                    port: master_port_b,
                },
            ],
            game: "Warfork".to_string(),
            protocols: vec!["22".to_string()],
            interval: Duration::from_secs(60),
            enable_ipv6: false,
        };
        let poller = MasterPoller::new(
            config,
            UdpScheduler::new(),
            Arc::clone(&directory),
            log,
            Arc::new(GeoClient::disabled()),
        );
        poller.cycle().await;

        assert_eq!(directory.read().await.len(), 1);
    }

    /// A game server that answers its first and fourth status queries and
    /// ignores everything else. The two early misses must be forgotten after
    /// the intervening success, so retirement lands only after five
    /// consecutive misses: nine requests in total, then the delete events.
    #[tokio::test]
    async fn failure_budget_retires_only_after_five_consecutive_misses() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let requests = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&requests);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let Ok((_, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 1 || n == 4 {
                    let mut response = wire::status::response_header();
                    response.extend_from_slice(b"mapname\\wdm1\n3 40 \"alice\" 1\n");
                    if socket.send_to(&response, peer).await.is_err() {
                        return;
                    }
                }
            }
        });

        let directory = Arc::new(RwLock::new(Directory::new()));
        let log = Arc::new(RwLock::new(ChangeLog::new()));
        log.write().await.register_consumer(1, 0);

        let key = ServerKey {
            family: Family::V4,
            ip: "127.0.0.1".to_string(),
            port,
        };
        let (id, created) = directory.write().await.get_or_create(&key);
        assert!(created);
        gameserver::spawn(
            UdpScheduler::new(),
            Arc::clone(&directory),
            Arc::clone(&log),
            Arc::new(GeoClient::disabled()),
            id,
            key,
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while !directory.read().await.is_empty() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "server was never retired"
            );
            sleep(Duration::from_millis(200)).await;
        }

        // 1 success, 2 misses, 1 success resetting the budget, 5 misses
        assert_eq!(requests.load(Ordering::SeqCst), 9);

        let (events, _) = log.read().await.read_from(0);
        let kinds: Vec<ChangeKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ChangeKind::ServerAdd,
                ChangeKind::PlayerAdd,
                ChangeKind::PlayerDelete,
                ChangeKind::ServerDelete,
            ]
        );
    }

    /// A master that never answers leaves the pipeline untouched.
    #[tokio::test]
    async fn silent_master_discovers_nothing() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let master_port = silent.local_addr().unwrap().port();

        let directory = Arc::new(RwLock::new(Directory::new()));
        let log = Arc::new(RwLock::new(ChangeLog::new()));

        let poller = MasterPoller::new(
            MasterConfig {
                masters: vec![MasterEndpoint {
                    host: "127.0.0.1".to_string(),
                    port: master_port,
                }],
                game: "Warfork".to_string(),
                protocols: vec!["22".to_string()],
                interval: Duration::from_secs(60),
                enable_ipv6: false,
            },
            UdpScheduler::new(),
            Arc::clone(&directory),
            log,
            Arc::new(GeoClient::disabled()),
        );
        poller.cycle().await;

        assert!(directory.read().await.is_empty());
    }
}
