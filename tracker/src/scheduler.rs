//! UDP request scheduler: bounded-concurrency request/response exchanges and
//! a streaming mode for burst responses.
//!
//! Every exchange uses a transient socket that is dropped before the request
//! is considered complete, on success and timeout alike. Admission control
//! uses a fair semaphore, so queued requests are dispatched in arrival order
//! as capacity frees up; responses may still complete out of order.

use log::{debug, warn};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use wire::Family;

/// Maximum number of concurrently in-flight request/response exchanges.
pub const MAX_IN_FLIGHT: usize = 10;

/// Default time to wait for the first response datagram.
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);

const RECV_BUFFER: usize = 0xFFFF;

/// Shared handle to the scheduler; cheap to clone into tasks.
#[derive(Debug, Clone)]
pub struct UdpScheduler {
    permits: Arc<Semaphore>,
}

impl Default for UdpScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpScheduler {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(MAX_IN_FLIGHT)),
        }
    }

    /// Sends one datagram and waits for the first response, racing it against
    /// `wait`. Returns `None` on timeout, bind/send failure, or an
    /// unparseable peer address; all of those are transient for the caller.
    pub async fn request(
        &self,
        family: Family,
        ip: &str,
        port: u16,
        payload: &[u8],
        wait: Duration,
    ) -> Option<Vec<u8>> {
        // Fair semaphore: acquisition order is arrival order.
        let _permit = self.permits.acquire().await.ok()?;

        let socket = connect(family, ip, port).await?;
        if let Err(e) = socket.send(payload).await {
            warn!("udp send to {}:{} failed: {}", ip, port, e);
            return None;
        }

        let mut buf = vec![0u8; RECV_BUFFER];
        match timeout(wait, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                buf.truncate(len);
                Some(buf)
            }
            Ok(Err(e)) => {
                warn!("udp recv from {}:{} failed: {}", ip, port, e);
                None
            }
            Err(_) => {
                debug!("udp request to {}:{} timed out", ip, port);
                None
            }
        }
        // socket dropped here, before the permit is released
    }

    /// Sends one datagram and hands every response datagram to `handler`
    /// until it returns `false` or no datagram arrives within `idle`.
    ///
    /// Long-lived burst exchanges (master list queries) go through here and
    /// deliberately bypass the in-flight limit.
    pub async fn stream_request<F>(
        &self,
        family: Family,
        ip: &str,
        port: u16,
        payload: &[u8],
        idle: Duration,
        mut handler: F,
    ) where
        F: FnMut(&[u8]) -> bool,
    {
        let Some(socket) = connect(family, ip, port).await else {
            return;
        };
        if let Err(e) = socket.send(payload).await {
            warn!("udp send to {}:{} failed: {}", ip, port, e);
            return;
        }

        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            match timeout(idle, socket.recv(&mut buf)).await {
                Ok(Ok(len)) => {
                    if !handler(&buf[..len]) {
                        return;
                    }
                }
                Ok(Err(e)) => {
                    warn!("udp recv from {}:{} failed: {}", ip, port, e);
                    return;
                }
                Err(_) => {
                    debug!("stream from {}:{} went idle", ip, port);
                    return;
                }
            }
        }
    }
}

/// Binds an ephemeral socket of the right family and connects it to the peer,
/// so stray datagrams from other hosts are ignored.
async fn connect(family: Family, ip: &str, port: u16) -> Option<UdpSocket> {
    let addr: IpAddr = match ip.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("invalid address {:?}: {}", ip, e);
            return None;
        }
    };
    let bind = match family {
        Family::V4 => "0.0.0.0:0",
        Family::V6 => "[::]:0",
    };
    let socket = match UdpSocket::bind(bind).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("udp bind failed: {}", e);
            return None;
        }
    };
    if let Err(e) = socket.connect((addr, port)).await {
        warn!("udp connect to {}:{} failed: {}", ip, port, e);
        return None;
    }
    Some(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_times_out_without_a_responder() {
        let scheduler = UdpScheduler::new();
        // nothing listens on a fresh ephemeral port's peer; use a blackhole
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        // never read from `silent`

        let resp = scheduler
            .request(
                Family::V4,
                "127.0.0.1",
                port,
                b"ping",
                Duration::from_millis(50),
            )
            .await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn request_returns_first_datagram() {
        let scheduler = UdpScheduler::new();
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = echo.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, peer) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..len], peer).await.unwrap();
        });

        let resp = scheduler
            .request(
                Family::V4,
                "127.0.0.1",
                port,
                b"hello",
                Duration::from_millis(500),
            )
            .await;
        assert_eq!(resp.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn invalid_address_is_a_transient_failure() {
        let scheduler = UdpScheduler::new();
        let resp = scheduler
            .request(
                Family::V4,
                "not-an-ip",
                27960,
                b"x",
                Duration::from_millis(10),
            )
            .await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn stream_request_stops_when_handler_declines() {
        let scheduler = UdpScheduler::new();
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = responder.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, peer) = responder.recv_from(&mut buf).await.unwrap();
            responder.send_to(b"one", peer).await.unwrap();
            responder.send_to(b"two", peer).await.unwrap();
            responder.send_to(b"three", peer).await.unwrap();
        });

        let mut seen = Vec::new();
        scheduler
            .stream_request(
                Family::V4,
                "127.0.0.1",
                port,
                b"go",
                Duration::from_millis(500),
                |datagram| {
                    seen.push(datagram.to_vec());
                    seen.len() < 2
                },
            )
            .await;

        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn stream_request_ends_on_idle_timeout() {
        let scheduler = UdpScheduler::new();
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = responder.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, peer) = responder.recv_from(&mut buf).await.unwrap();
            responder.send_to(b"only", peer).await.unwrap();
            // then silence
        });

        let mut count = 0;
        scheduler
            .stream_request(
                Family::V4,
                "127.0.0.1",
                port,
                b"go",
                Duration::from_millis(50),
                |_| {
                    count += 1;
                    true
                },
            )
            .await;
        assert_eq!(count, 1);
    }
}
