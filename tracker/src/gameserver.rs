//! Per-server polling state machine.
//!
//! Each discovered server gets one task that walks the
//! Probing -> Active -> Dead lifecycle: query status, reconcile the response
//! through the directory, append the resulting events, and reschedule itself
//! at an adaptive interval. Five consecutive failed attempts retire the
//! server; retirement of an active server emits the delete events before the
//! entry disappears.

use crate::changelog::ChangeLog;
use crate::directory::{Directory, ServerId, ServerKey};
use crate::geo::GeoClient;
use crate::scheduler::{UdpScheduler, REQUEST_TIMEOUT};
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use wire::status::{self, POLL_INTERVAL_KEY};
use wire::InfoValue;

/// Consecutive failed attempts before a server is retired.
pub const ATTEMPT_MAX: u32 = 5;
/// Delay between failed attempts.
pub const ATTEMPT_DELAY: Duration = Duration::from_millis(1000);

/// Poll interval for an empty server.
pub const INTERVAL_EMPTY_MS: u64 = 10_000;
/// Poll interval when every reported player has zero ping (all bots).
pub const INTERVAL_NOPING_MS: u64 = 5_000;
/// Poll interval for a populated server.
pub const INTERVAL_POPULATED_MS: u64 = 1_000;

/// Picks the next poll delay from the roster shape. A valid server-supplied
/// override may only lengthen the cadence, never shorten it.
pub fn next_poll_delay(player_count: usize, total_ping: i64, override_ms: Option<i64>) -> Duration {
    let mut ms = if player_count > 0 && total_ping > 0 {
        INTERVAL_POPULATED_MS
    } else if player_count > 0 {
        INTERVAL_NOPING_MS
    } else {
        INTERVAL_EMPTY_MS
    };
    if let Some(value) = override_ms {
        if value > ms as i64 {
            ms = value as u64;
        }
    }
    Duration::from_millis(ms)
}

/// Spawns the poll task for a freshly discovered server.
pub fn spawn(
    scheduler: UdpScheduler,
    directory: Arc<RwLock<Directory>>,
    log: Arc<RwLock<ChangeLog>>,
    geo: Arc<GeoClient>,
    id: ServerId,
    key: ServerKey,
) {
    tokio::spawn(run(scheduler, directory, log, geo, id, key));
}

async fn run(
    scheduler: UdpScheduler,
    directory: Arc<RwLock<Directory>>,
    log: Arc<RwLock<ChangeLog>>,
    geo: Arc<GeoClient>,
    id: ServerId,
    key: ServerKey,
) {
    let request = status::request();
    let mut failures = 0u32;

    loop {
        let response = scheduler
            .request(key.family, &key.ip, key.port, &request, REQUEST_TIMEOUT)
            .await;
        // An unparseable response counts the same as no response.
        let decoded = response.as_deref().and_then(status::decode_response);

        let Some(status) = decoded else {
            failures += 1;
            if failures >= ATTEMPT_MAX {
                let events = directory.write().await.retire(id);
                if !events.is_empty() {
                    let mut log = log.write().await;
                    for (kind, payload) in events {
                        log.append(kind, payload);
                    }
                }
                return;
            }
            sleep(ATTEMPT_DELAY).await;
            continue;
        };
        failures = 0;

        let first_response = {
            let dir = directory.read().await;
            dir.server(id).map(|e| !e.active).unwrap_or(false)
        };
        if first_response {
            resolve_region(&geo, &directory, id, key.ip.clone());
        }

        let player_count = status.players.len();
        let total_ping: i64 = status.players.iter().map(|p| p.ping).sum();
        let override_ms = status
            .info
            .get(POLL_INTERVAL_KEY)
            .and_then(InfoValue::as_int);

        let events = directory.write().await.apply_status(id, &status);
        if !events.is_empty() {
            let mut log = log.write().await;
            for (kind, payload) in events {
                log.append(kind, payload);
            }
        }

        sleep(next_poll_delay(player_count, total_ping, override_ms)).await;
    }
}

/// Kicks off the region lookup off the poll path; the result lands in the
/// directory whenever it arrives and shows up in the next snapshot diff.
fn resolve_region(
    geo: &Arc<GeoClient>,
    directory: &Arc<RwLock<Directory>>,
    id: ServerId,
    ip: String,
) {
    let geo = Arc::clone(geo);
    let directory = Arc::clone(directory);
    tokio::spawn(async move {
        match geo.lookup(&ip).await {
            Some((country, region)) => {
                directory.write().await.set_region(id, country, region);
            }
            None => debug!("no region for {}", ip),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_server_polls_slowly() {
        assert_eq!(
            next_poll_delay(0, 0, None),
            Duration::from_millis(INTERVAL_EMPTY_MS)
        );
    }

    #[test]
    fn all_bot_roster_polls_at_medium_rate() {
        // players present but total ping zero
        assert_eq!(
            next_poll_delay(3, 0, None),
            Duration::from_millis(INTERVAL_NOPING_MS)
        );
    }

    #[test]
    fn populated_server_polls_fast() {
        assert_eq!(
            next_poll_delay(2, 80, None),
            Duration::from_millis(INTERVAL_POPULATED_MS)
        );
    }

    #[test]
    fn override_may_only_lengthen() {
        assert_eq!(
            next_poll_delay(2, 80, Some(30_000)),
            Duration::from_millis(30_000)
        );
        assert_eq!(
            next_poll_delay(2, 80, Some(500)),
            Duration::from_millis(INTERVAL_POPULATED_MS)
        );
        assert_eq!(
            next_poll_delay(0, 0, Some(-1)),
            Duration::from_millis(INTERVAL_EMPTY_MS)
        );
    }
}
