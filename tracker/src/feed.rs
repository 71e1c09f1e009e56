//! Change feed delivery to connected consumers.
//!
//! The transport (WebSocket layer, compression, framing) lives outside this
//! crate; it hands the feed an outbound channel sender per consumer and
//! forwards inbound control messages here. Once a consumer reports READY it
//! receives an INIT envelope with a full directory snapshot, its cursor is
//! registered at the log head, and a delivery task starts shipping UPDATE
//! envelopes on the consumer's own interval.

use crate::changelog::ChangeLog;
use crate::directory::Directory;
use crate::utils::now_millis;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;

pub const DEFAULT_INTERVAL_MS: u64 = 1000;
pub const MIN_INTERVAL_MS: u64 = 1000;
pub const MAX_INTERVAL_MS: u64 = 100_000;

/// Clamps a consumer-requested delivery interval into the allowed range.
pub fn clamp_interval(ms: u64) -> u64 {
    ms.clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS)
}

/// The opaque message handed to the transport for delivery.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub time: i64,
}

impl Envelope {
    fn new(kind: &str, payload: Value, offset: i64) -> Self {
        Self {
            kind: kind.to_string(),
            payload,
            time: now_millis() + offset,
        }
    }
}

/// Control messages a consumer may send. Anything that fails to parse into
/// one of these is logged and ignored; the connection stays open.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Begin delivery; carries the consumer's clock for offset calculation.
    #[serde(rename = "READY")]
    Ready {
        #[serde(default)]
        time: Option<i64>,
    },
    /// Change the delivery interval (clamped).
    #[serde(rename = "SET_INTERVAL")]
    SetInterval { payload: IntervalPayload },
    /// Transport-level compression hint; no core state changes.
    #[serde(rename = "ACCEPT_COMPRESSED")]
    AcceptCompressed,
}

#[derive(Debug, Deserialize)]
pub struct IntervalPayload {
    pub interval: u64,
}

struct Consumer {
    tx: mpsc::UnboundedSender<Envelope>,
    interval_ms: Arc<AtomicU64>,
    ready: bool,
    time_offset: i64,
    delivery: Option<JoinHandle<()>>,
}

/// Registry of connected consumers and their delivery tasks.
pub struct Feed {
    directory: Arc<RwLock<Directory>>,
    log: Arc<RwLock<ChangeLog>>,
    consumers: HashMap<u64, Consumer>,
    next_id: u64,
}

impl Feed {
    pub fn new(directory: Arc<RwLock<Directory>>, log: Arc<RwLock<ChangeLog>>) -> Self {
        Self {
            directory,
            log,
            consumers: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Registers a new connection. The consumer does not count toward log
    /// retention until it becomes ready.
    pub fn connect(&mut self, tx: mpsc::UnboundedSender<Envelope>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.consumers.insert(
            id,
            Consumer {
                tx,
                interval_ms: Arc::new(AtomicU64::new(DEFAULT_INTERVAL_MS)),
                ready: false,
                time_offset: 0,
                delivery: None,
            },
        );
        info!("consumer {} connected | {} connected", id, self.consumers.len());
        id
    }

    /// Tears a consumer down: the delivery task stops and the cursor leaves
    /// the retention set immediately.
    pub async fn disconnect(&mut self, id: u64) {
        if let Some(consumer) = self.consumers.remove(&id) {
            if let Some(task) = consumer.delivery {
                task.abort();
            }
            self.log.write().await.unregister_consumer(id);
            info!("consumer {} disconnected | {} connected", id, self.consumers.len());
        }
    }

    /// Interprets one inbound message from a consumer.
    pub async fn handle_message(&mut self, id: u64, msg: &Value) {
        if !self.consumers.contains_key(&id) {
            return;
        }
        match serde_json::from_value::<ControlMessage>(msg.clone()) {
            Err(_) => warn!("malformed message from consumer {}", id),
            Ok(ControlMessage::Ready { time }) => self.mark_ready(id, time).await,
            Ok(ControlMessage::SetInterval { payload }) => {
                let clamped = clamp_interval(payload.interval);
                if let Some(consumer) = self.consumers.get(&id) {
                    consumer.interval_ms.store(clamped, Ordering::Relaxed);
                    info!("consumer {} set interval of {}", id, clamped);
                }
            }
            Ok(ControlMessage::AcceptCompressed) => {
                debug!("consumer {} accepts compressed payloads", id);
            }
        }
    }

    async fn mark_ready(&mut self, id: u64, client_time: Option<i64>) {
        // A duplicate READY must leave the registered cursor alone: the
        // delivery task is still draining toward it.
        match self.consumers.get(&id) {
            None => return,
            Some(consumer) if consumer.ready => return,
            Some(_) => {}
        }

        // Register the cursor at the head before snapshotting so nothing can
        // slip between the snapshot and the first incremental read.
        let head = {
            let mut log = self.log.write().await;
            let head = log.head();
            log.register_consumer(id, head);
            head
        };
        let (servers, players) = self.directory.read().await.snapshot();

        let Some(consumer) = self.consumers.get_mut(&id) else {
            return;
        };
        consumer.ready = true;

        let now = now_millis();
        consumer.time_offset = now - client_time.unwrap_or(now);
        info!("consumer {} is ready", id);

        let init = Envelope::new(
            "INIT",
            json!({ "servers": servers, "players": players }),
            consumer.time_offset,
        );
        let _ = consumer.tx.send(init);

        consumer.delivery = Some(tokio::spawn(deliver(
            id,
            consumer.tx.clone(),
            Arc::clone(&consumer.interval_ms),
            Arc::clone(&self.log),
            consumer.time_offset,
            head,
        )));
    }
}

/// Per-consumer delivery loop: read past the cursor, ship what is new,
/// advance the registered cursor. Ends when the transport side goes away;
/// the transport is expected to call `disconnect` for full cleanup.
async fn deliver(
    id: u64,
    tx: mpsc::UnboundedSender<Envelope>,
    interval_ms: Arc<AtomicU64>,
    log: Arc<RwLock<ChangeLog>>,
    time_offset: i64,
    mut cursor: u64,
) {
    loop {
        sleep(Duration::from_millis(interval_ms.load(Ordering::Relaxed))).await;

        let batch = {
            let mut log = log.write().await;
            let (events, new_cursor) = log.read_from(cursor);
            if events.is_empty() {
                None
            } else {
                cursor = new_cursor;
                log.advance(id, cursor);
                Some(events)
            }
        };

        if let Some(events) = batch {
            let payload = serde_json::to_value(&events).unwrap_or(Value::Null);
            let update = Envelope::new("UPDATE", payload, time_offset);
            if tx.send(update).is_err() {
                // transport gone without a disconnect; the cursor must not
                // keep pinning the log
                debug!("consumer {} channel closed, dropping cursor", id);
                log.write().await.unregister_consumer(id);
                return;
            }
        }
    }
}
