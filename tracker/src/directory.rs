//! The server/player directory and its reconciliation logic.
//!
//! One `Directory` instance is owned by the pipeline orchestrator and shared
//! behind a lock; there is no process-wide state. It enforces the one-server-
//! per-`(family, ip, port)` invariant, assigns opaque ids, diffs status
//! snapshots against the previous ones, and reconciles player rosters,
//! returning the change events each mutation produced so the caller can
//! append them to the log.

use crate::changelog::ChangeKind;
use log::{debug, info};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use wire::status::StatusResponse;
use wire::{Family, InfoValue};

pub type ServerId = u64;
pub type PlayerId = u64;

/// Identity of a server on the network. At most one live directory entry
/// exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerKey {
    pub family: Family,
    pub ip: String,
    pub port: u16,
}

/// A player currently reported by one server. Identity is scoped by
/// `(server, name)`; the same name on two servers is two players.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerEntry {
    pub id: PlayerId,
    pub server: ServerId,
    pub name: String,
    pub score: i64,
    pub team: i64,
    pub ping: i64,
}

impl PlayerEntry {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "server": self.server,
            "name": self.name,
            "score": self.score,
            "team": self.team,
            "ping": self.ping,
        })
    }
}

/// One tracked server: identity plus the mutable state the poll loop and the
/// feed snapshot read.
#[derive(Debug)]
pub struct ServerEntry {
    pub id: ServerId,
    pub key: ServerKey,
    /// True once a status response has been seen.
    pub active: bool,
    pub country: String,
    pub region: String,
    /// Last published info snapshot; `None` until the first response.
    pub info: Option<BTreeMap<String, InfoValue>>,
    pub players: HashMap<String, PlayerEntry>,
}

/// The directory of all live servers and their players.
#[derive(Debug, Default)]
pub struct Directory {
    servers: HashMap<ServerId, ServerEntry>,
    by_key: HashMap<ServerKey, ServerId>,
    next_id: u64,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            servers: HashMap::new(),
            by_key: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn server(&self, id: ServerId) -> Option<&ServerEntry> {
        self.servers.get(&id)
    }

    /// Looks up a server by key, creating a fresh entry when unknown.
    /// Returns the id and whether the entry was created by this call.
    pub fn get_or_create(&mut self, key: &ServerKey) -> (ServerId, bool) {
        if let Some(id) = self.by_key.get(key) {
            return (*id, false);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.by_key.insert(key.clone(), id);
        self.servers.insert(
            id,
            ServerEntry {
                id,
                key: key.clone(),
                active: false,
                country: String::new(),
                region: String::new(),
                info: None,
                players: HashMap::new(),
            },
        );
        debug!("server {} tracked at {} {}:{}", id, key.family, key.ip, key.port);
        (id, true)
    }

    /// Stores the resolved geographic region for a server. A no-op once the
    /// server has been retired.
    pub fn set_region(&mut self, id: ServerId, country: String, region: String) {
        if let Some(entry) = self.servers.get_mut(&id) {
            debug!("server {} located in {} ({})", id, country, region);
            entry.country = country;
            entry.region = region;
        }
    }

    /// Applies one decoded status response: marks the server active, diffs
    /// the info snapshot, reconciles the player roster, and returns the
    /// resulting change events in order.
    ///
    /// The whole pass runs under one borrow of the entry, so the new roster
    /// atomically supersedes the old one.
    pub fn apply_status(
        &mut self,
        id: ServerId,
        status: &StatusResponse,
    ) -> Vec<(ChangeKind, Value)> {
        let Some(entry) = self.servers.get_mut(&id) else {
            return Vec::new();
        };
        entry.active = true;

        let mut events = Vec::new();
        let info = build_info(entry, status);

        match &entry.info {
            None => {
                info!("server {} active at {}:{}", id, entry.key.ip, entry.key.port);
                events.push((ChangeKind::ServerAdd, info_to_json(&info)));
            }
            Some(old) => {
                let changes = info_changes(old, &info);
                if !changes.is_empty() {
                    let mut payload = changes;
                    payload.insert("id".to_string(), json!(id));
                    events.push((ChangeKind::ServerUpdate, Value::Object(payload)));
                }
            }
        }
        entry.info = Some(info);

        // Roster reconciliation: adds and in-place updates first.
        for player in &status.players {
            match entry.players.get_mut(&player.name) {
                None => {
                    let player_id = self.next_id;
                    self.next_id += 1;
                    let created = PlayerEntry {
                        id: player_id,
                        server: id,
                        name: player.name.clone(),
                        score: player.score,
                        team: player.team,
                        ping: player.ping,
                    };
                    events.push((ChangeKind::PlayerAdd, created.to_json()));
                    entry.players.insert(player.name.clone(), created);
                }
                Some(existing) => {
                    let mut changes = Map::new();
                    if existing.score != player.score {
                        existing.score = player.score;
                        changes.insert("score".to_string(), json!(player.score));
                    }
                    if existing.team != player.team {
                        existing.team = player.team;
                        changes.insert("team".to_string(), json!(player.team));
                    }
                    if existing.ping != player.ping {
                        existing.ping = player.ping;
                        changes.insert("ping".to_string(), json!(player.ping));
                    }
                    if !changes.is_empty() {
                        changes.insert("id".to_string(), json!(existing.id));
                        events.push((ChangeKind::PlayerUpdate, Value::Object(changes)));
                    }
                }
            }
        }

        // Ghost pruning: names missing from this response are gone.
        let reported: HashSet<&str> = status.players.iter().map(|p| p.name.as_str()).collect();
        let ghosts: Vec<String> = entry
            .players
            .keys()
            .filter(|name| !reported.contains(name.as_str()))
            .cloned()
            .collect();
        for name in ghosts {
            if let Some(ghost) = entry.players.remove(&name) {
                events.push((ChangeKind::PlayerDelete, json!({ "id": ghost.id })));
            }
        }

        events
    }

    /// Removes a server that exhausted its failure budget. An entry that was
    /// active emits one delete per remaining player followed by the server
    /// delete; one that never responded disappears silently.
    pub fn retire(&mut self, id: ServerId) -> Vec<(ChangeKind, Value)> {
        let Some(entry) = self.servers.remove(&id) else {
            return Vec::new();
        };
        self.by_key.remove(&entry.key);

        let mut events = Vec::new();
        if entry.active {
            info!(
                "server {} at {}:{} retired with {} player(s)",
                id,
                entry.key.ip,
                entry.key.port,
                entry.players.len()
            );
            for player in entry.players.values() {
                events.push((ChangeKind::PlayerDelete, json!({ "id": player.id })));
            }
            events.push((ChangeKind::ServerDelete, json!({ "id": id })));
        } else {
            debug!("server {} at {}:{} never responded", id, entry.key.ip, entry.key.port);
        }
        events
    }

    /// Full-snapshot payloads for a consumer's initial feed message: every
    /// active server's current info and every tracked player.
    pub fn snapshot(&self) -> (Vec<Value>, Vec<Value>) {
        let mut servers = Vec::new();
        let mut players = Vec::new();
        for entry in self.servers.values() {
            if !entry.active {
                continue;
            }
            if let Some(info) = &entry.info {
                servers.push(info_to_json(info));
            }
            players.extend(entry.players.values().map(PlayerEntry::to_json));
        }
        (servers, players)
    }
}

/// The published info snapshot: the decoded mapping plus the identity and
/// region fields every snapshot carries.
fn build_info(entry: &ServerEntry, status: &StatusResponse) -> BTreeMap<String, InfoValue> {
    let mut info = status.info.clone();
    info.insert("id".to_string(), InfoValue::Int(entry.id as i64));
    info.insert(
        "family".to_string(),
        InfoValue::from(entry.key.family.to_string()),
    );
    info.insert("ip".to_string(), InfoValue::from(entry.key.ip.clone()));
    info.insert("port".to_string(), InfoValue::Int(entry.key.port as i64));
    info.insert("country".to_string(), InfoValue::from(entry.country.clone()));
    info.insert("region".to_string(), InfoValue::from(entry.region.clone()));
    info
}

/// Keys present in both snapshots whose value differs. Presence changes alone
/// are not tracked.
fn info_changes(
    old: &BTreeMap<String, InfoValue>,
    new: &BTreeMap<String, InfoValue>,
) -> Map<String, Value> {
    let mut changes = Map::new();
    for (key, value) in new {
        if old.get(key).map(|o| o != value).unwrap_or(false) {
            changes.insert(key.clone(), to_json_value(value));
        }
    }
    changes
}

fn info_to_json(info: &BTreeMap<String, InfoValue>) -> Value {
    let mut map = Map::new();
    for (key, value) in info {
        map.insert(key.clone(), to_json_value(value));
    }
    Value::Object(map)
}

fn to_json_value(value: &InfoValue) -> Value {
    match value {
        InfoValue::Int(n) => json!(n),
        InfoValue::Text(s) => json!(s),
    }
}
