//! Per-server status protocol: `getstatus` request and response decoding.
//!
//! A game server answers `\xFF\xFF\xFF\xFFgetstatus` with
//! `\xFF\xFF\xFF\xFFstatusResponse\n` followed by one info line of
//! `\key\value` pairs and one line per connected player, in the order
//! `score ping "name" team`. Decoding is lenient: malformed player lines are
//! skipped, unknown info keys stay strings, and only a missing header makes
//! the whole response unusable.

use crate::{InfoValue, OOB_PADDING};
use log::warn;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Info keys whose values are integers on the wire.
const INT_KEYS: &[&str] = &[
    "g_antilag",
    "g_instagib",
    "g_needpass",
    "g_race_gametype",
    "protocol",
    "sv_cheats",
    "sv_http",
    "sv_maxclients",
    "sv_maxmvclients",
    "sv_mm_enable",
    "sv_mm_loginonly",
    "sv_pps",
    "sv_pure",
    "sv_skilllevel",
    "sv_skillRating",
    "bots",
    "clients",
    "tv",
    "sv_livefork_interval",
];

/// Info key a server may set to lengthen its own poll cadence.
pub const POLL_INTERVAL_KEY: &str = "sv_livefork_interval";

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""(?:\\.|[^\\"])*"|\S+"#).expect("player token pattern"))
}

fn match_score_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*?): (.*?) (.*?): (.*?)$").expect("match score pattern"))
}

/// One player line from a status response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerStatus {
    pub name: String,
    pub score: i64,
    pub team: i64,
    pub ping: i64,
}

/// A decoded status response: the processed info mapping and player list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusResponse {
    pub info: BTreeMap<String, InfoValue>,
    pub players: Vec<PlayerStatus>,
}

/// Builds the status query datagram.
pub fn request() -> Vec<u8> {
    let mut out = OOB_PADDING.to_vec();
    out.extend_from_slice(b"getstatus");
    out
}

/// The fixed header of a status response, including the backslash that opens
/// the first info key.
pub fn response_header() -> Vec<u8> {
    let mut out = OOB_PADDING.to_vec();
    out.extend_from_slice(b"statusResponse\n\\");
    out
}

/// Decodes a status response datagram.
///
/// Returns `None` when the header is missing; the caller treats that the same
/// as no response at all.
pub fn decode_response(msg: &[u8]) -> Option<StatusResponse> {
    let header = response_header();
    let body = msg.strip_prefix(header.as_slice())?;
    let text = String::from_utf8_lossy(body);

    let mut lines: Vec<&str> = text.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }

    let mut it = lines.into_iter();
    let info_line = it.next().unwrap_or("");

    let mut info = BTreeMap::new();
    let parts: Vec<&str> = info_line.split('\\').collect();
    for pair in parts.chunks(2) {
        if let [key, value] = pair {
            info.insert(key.to_string(), InfoValue::from(value.trim()));
        }
    }

    coerce_int_keys(&mut info);
    derive_race_flag(&mut info);
    derive_match_score(&mut info);

    let mut players = Vec::new();
    for line in it {
        match parse_player_line(line) {
            Some(player) => players.push(player),
            None => {
                if !line.trim().is_empty() {
                    warn!("skipping malformed player line: {:?}", line);
                }
            }
        }
    }

    // Zero-ping entries are in-game bots even when the server does not count
    // them in its declared bots value.
    let zero_ping = players.iter().filter(|p| p.ping == 0).count() as i64;
    let declared = info.get("bots").and_then(InfoValue::as_int).unwrap_or(0);
    info.insert("bots".to_string(), InfoValue::Int(declared + zero_ping));

    Some(StatusResponse { info, players })
}

fn coerce_int_keys(info: &mut BTreeMap<String, InfoValue>) {
    for key in INT_KEYS {
        if let Some(InfoValue::Text(s)) = info.get(*key) {
            if let Ok(n) = s.trim().parse::<i64>() {
                info.insert(key.to_string(), InfoValue::Int(n));
            }
        }
    }
}

/// `race` is 1 when the server declares `g_race_gametype 1`, or, for servers
/// that predate that key, when the gametype name contains "race".
fn derive_race_flag(info: &mut BTreeMap<String, InfoValue>) {
    let race = match info.get("g_race_gametype") {
        Some(value) => value.as_int() == Some(1),
        None => matches!(
            info.get("gametype"),
            Some(InfoValue::Text(s)) if s.contains("race")
        ),
    };
    info.insert("race".to_string(), InfoValue::Int(race as i64));
}

/// Splits `g_match_score` of the form `name1: score1 name2: score2` into the
/// four team fields. An unmatched value is left alone.
fn derive_match_score(info: &mut BTreeMap<String, InfoValue>) {
    let score = match info.get("g_match_score") {
        Some(InfoValue::Text(s)) if !s.is_empty() => s.clone(),
        _ => return,
    };
    if let Some(caps) = match_score_regex().captures(&score) {
        info.insert("team_alpha_name".to_string(), InfoValue::from(&caps[1]));
        info.insert("team_alpha_score".to_string(), InfoValue::from(&caps[2]));
        info.insert("team_beta_name".to_string(), InfoValue::from(&caps[3]));
        info.insert("team_beta_score".to_string(), InfoValue::from(&caps[4]));
    }
}

/// Tokenizes one player line (`score ping "name" team`), respecting the
/// quoted name field. Returns `None` when a field is missing or non-numeric.
fn parse_player_line(line: &str) -> Option<PlayerStatus> {
    let tokens: Vec<&str> = token_regex().find_iter(line).map(|m| m.as_str()).collect();
    if tokens.len() < 4 {
        return None;
    }

    let score = tokens[0].parse::<i64>().ok()?;
    let ping = tokens[1].parse::<i64>().ok()?;
    let name = unquote(tokens[2]).to_string();
    let team = tokens[3].parse::<i64>().ok()?;

    Some(PlayerStatus {
        name,
        score,
        team,
        ping,
    })
}

fn unquote(token: &str) -> &str {
    token
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(token)
}
