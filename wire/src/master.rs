//! Master server list protocol: request building and response decoding.
//!
//! A master answers a `getservers` query with one or more datagrams of the
//! form `\xFF\xFF\xFF\xFFgetserversResponse` followed by fixed-width address
//! entries. Each entry starts with a type token (`\` for IPv4, `/` for IPv6),
//! then the raw address bytes and a big-endian port. The final datagram ends
//! with a `\EOT\0\0\0` marker.

use crate::{Family, EOT_MARKER, OOB_PADDING};
use log::warn;

const TOKEN_V4: u8 = b'\\';
const TOKEN_V6: u8 = b'/';

/// A `(family, ip, port)` triple decoded from a master response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub family: Family,
    pub ip: String,
    pub port: u16,
}

/// Builds the query datagram for one master, game and protocol version.
pub fn request(family: Family, game: &str, protocol: &str) -> Vec<u8> {
    let verb = match family {
        Family::V4 => "getservers",
        Family::V6 => "getserversExt",
    };
    let mut out = OOB_PADDING.to_vec();
    out.extend_from_slice(format!("{} {} {} empty full", verb, game, protocol).as_bytes());
    out
}

/// The fixed header expected at the start of every response datagram.
pub fn response_header(family: Family) -> Vec<u8> {
    let verb = match family {
        Family::V4 => "getserversResponse",
        Family::V6 => "getserversExtResponse",
    };
    let mut out = OOB_PADDING.to_vec();
    out.extend_from_slice(verb.as_bytes());
    out
}

/// Decodes one response datagram into endpoints.
///
/// Returns the decoded endpoints and whether the EOT marker was seen, which
/// tells the caller to stop listening for further datagrams. A datagram with
/// a wrong header, a truncated entry, or an unknown type token yields the
/// entries decoded up to that point. IPv6 entries are skipped (but still
/// consumed) when `include_v6` is false.
pub fn decode_response(family: Family, msg: &[u8], include_v6: bool) -> (Vec<Endpoint>, bool) {
    let header = response_header(family);
    let mut out = Vec::new();

    if !msg.starts_with(&header) {
        warn!("master response with unexpected header ({} bytes)", msg.len());
        return (out, false);
    }

    let mut i = header.len();
    while i < msg.len() {
        let token = msg[i];
        i += 1;

        if msg[i..].starts_with(EOT_MARKER) {
            return (out, true);
        }

        let (entry_family, ip) = match token {
            TOKEN_V4 => {
                if i + 6 > msg.len() {
                    break;
                }
                let ip = msg[i..i + 4]
                    .iter()
                    .map(|b| b.to_string())
                    .collect::<Vec<_>>()
                    .join(".");
                i += 4;
                (Family::V4, ip)
            }
            TOKEN_V6 => {
                if i + 18 > msg.len() {
                    break;
                }
                let ip = (0..8)
                    .map(|g| {
                        let group = u16::from_be_bytes([msg[i + g * 2], msg[i + g * 2 + 1]]);
                        format!("{:x}", group)
                    })
                    .collect::<Vec<_>>()
                    .join(":");
                i += 16;
                (Family::V6, ip)
            }
            other => {
                warn!("master response: unknown type token 0x{:02x}", other);
                break;
            }
        };

        let port = u16::from_be_bytes([msg[i], msg[i + 1]]);
        i += 2;

        if entry_family == Family::V6 && !include_v6 {
            continue;
        }

        out.push(Endpoint {
            family: entry_family,
            ip,
            port,
        });
    }

    (out, false)
}
