//! SOCKS4 / SOCKS4a wire format.
//!
//! Request layout (big-endian):
//!
//! ```text
//! +----+----+----+----+----+----+----+----+----+----+....+----+
//! | VN | CD | DSTPORT |      DSTIP        | USERID       |NULL|
//! +----+----+----+----+----+----+----+----+----+----+....+----+
//! ```
//!
//! SOCKS4a requests set DSTIP to `0.0.0.x` (x non-zero) and append a
//! null-terminated domain name after the user id.
//!
//! Nothing in here fails: malformed input shows up as empty fields and an
//! invalid [`ParsedRequest`].

use std::net::Ipv4Addr;

pub const PROTOCOL_VERSION: u8 = 0x04;

const REPLY_VERSION: u8 = 0x00;

const PORT_OFFSET: usize = 2;
const ADDRESS_OFFSET: usize = 4;
const USER_ID_OFFSET: usize = 8;

pub const REPLY_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl Command {
    /// Name under which requests for this command are announced.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect => "connect",
            Command::Bind => "bind",
            Command::UdpAssociate => "udpassociate",
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;
    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            other => Err(other),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Granted = 0x5a,
    #[default]
    Rejected = 0x5b,
    RejectedIdentConnect = 0x5c,
    RejectedUserIdMismatch = 0x5d,
}

/// Fields of a handshake buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub version: u8,
    pub command: Option<Command>,
    pub port: u16,
    pub host: String,
    pub user_id: String,
    pub valid: bool,
}

/// Parse the first buffer received on a connection.
///
/// Only version 4 is understood. Any other version yields an invalid request
/// without looking at the remaining bytes.
pub fn parse(buf: &[u8]) -> ParsedRequest {
    let version = buf.first().copied().unwrap_or_default();

    if version != PROTOCOL_VERSION {
        return ParsedRequest {
            version,
            command: None,
            port: 0,
            host: String::new(),
            user_id: String::new(),
            valid: false,
        };
    }

    let command = extract_command(buf);
    let port = extract_port(buf);
    let host = extract_host(buf);
    let user_id = extract_user_id(buf);

    let valid = command.is_some() && port != 0 && !host.is_empty();

    ParsedRequest {
        version,
        command,
        port,
        host,
        user_id,
        valid,
    }
}

/// Only CONNECT and BIND are accepted; UDP ASSOCIATE is not a SOCKS4 command.
pub fn extract_command(buf: &[u8]) -> Option<Command> {
    match buf.get(1).copied().map(Command::try_from) {
        Some(Ok(cmd @ (Command::Connect | Command::Bind))) => Some(cmd),
        _ => None,
    }
}

pub fn extract_port(buf: &[u8]) -> u16 {
    match buf.get(PORT_OFFSET..PORT_OFFSET + 2) {
        Some(bytes) => u16::from_be_bytes([bytes[0], bytes[1]]),
        None => 0,
    }
}

/// Destination host: the dotted quad of DSTIP, or the SOCKS4a domain name
/// when DSTIP is `0.0.0.x` with `x > 0`.
pub fn extract_host(buf: &[u8]) -> String {
    let Some(ip) = buf.get(ADDRESS_OFFSET..USER_ID_OFFSET) else {
        return String::new();
    };

    if ip[..3] == [0, 0, 0] && ip[3] > 0 {
        let domain_start = terminator(buf, USER_ID_OFFSET) + 1;
        let domain_end = terminator(buf, domain_start);
        return decode(buf, domain_start, domain_end);
    }

    Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]).to_string()
}

pub fn extract_user_id(buf: &[u8]) -> String {
    decode(buf, USER_ID_OFFSET, terminator(buf, USER_ID_OFFSET))
}

/// Build the 8-byte reply carrying `status`.
pub fn reply(status: Status) -> [u8; REPLY_LEN] {
    [REPLY_VERSION, status as u8, 0, 0, 0, 0, 0, 0]
}

/// Index of the first null byte at or after `start`; the buffer length when
/// there is none.
fn terminator(buf: &[u8], start: usize) -> usize {
    buf.get(start..)
        .and_then(|rest| rest.iter().position(|&b| b == 0))
        .map_or(buf.len(), |pos| start + pos)
}

fn decode(buf: &[u8], start: usize, end: usize) -> String {
    match buf.get(start..end) {
        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        None => String::new(),
    }
}
