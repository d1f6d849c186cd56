//! The TCP control protocol: one ASCII message per line, `VERB[:ARG[:ARG]]`.
//!
//! The wire does not self-frame beyond the newline delimiter, so readers
//! buffer into [`BytesMut`] and call [`take_line`] until it yields; a send
//! always corresponds to one line. JSON payloads are compact-encoded and
//! therefore never contain a newline.

use bytes::{Buf, BytesMut};

use crate::error::ProtocolError;
use crate::types::{ChannelId, UserId};

/// Hard cap on a single control line (UPDATE_CONFIG is the largest).
pub const MAX_LINE: usize = 65_536;

/// Messages sent from beltpack to server after authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientVerb {
    /// Enumerate profile names.
    GetUsers,
    /// Bind this session to a profile.
    SelectUser(String),
    /// Key (`on = true`) or unkey a subscribed channel.
    ToggleTalk { channel: ChannelId, on: bool },
    /// Operator-initiated bind (same effect as SELECT_USER).
    AssignUser(String),
    /// Register the UDP port this pack listens on.
    SetUdp(u16),
    /// Liveness probe.
    Ping,
}

/// Messages sent from server to beltpack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerVerb {
    /// Handshake opener; the argument is the hex-encoded nonce.
    AuthChallenge(String),
    /// Handshake success; the session's permanent user id.
    UserId(UserId),
    /// Handshake failure; the connection closes after this.
    AuthFail,
    /// Reply to GET_USERS.
    Users(Vec<String>),
    /// Reply to SELECT_USER / ASSIGN_USER; argument is the session-config JSON.
    Config(String),
    /// Request failed; optional machine-readable code (e.g. MAX_USERS_REACHED).
    Error(Option<String>),
    UdpOk,
    UdpFail,
    Pong,
    /// Identify-device request: the pack should flash its LEDs.
    FlashPack,
    /// Live profile change push; argument is the session-config JSON.
    UpdateConfig(String),
}

impl ClientVerb {
    pub fn encode(&self) -> String {
        match self {
            ClientVerb::GetUsers => "GET_USERS".into(),
            ClientVerb::SelectUser(name) => format!("SELECT_USER:{name}"),
            ClientVerb::ToggleTalk { channel, on } => {
                format!("TOGGLE_TALK:{channel}:{}", u8::from(*on))
            }
            ClientVerb::AssignUser(name) => format!("ASSIGN_USER:{name}"),
            ClientVerb::SetUdp(port) => format!("SET_UDP:{port}"),
            ClientVerb::Ping => "PING".into(),
        }
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let (verb, arg) = match line.split_once(':') {
            Some((v, a)) => (v, Some(a)),
            None => (line, None),
        };
        match (verb, arg) {
            ("GET_USERS", None) => Ok(ClientVerb::GetUsers),
            ("SELECT_USER", Some(name)) if !name.is_empty() => {
                Ok(ClientVerb::SelectUser(name.into()))
            }
            ("ASSIGN_USER", Some(name)) if !name.is_empty() => {
                Ok(ClientVerb::AssignUser(name.into()))
            }
            ("TOGGLE_TALK", Some(rest)) => {
                let (chan, state) =
                    rest.split_once(':').ok_or(ProtocolError::BadArgument {
                        verb: "TOGGLE_TALK",
                        detail: "expected <channel>:<0|1>".into(),
                    })?;
                let channel: ChannelId =
                    chan.parse().map_err(|_| ProtocolError::BadArgument {
                        verb: "TOGGLE_TALK",
                        detail: format!("bad channel {chan:?}"),
                    })?;
                let on = match state {
                    "0" => false,
                    "1" => true,
                    other => {
                        return Err(ProtocolError::BadArgument {
                            verb: "TOGGLE_TALK",
                            detail: format!("bad state {other:?}"),
                        })
                    }
                };
                Ok(ClientVerb::ToggleTalk { channel, on })
            }
            ("SET_UDP", Some(port)) => {
                let port: u16 = port.parse().map_err(|_| ProtocolError::BadArgument {
                    verb: "SET_UDP",
                    detail: format!("bad port {port:?}"),
                })?;
                Ok(ClientVerb::SetUdp(port))
            }
            ("PING", None) => Ok(ClientVerb::Ping),
            _ => Err(ProtocolError::UnknownVerb(line.into())),
        }
    }
}

impl ServerVerb {
    pub fn encode(&self) -> String {
        match self {
            ServerVerb::AuthChallenge(nonce) => format!("AUTH_CHALLENGE:{nonce}"),
            ServerVerb::UserId(id) => format!("USER_ID:{id}"),
            ServerVerb::AuthFail => "AUTH_FAIL".into(),
            ServerVerb::Users(names) => format!("USERS:{}", names.join(",")),
            ServerVerb::Config(json) => format!("CONFIG:{json}"),
            ServerVerb::Error(None) => "ERROR".into(),
            ServerVerb::Error(Some(code)) => format!("ERROR:{code}"),
            ServerVerb::UdpOk => "UDP_OK".into(),
            ServerVerb::UdpFail => "UDP_FAIL".into(),
            ServerVerb::Pong => "PONG".into(),
            ServerVerb::FlashPack => "FLASH_PACK".into(),
            ServerVerb::UpdateConfig(json) => format!("UPDATE_CONFIG:{json}"),
        }
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let (verb, arg) = match line.split_once(':') {
            Some((v, a)) => (v, Some(a)),
            None => (line, None),
        };
        match (verb, arg) {
            ("AUTH_CHALLENGE", Some(nonce)) if !nonce.is_empty() => {
                Ok(ServerVerb::AuthChallenge(nonce.into()))
            }
            ("USER_ID", Some(id)) => {
                let id: UserId = id.parse().map_err(|_| ProtocolError::BadArgument {
                    verb: "USER_ID",
                    detail: format!("bad id {id:?}"),
                })?;
                Ok(ServerVerb::UserId(id))
            }
            ("AUTH_FAIL", None) => Ok(ServerVerb::AuthFail),
            ("USERS", Some(names)) => {
                let names = names
                    .split(',')
                    .filter(|n| !n.is_empty())
                    .map(String::from)
                    .collect();
                Ok(ServerVerb::Users(names))
            }
            ("USERS", None) => Ok(ServerVerb::Users(Vec::new())),
            ("CONFIG", Some(json)) => Ok(ServerVerb::Config(json.into())),
            ("ERROR", code) => Ok(ServerVerb::Error(code.map(String::from))),
            ("UDP_OK", None) => Ok(ServerVerb::UdpOk),
            ("UDP_FAIL", None) => Ok(ServerVerb::UdpFail),
            ("PONG", None) => Ok(ServerVerb::Pong),
            ("FLASH_PACK", None) => Ok(ServerVerb::FlashPack),
            ("UPDATE_CONFIG", Some(json)) => Ok(ServerVerb::UpdateConfig(json.into())),
            _ => Err(ProtocolError::UnknownVerb(line.into())),
        }
    }
}

/// Append one encoded message plus delimiter to an outgoing buffer.
pub fn encode_line(msg: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(msg.len() + 1);
    out.extend_from_slice(msg.as_bytes());
    out.push(b'\n');
    out
}

/// Attempt to extract one complete line from a read buffer.
///
/// Returns `Ok(Some(line))` with the delimiter (and any trailing `\r`)
/// stripped, `Ok(None)` if more data is needed, or an error if the line
/// overruns [`MAX_LINE`] or is not UTF-8. Advances the buffer past the
/// consumed line.
pub fn take_line(buf: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
    let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > MAX_LINE {
            return Err(ProtocolError::LineTooLong(MAX_LINE));
        }
        return Ok(None);
    };
    if pos > MAX_LINE {
        return Err(ProtocolError::LineTooLong(MAX_LINE));
    }

    let line = buf.split_to(pos);
    buf.advance(1); // the delimiter
    let mut line = std::str::from_utf8(&line)
        .map_err(|_| ProtocolError::NotUtf8)?
        .to_string();
    if line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}
