//! Text wire format shared by server and clients
//!
//! Every frame is whitespace-delimited tokens on newline-terminated lines:
//!
//! ```text
//! HELLO                                         client -> registrar
//! <port> | FULL                                 registrar -> client
//! CMD <clientId> <tick> <actions> <x> <y> <eventCount>
//!   <type> <priority> <paramCount> (<key> <INT|FLOAT> <value>)*   x eventCount
//! DISCONNECT <clientId>
//! Acknowledged                                  reply to every request
//! SNAP <tick> <playerCount> <objectCount> <removedCount>
//!   <removed ids> <playerCount * (id x y)> <objectCount * (id type x y)>
//! SUBSCRIBE | UNSUBSCRIBE                       client -> broadcast endpoint
//! ```
//!
//! Decoding is strict. A missing, extra or non-numeric token rejects the whole
//! frame, and decoders only ever build fresh values, so a failed decode leaves
//! nothing half-applied for the caller to clean up.

use crate::event::{Event, ParamValue};
use crate::{ClientCommand, ClientId, SyncedObjectData, Vec2, WorldSnapshot, MAX_EVENTS_PER_COMMAND};
use std::str::{FromStr, SplitWhitespace};
use thiserror::Error;

pub const HELLO: &str = "HELLO";
pub const FULL: &str = "FULL";
pub const ACK: &str = "Acknowledged";
pub const SUBSCRIBE: &str = "SUBSCRIBE";
pub const UNSUBSCRIBE: &str = "UNSUBSCRIBE";

const CMD_TAG: &str = "CMD";
const DISCONNECT_TAG: &str = "DISCONNECT";
const SNAP_TAG: &str = "SNAP";
const INT_TAG: &str = "INT";
const FLOAT_TAG: &str = "FLOAT";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WireError {
    #[error("empty frame")]
    Empty,
    #[error("expected {expected} frame, found {found:?}")]
    UnexpectedTag {
        expected: &'static str,
        found: String,
    },
    #[error("frame ended before {0}")]
    MissingField(&'static str),
    #[error("{field} is not a valid number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("unknown parameter type {0:?}")]
    UnknownParamTag(String),
    #[error("unexpected data after {0}")]
    TrailingData(&'static str),
    #[error("{0} events exceed the per-command limit")]
    TooManyEvents(usize),
    #[error("token {0:?} is empty or contains whitespace")]
    InvalidToken(String),
    #[error("parameter {0:?} holds a value that cannot be sent")]
    UnsupportedParam(String),
    #[error("{0} is not a finite number")]
    NonFinite(&'static str),
    #[error("snapshot has {ids} player ids but {positions} positions")]
    PlayerArrayMismatch { ids: usize, positions: usize },
}

/// A frame received on a command channel
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Command(ClientCommand),
    Disconnect { client_id: ClientId },
}

/// The registrar's answer to a `HELLO`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeReply {
    Assigned(u16),
    Full,
}

/// Cursor over the tokens of one line or frame
struct Tokens<'a> {
    inner: SplitWhitespace<'a>,
}

impl<'a> Tokens<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            inner: text.split_whitespace(),
        }
    }

    fn word(&mut self, field: &'static str) -> Result<&'a str, WireError> {
        self.inner.next().ok_or(WireError::MissingField(field))
    }

    fn number<T: FromStr>(&mut self, field: &'static str) -> Result<T, WireError> {
        let raw = self.word(field)?;
        raw.parse().map_err(|_| WireError::InvalidNumber {
            field,
            value: raw.to_string(),
        })
    }

    /// Like `number` but also refuses `NaN` and infinities, which `f32`
    /// parsing would otherwise accept
    fn float(&mut self, field: &'static str) -> Result<f32, WireError> {
        let raw = self.word(field)?;
        match raw.parse::<f32>() {
            Ok(value) if value.is_finite() => Ok(value),
            _ => Err(WireError::InvalidNumber {
                field,
                value: raw.to_string(),
            }),
        }
    }

    fn expect_tag(&mut self, expected: &'static str) -> Result<(), WireError> {
        match self.inner.next() {
            Some(tag) if tag == expected => Ok(()),
            Some(tag) => Err(WireError::UnexpectedTag {
                expected,
                found: tag.to_string(),
            }),
            None => Err(WireError::Empty),
        }
    }

    fn finish(mut self, context: &'static str) -> Result<(), WireError> {
        match self.inner.next() {
            Some(_) => Err(WireError::TrailingData(context)),
            None => Ok(()),
        }
    }
}

fn check_token(token: &str) -> Result<(), WireError> {
    if token.is_empty() || token.chars().any(char::is_whitespace) {
        return Err(WireError::InvalidToken(token.to_string()));
    }
    Ok(())
}

fn check_finite(value: f32, field: &'static str) -> Result<f32, WireError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(WireError::NonFinite(field))
    }
}

fn encode_event(event: &Event, out: &mut String) -> Result<(), WireError> {
    check_token(&event.kind)?;
    out.push_str(&format!(
        "{} {} {}",
        event.kind,
        event.priority,
        event.params.len()
    ));

    for (key, value) in &event.params {
        check_token(key)?;
        match value {
            ParamValue::Int(v) => out.push_str(&format!(" {} {} {}", key, INT_TAG, v)),
            ParamValue::Float(v) => {
                let v = check_finite(*v, "FLOAT parameter")?;
                out.push_str(&format!(" {} {} {}", key, FLOAT_TAG, v));
            }
            ParamValue::Entity(_) => return Err(WireError::UnsupportedParam(key.clone())),
        }
    }

    out.push('\n');
    Ok(())
}

fn decode_event(line: &str) -> Result<Event, WireError> {
    let mut tokens = Tokens::new(line);
    let kind = tokens.word("event type")?;
    let priority = tokens.number("event priority")?;
    let param_count: usize = tokens.number("parameter count")?;

    let mut event = Event::new(kind).with_priority(priority);
    for _ in 0..param_count {
        let key = tokens.word("parameter name")?;
        let value = match tokens.word("parameter type")? {
            INT_TAG => ParamValue::Int(tokens.number("INT parameter")?),
            FLOAT_TAG => ParamValue::Float(tokens.float("FLOAT parameter")?),
            other => return Err(WireError::UnknownParamTag(other.to_string())),
        };
        event.params.insert(key.to_string(), value);
    }

    tokens.finish("event parameters")?;
    Ok(event)
}

/// Encodes a command frame, header line followed by one line per event
pub fn encode_command(cmd: &ClientCommand) -> Result<String, WireError> {
    if cmd.events.len() > MAX_EVENTS_PER_COMMAND {
        return Err(WireError::TooManyEvents(cmd.events.len()));
    }

    let mut out = format!(
        "{} {} {} {} {} {} {}\n",
        CMD_TAG,
        cmd.client_id,
        cmd.tick,
        cmd.actions,
        check_finite(cmd.x, "x")?,
        check_finite(cmd.y, "y")?,
        cmd.events.len()
    );

    for event in &cmd.events {
        encode_event(event, &mut out)?;
    }

    Ok(out)
}

pub fn decode_command(text: &str) -> Result<ClientCommand, WireError> {
    let mut lines = text.lines();
    let header = lines.next().ok_or(WireError::Empty)?;

    let mut tokens = Tokens::new(header);
    tokens.expect_tag(CMD_TAG)?;
    let client_id = tokens.number("client id")?;
    let tick = tokens.number("tick")?;
    let actions = tokens.number("action mask")?;
    let x = tokens.float("x")?;
    let y = tokens.float("y")?;
    let event_count: usize = tokens.number("event count")?;
    tokens.finish("command header")?;

    if event_count > MAX_EVENTS_PER_COMMAND {
        return Err(WireError::TooManyEvents(event_count));
    }

    let mut events = Vec::with_capacity(event_count);
    for _ in 0..event_count {
        let line = lines.next().ok_or(WireError::MissingField("event line"))?;
        events.push(decode_event(line)?);
    }

    if lines.any(|line| !line.trim().is_empty()) {
        return Err(WireError::TrailingData("command events"));
    }

    Ok(ClientCommand {
        client_id,
        tick,
        actions,
        x,
        y,
        events,
    })
}

pub fn encode_disconnect(client_id: ClientId) -> String {
    format!("{} {}\n", DISCONNECT_TAG, client_id)
}

/// Decodes any frame a client may send on its command channel
pub fn decode_request(text: &str) -> Result<Request, WireError> {
    let tag = text.split_whitespace().next().ok_or(WireError::Empty)?;
    match tag {
        CMD_TAG => decode_command(text).map(Request::Command),
        DISCONNECT_TAG => {
            let mut tokens = Tokens::new(text);
            tokens.expect_tag(DISCONNECT_TAG)?;
            let client_id = tokens.number("client id")?;
            tokens.finish("disconnect")?;
            Ok(Request::Disconnect { client_id })
        }
        other => Err(WireError::UnexpectedTag {
            expected: "CMD or DISCONNECT",
            found: other.to_string(),
        }),
    }
}

pub fn encode_snapshot(snapshot: &WorldSnapshot) -> Result<String, WireError> {
    if snapshot.player_ids.len() != snapshot.player_positions.len() {
        return Err(WireError::PlayerArrayMismatch {
            ids: snapshot.player_ids.len(),
            positions: snapshot.player_positions.len(),
        });
    }

    let mut parts = vec![
        SNAP_TAG.to_string(),
        snapshot.tick.to_string(),
        snapshot.player_ids.len().to_string(),
        snapshot.synced_objects.len().to_string(),
        snapshot.removed_ids.len().to_string(),
    ];

    parts.extend(snapshot.removed_ids.iter().map(|id| id.to_string()));
    for (id, pos) in snapshot.players() {
        parts.push(format!(
            "{} {} {}",
            id,
            check_finite(pos.x, "player x")?,
            check_finite(pos.y, "player y")?
        ));
    }
    for obj in &snapshot.synced_objects {
        parts.push(format!(
            "{} {} {} {}",
            obj.id,
            obj.type_id,
            check_finite(obj.position.x, "object x")?,
            check_finite(obj.position.y, "object y")?
        ));
    }

    let mut out = parts.join(" ");
    out.push('\n');
    Ok(out)
}

pub fn decode_snapshot(text: &str) -> Result<WorldSnapshot, WireError> {
    let mut tokens = Tokens::new(text);
    tokens.expect_tag(SNAP_TAG)?;
    let tick = tokens.number("tick")?;
    let player_count: usize = tokens.number("player count")?;
    let object_count: usize = tokens.number("object count")?;
    let removed_count: usize = tokens.number("removed count")?;

    // Counts are untrusted, so grow vectors as tokens actually arrive.
    let mut snapshot = WorldSnapshot::new(tick);
    for _ in 0..removed_count {
        snapshot.removed_ids.push(tokens.number("removed id")?);
    }
    for _ in 0..player_count {
        let id = tokens.number("player id")?;
        let x = tokens.float("player x")?;
        let y = tokens.float("player y")?;
        snapshot.push_player(id, Vec2::new(x, y));
    }
    for _ in 0..object_count {
        let id = tokens.number("object id")?;
        let type_id = tokens.number("object type")?;
        let x = tokens.float("object x")?;
        let y = tokens.float("object y")?;
        snapshot.synced_objects.push(SyncedObjectData {
            id,
            type_id,
            position: Vec2::new(x, y),
        });
    }

    tokens.finish("snapshot")?;
    Ok(snapshot)
}

pub fn encode_port_reply(port: u16) -> String {
    format!("{}\n", port)
}

pub fn decode_handshake_reply(text: &str) -> Result<HandshakeReply, WireError> {
    let mut tokens = Tokens::new(text);
    let word = tokens.word("assigned port")?;
    let reply = if word == FULL {
        HandshakeReply::Full
    } else {
        let port = word.parse().map_err(|_| WireError::InvalidNumber {
            field: "assigned port",
            value: word.to_string(),
        })?;
        HandshakeReply::Assigned(port)
    };
    tokens.finish("handshake reply")?;
    Ok(reply)
}

/// Returns true if `text` is the single-token control word `word`
pub fn is_control(text: &str, word: &str) -> bool {
    let mut tokens = text.split_whitespace();
    tokens.next() == Some(word) && tokens.next().is_none()
}
