//! Wire shapes for the cluster protocol.
//!
//! Every message on the channel is a JSON value. A message belongs to the
//! cluster protocol iff it is an object whose `cmd` string starts with
//! [`INTERNAL_PREFIX`]; everything else bypasses the protocol and surfaces
//! to user code unchanged.
//!
//! Internal messages use the [`Envelope`] shape. The `_requestEcho` /
//! `_queryEcho` pair correlates a request with its reply: the sender
//! allocates a token into `_requestEcho`, and the peer copies it into
//! `_queryEcho` on the reply, resuming the matching pending continuation.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hive_core::{HiveError, Result};

/// Reserved command prefix marking a message as cluster-internal.
pub const INTERNAL_PREFIX: &str = "NODE_CLUSTER_";

/// The internal command set.
///
/// Unknown commands are not represented here; dispatch treats them as a
/// catch-all that acknowledges with an empty echo, so a requester facing a
/// peer from another era never hangs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalCmd {
    /// Worker reports its channel is up
    Online,
    /// Worker asks the master for a shared listener
    QueryServer,
    /// Worker reports a listener is accepting, with the bound address
    Listening,
    /// Peer marks the worker's exit as intentional
    Suicide,
    /// Master tells the worker to run its graceful-disconnect procedure
    Disconnect,
}

impl InternalCmd {
    /// The bare (unprefixed) command string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::QueryServer => "queryServer",
            Self::Listening => "listening",
            Self::Suicide => "suicide",
            Self::Disconnect => "disconnect",
        }
    }

    /// Parse a bare command string.
    pub fn parse(bare: &str) -> Option<Self> {
        match bare {
            "online" => Some(Self::Online),
            "queryServer" => Some(Self::QueryServer),
            "listening" => Some(Self::Listening),
            "suicide" => Some(Self::Suicide),
            "disconnect" => Some(Self::Disconnect),
            _ => None,
        }
    }
}

impl std::fmt::Display for InternalCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The on-wire shape of an internal message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Prefixed command, e.g. `NODE_CLUSTER_online`
    pub cmd: String,
    /// Token the receiver must echo back if it replies
    #[serde(rename = "_requestEcho", default, skip_serializing_if = "Option::is_none")]
    pub request_echo: Option<String>,
    /// Token copied from a prior `_requestEcho`; resumes the continuation
    #[serde(rename = "_queryEcho", default, skip_serializing_if = "Option::is_none")]
    pub query_echo: Option<String>,
    /// Reply payload
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,
    /// Listen arguments (queryServer requests)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<ListenSpec>,
    /// Bound address (listening notifications)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<ListenAddress>,
    /// Failure report on a reply, e.g. a failed shared-listener bind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// A fresh internal message for `cmd` with no correlation or payload.
    pub fn new(cmd: InternalCmd) -> Self {
        Self {
            cmd: format!("{INTERNAL_PREFIX}{}", cmd.as_str()),
            request_echo: None,
            query_echo: None,
            content: Value::Null,
            args: None,
            address: None,
            error: None,
        }
    }

    /// The reply to this message: same command, `_queryEcho` set from the
    /// inbound `_requestEcho`.
    pub fn reply(&self, token: String) -> Self {
        Self {
            query_echo: Some(token),
            ..Self::new_raw(self.cmd.clone())
        }
    }

    fn new_raw(cmd: String) -> Self {
        Self {
            cmd,
            request_echo: None,
            query_echo: None,
            content: Value::Null,
            args: None,
            address: None,
            error: None,
        }
    }

    pub fn with_request_echo(mut self, token: String) -> Self {
        self.request_echo = Some(token);
        self
    }

    pub fn with_args(mut self, args: ListenSpec) -> Self {
        self.args = Some(args);
        self
    }

    pub fn with_address(mut self, address: ListenAddress) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// The command with the internal prefix stripped, if present.
    pub fn bare_cmd(&self) -> Option<&str> {
        self.cmd.strip_prefix(INTERNAL_PREFIX)
    }

    /// The parsed internal command; `None` for unknown commands.
    pub fn internal_cmd(&self) -> Option<InternalCmd> {
        self.bare_cmd().and_then(InternalCmd::parse)
    }
}

/// A decoded inbound message body.
#[derive(Debug)]
pub enum Inbound {
    /// A cluster-protocol message
    Internal(Envelope),
    /// A user message; surfaced verbatim as a `message` event
    User(Value),
}

/// Decode a frame body, splitting internal from user traffic.
pub fn decode(payload: &[u8]) -> Result<Inbound> {
    let value: Value = serde_json::from_slice(payload).map_err(|e| HiveError::codec("frame", e))?;
    let internal = value
        .get("cmd")
        .and_then(Value::as_str)
        .is_some_and(|cmd| cmd.starts_with(INTERNAL_PREFIX));
    if internal {
        let envelope =
            serde_json::from_value(value).map_err(|e| HiveError::codec("envelope", e))?;
        Ok(Inbound::Internal(envelope))
    } else {
        Ok(Inbound::User(value))
    }
}

/// Encode an internal message for the wire.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    serde_json::to_vec(envelope).map_err(|e| HiveError::codec("envelope", e))
}

/// Encode a user message for the wire.
pub fn encode_user(value: &Value) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| HiveError::codec("message", e))
}

/// The materialized argument list of a worker's listen call.
///
/// Its [`fingerprint`](Self::fingerprint) keys the master's shared-listener
/// registry: identical fingerprints share one kernel socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenSpec {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backlog: Option<u32>,
}

impl ListenSpec {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            backlog: None,
        }
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    /// Deterministic serialization of the argument list.
    pub fn fingerprint(&self) -> String {
        match self.backlog {
            Some(backlog) => format!("{}:{}:{}", self.host, self.port, backlog),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}

impl std::fmt::Display for ListenSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

/// An address a shared listener is actually bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenAddress {
    pub host: String,
    pub port: u16,
}

impl From<SocketAddr> for ListenAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl std::fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let envelope = Envelope::new(InternalCmd::QueryServer)
            .with_request_echo("1:7".into())
            .with_args(ListenSpec::new("127.0.0.1", 8080));
        let wire: Value = serde_json::from_slice(&encode(&envelope).unwrap()).unwrap();

        assert_eq!(wire["cmd"], "NODE_CLUSTER_queryServer");
        assert_eq!(wire["_requestEcho"], "1:7");
        assert_eq!(wire["args"]["port"], 8080);
        // Unset correlation fields stay off the wire entirely.
        assert!(wire.get("_queryEcho").is_none());
        assert!(wire.get("content").is_none());
        assert!(wire.get("error").is_none());
    }

    #[test]
    fn test_decode_splits_internal_from_user() {
        let internal = br#"{"cmd":"NODE_CLUSTER_online"}"#;
        assert!(matches!(
            decode(internal).unwrap(),
            Inbound::Internal(e) if e.internal_cmd() == Some(InternalCmd::Online)
        ));

        // A user message with its own cmd field is still a user message.
        let user = br#"{"cmd":"deploy","hello":1}"#;
        assert!(matches!(decode(user).unwrap(), Inbound::User(_)));

        let bare = br#"{"hello":1}"#;
        assert!(matches!(decode(bare).unwrap(), Inbound::User(_)));
    }

    #[test]
    fn test_unknown_internal_cmd() {
        let payload = br#"{"cmd":"NODE_CLUSTER_teleport"}"#;
        match decode(payload).unwrap() {
            Inbound::Internal(envelope) => {
                assert_eq!(envelope.bare_cmd(), Some("teleport"));
                assert!(envelope.internal_cmd().is_none());
            }
            Inbound::User(_) => panic!("prefixed cmd must classify as internal"),
        }
    }

    #[test]
    fn test_reply_carries_token() {
        let request = Envelope::new(InternalCmd::Suicide).with_request_echo("2:1".into());
        let reply = request.reply(request.request_echo.clone().unwrap());
        assert_eq!(reply.query_echo.as_deref(), Some("2:1"));
        assert!(reply.request_echo.is_none());
        assert_eq!(reply.cmd, request.cmd);
    }

    #[test]
    fn test_fingerprint_deterministic_and_distinct() {
        let a = ListenSpec::new("127.0.0.1", 8080);
        let b = ListenSpec::new("127.0.0.1", 8080);
        assert_eq!(a.fingerprint(), b.fingerprint());

        assert_ne!(
            ListenSpec::new("127.0.0.1", 8080).fingerprint(),
            ListenSpec::new("127.0.0.1", 8081).fingerprint()
        );
        assert_ne!(
            ListenSpec::new("127.0.0.1", 8080).fingerprint(),
            ListenSpec::new("0.0.0.0", 8080).fingerprint()
        );
        assert_ne!(
            ListenSpec::new("127.0.0.1", 8080).with_backlog(64).fingerprint(),
            ListenSpec::new("127.0.0.1", 8080).fingerprint()
        );
    }

    #[test]
    fn test_user_round_trip() {
        let msg = serde_json::json!({"hello": 1});
        let bytes = encode_user(&msg).unwrap();
        match decode(&bytes).unwrap() {
            Inbound::User(value) => assert_eq!(value, msg),
            Inbound::Internal(_) => panic!("user message classified as internal"),
        }
    }
}
