//! Wire protocol types, constants, and JSON encode/decode.
//!
//! The server speaks an id-correlated command/reply protocol over WebSocket
//! text frames. Each command is one JSON object per frame; a frame from the
//! server may batch several replies separated by newlines. An empty object
//! `{}` from the server is a ping, and an empty command is the client's pong.

use serde::{Deserialize, Serialize};

use crate::Error;

// ---------------------------------------------------------------------------
// Protocol error codes (carried in reply errors)
// ---------------------------------------------------------------------------

pub mod error_code {
    pub const INTERNAL: u32 = 100;
    pub const UNAUTHORIZED: u32 = 101;
    pub const UNKNOWN_CHANNEL: u32 = 102;
    pub const PERMISSION_DENIED: u32 = 103;
    pub const METHOD_NOT_FOUND: u32 = 104;
    pub const ALREADY_SUBSCRIBED: u32 = 105;
    pub const LIMIT_EXCEEDED: u32 = 106;
    pub const BAD_REQUEST: u32 = 107;
    pub const NOT_AVAILABLE: u32 = 108;
    pub const TOKEN_EXPIRED: u32 = 109;
    pub const EXPIRED: u32 = 110;
    pub const TOO_MANY_REQUESTS: u32 = 111;
}

pub mod disconnect_code {
    // Local causes, never seen on the wire.
    pub const CLOSED_BY_CLIENT: u32 = 0;
    pub const TRANSPORT_ERROR: u32 = 1;
    pub const NO_PING: u32 = 2;
    pub const CONNECT_REJECTED: u32 = 3;
    // Server-assigned codes start at 3000; anything else in a close frame or
    // disconnect push is passed through verbatim.
    pub const CONNECTION_CLOSED: u32 = 3000;
    pub const SHUTDOWN: u32 = 3001;
}

// ---------------------------------------------------------------------------
// Wire protocol types (JSON)
// ---------------------------------------------------------------------------

fn is_zero(id: &u32) -> bool {
    *id == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// A client-to-server frame. An id of zero means no reply is expected; the
/// all-default command serializes to `{}`, which is the client's pong.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Command {
    #[serde(skip_serializing_if = "is_zero")]
    pub id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect: Option<ConnectRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<SubscribeRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsubscribe: Option<UnsubscribeRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConnectRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SubscribeRequest {
    pub channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UnsubscribeRequest {
    pub channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PublishRequest {
    pub channel: String,
    pub data: serde_json::Value,
}

/// A server-to-client frame. A non-zero id resolves the pending command with
/// that id; a `push` is asynchronous; the empty reply `{}` is the server's
/// ping.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Reply {
    #[serde(skip_serializing_if = "is_zero")]
    pub id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push: Option<Push>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect: Option<ConnectResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<SubscribeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsubscribe: Option<UnsubscribeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishResult>,
}

impl Reply {
    /// An empty reply is the server's ping.
    pub fn is_ping(&self) -> bool {
        self.id == 0
            && self.error.is_none()
            && self.push.is_none()
            && self.connect.is_none()
            && self.subscribe.is_none()
            && self.unsubscribe.is_none()
            && self.publish.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ErrorInfo {
    pub code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "is_false")]
    pub temporary: bool,
}

/// Handshake result. `ping` is the interval in seconds at which the server
/// pings; `pong` is whether it expects the client to answer.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConnectResult {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub ping: u32,
    #[serde(skip_serializing_if = "is_false")]
    pub pong: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub session: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub node: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SubscribeResult {
    #[serde(skip_serializing_if = "is_false")]
    pub expires: bool,
    #[serde(skip_serializing_if = "is_zero")]
    pub ttl: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UnsubscribeResult {}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PublishResult {}

/// An asynchronous server-initiated message.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Push {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(rename = "pub", skip_serializing_if = "Option::is_none")]
    pub publication: Option<Publication>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsubscribe: Option<UnsubscribePush>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnect: Option<DisconnectPush>,
}

/// A message published to a channel, fanned out to its subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Publication {
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<ClientInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

/// Identity the server attaches to a publication's originator.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ClientInfo {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client: String,
}

/// Server-forced removal of a channel subscription.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UnsubscribePush {
    pub code: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

/// Advance notice of connection teardown, sent before the server closes the
/// socket.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DisconnectPush {
    pub code: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Encode / decode helpers
// ---------------------------------------------------------------------------

pub fn encode_command(cmd: &Command) -> Result<String, Error> {
    Ok(serde_json::to_string(cmd)?)
}

/// Decode one text frame into replies. Frames may batch several replies
/// separated by newlines; blank lines are skipped.
pub fn decode_reply_frame(frame: &str) -> Result<Vec<Reply>, Error> {
    frame
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| Ok(serde_json::from_str(line)?))
        .collect()
}

// ---------------------------------------------------------------------------
// Command builders (ids are assigned by the connection task)
// ---------------------------------------------------------------------------

pub fn build_connect(token: Option<String>, name: &str, version: &str) -> Command {
    Command {
        connect: Some(ConnectRequest {
            token: token.filter(|t| !t.is_empty()),
            name: name.to_string(),
            version: version.to_string(),
        }),
        ..Default::default()
    }
}

pub fn build_subscribe(channel: &str) -> Command {
    Command {
        subscribe: Some(SubscribeRequest {
            channel: channel.to_string(),
        }),
        ..Default::default()
    }
}

pub fn build_publish(channel: &str, data: serde_json::Value) -> Command {
    Command {
        publish: Some(PublishRequest {
            channel: channel.to_string(),
            data,
        }),
        ..Default::default()
    }
}

pub fn build_unsubscribe(channel: &str) -> Command {
    Command {
        unsubscribe: Some(UnsubscribeRequest {
            channel: channel.to_string(),
        }),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_connect_shape() {
        let mut cmd = build_connect(None, "realtime-client-rs", "0.1.0");
        cmd.id = 1;
        let json = encode_command(&cmd).unwrap();
        assert_eq!(
            json,
            r#"{"id":1,"connect":{"name":"realtime-client-rs","version":"0.1.0"}}"#
        );
    }

    #[test]
    fn encode_connect_with_token() {
        let mut cmd = build_connect(Some("secret".into()), "c", "1");
        cmd.id = 1;
        let json = encode_command(&cmd).unwrap();
        assert!(json.contains(r#""token":"secret""#));
    }

    #[test]
    fn encode_connect_empty_token_omitted() {
        let cmd = build_connect(Some(String::new()), "c", "1");
        let json = encode_command(&cmd).unwrap();
        assert!(!json.contains("token"));
    }

    #[test]
    fn encode_subscribe_shape() {
        let mut cmd = build_subscribe("chat");
        cmd.id = 2;
        let json = encode_command(&cmd).unwrap();
        assert_eq!(json, r#"{"id":2,"subscribe":{"channel":"chat"}}"#);
    }

    #[test]
    fn encode_publish_shape() {
        let mut cmd = build_publish("chat", serde_json::json!({"text": "hello"}));
        cmd.id = 3;
        let json = encode_command(&cmd).unwrap();
        assert_eq!(
            json,
            r#"{"id":3,"publish":{"channel":"chat","data":{"text":"hello"}}}"#
        );
    }

    #[test]
    fn encode_unsubscribe_shape() {
        let mut cmd = build_unsubscribe("chat");
        cmd.id = 4;
        let json = encode_command(&cmd).unwrap();
        assert_eq!(json, r#"{"id":4,"unsubscribe":{"channel":"chat"}}"#);
    }

    #[test]
    fn encode_pong_is_empty_object() {
        let json = encode_command(&Command::default()).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn decode_connect_reply() {
        let replies = decode_reply_frame(
            r#"{"id":1,"connect":{"client":"d0a3...","version":"5.4.0","ping":25,"pong":true}}"#,
        )
        .unwrap();
        assert_eq!(replies.len(), 1);
        let reply = replies.first().unwrap();
        assert_eq!(reply.id, 1);
        let result = reply.connect.as_ref().unwrap();
        assert_eq!(result.client, "d0a3...");
        assert_eq!(result.ping, 25);
        assert!(result.pong);
    }

    #[test]
    fn decode_error_reply() {
        let replies =
            decode_reply_frame(r#"{"id":3,"error":{"code":103,"message":"permission denied"}}"#)
                .unwrap();
        let reply = replies.first().unwrap();
        assert_eq!(reply.id, 3);
        let err = reply.error.as_ref().unwrap();
        assert_eq!(err.code, error_code::PERMISSION_DENIED);
        assert_eq!(err.message, "permission denied");
        assert!(!err.temporary);
    }

    #[test]
    fn decode_publication_push() {
        let replies = decode_reply_frame(
            r#"{"push":{"channel":"chat","pub":{"data":{"text":"hi"},"offset":12}}}"#,
        )
        .unwrap();
        let reply = replies.first().unwrap();
        assert_eq!(reply.id, 0);
        let push = reply.push.as_ref().unwrap();
        assert_eq!(push.channel, "chat");
        let publication = push.publication.as_ref().unwrap();
        assert_eq!(publication.data, serde_json::json!({"text": "hi"}));
        assert_eq!(publication.offset, Some(12));
    }

    #[test]
    fn decode_disconnect_push() {
        let replies =
            decode_reply_frame(r#"{"push":{"disconnect":{"code":3001,"reason":"shutdown"}}}"#)
                .unwrap();
        let push = replies.first().unwrap().push.as_ref().unwrap();
        let disconnect = push.disconnect.as_ref().unwrap();
        assert_eq!(disconnect.code, disconnect_code::SHUTDOWN);
        assert_eq!(disconnect.reason, "shutdown");
    }

    #[test]
    fn decode_unsubscribe_push() {
        let replies = decode_reply_frame(
            r#"{"push":{"channel":"chat","unsubscribe":{"code":2500,"reason":"no longer allowed"}}}"#,
        )
        .unwrap();
        let push = replies.first().unwrap().push.as_ref().unwrap();
        assert_eq!(push.channel, "chat");
        let unsubscribe = push.unsubscribe.as_ref().unwrap();
        assert_eq!(unsubscribe.code, 2500);
    }

    #[test]
    fn decode_batched_frame() {
        let frame = concat!(
            r#"{"id":2,"subscribe":{}}"#,
            "\n",
            r#"{"push":{"channel":"chat","pub":{"data":1}}}"#,
            "\n",
            "{}",
        );
        let replies = decode_reply_frame(frame).unwrap();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies.first().unwrap().id, 2);
        assert!(replies.get(1).unwrap().push.is_some());
        assert!(replies.get(2).unwrap().is_ping());
    }

    #[test]
    fn ping_classification() {
        let replies = decode_reply_frame("{}").unwrap();
        assert!(replies.first().unwrap().is_ping());
        let replies = decode_reply_frame(r#"{"id":1}"#).unwrap();
        assert!(!replies.first().unwrap().is_ping());
        let replies = decode_reply_frame(r#"{"push":{"channel":"c"}}"#).unwrap();
        assert!(!replies.first().unwrap().is_ping());
    }

    #[test]
    fn decode_malformed_frame_is_error() {
        assert!(decode_reply_frame("not json").is_err());
    }

    #[test]
    fn command_round_trip_through_serde() {
        let mut cmd = build_publish("chat", serde_json::json!({"n": 1}));
        cmd.id = 7;
        let json = encode_command(&cmd).unwrap();
        let parsed: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, 7);
        let publish = parsed.publish.as_ref().unwrap();
        assert_eq!(publish.channel, "chat");
        assert_eq!(publish.data, serde_json::json!({"n": 1}));
    }

    #[test]
    fn error_code_constants() {
        assert_eq!(error_code::INTERNAL, 100);
        assert_eq!(error_code::UNAUTHORIZED, 101);
        assert_eq!(error_code::UNKNOWN_CHANNEL, 102);
        assert_eq!(error_code::PERMISSION_DENIED, 103);
        assert_eq!(error_code::METHOD_NOT_FOUND, 104);
        assert_eq!(error_code::ALREADY_SUBSCRIBED, 105);
        assert_eq!(error_code::LIMIT_EXCEEDED, 106);
        assert_eq!(error_code::BAD_REQUEST, 107);
        assert_eq!(error_code::NOT_AVAILABLE, 108);
        assert_eq!(error_code::TOKEN_EXPIRED, 109);
        assert_eq!(error_code::EXPIRED, 110);
        assert_eq!(error_code::TOO_MANY_REQUESTS, 111);
    }
}
