//! Push protocol messages.
//!
//! JSON text frames tagged by `type`:
//!
//! ```text
//! client → server   {"type":"hello","uaid":"…","channelIDs":["c1",{"chid":"c2","version":4}]}
//!                   {"type":"register","chid":"c3"}
//!                   {"type":"unregister","chid":"c3"}
//!                   {"type":"ack","chid":"c1","version":5}
//!                   {"type":"ping"} / {"type":"pong"}
//! server → client   {"type":"hello","uaid":"…","status":200}
//!                   {"type":"register","chid":"c3","status":200}
//!                   {"type":"unregister","chid":"c3","status":200}
//!                   {"type":"notification","chid":"c1","version":5}
//!                   {"type":"ping"} / {"type":"pong"}
//! ```
//!
//! `channelID` is accepted wherever `chid` is expected.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::update::Version;

/// Status code carried by successful replies.
pub const STATUS_OK: u16 = 200;

/// Status code carried by replies to requests with an invalid CHID.
pub const STATUS_BAD_REQUEST: u16 = 400;

/// Malformed or out-of-order client input. Always fatal for the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame was not a valid client message.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// Binary frames are not part of the protocol.
    #[error("unexpected binary frame")]
    Binary,
    /// A message other than `hello` arrived before the handshake.
    #[error("{0} before hello")]
    NotHandshaken(&'static str),
    /// A repeated `hello` named a different client.
    #[error("hello for {got} on connection already bound to {bound}")]
    UaidMismatch {
        /// UAID the connection is bound to.
        bound: String,
        /// UAID the repeated hello carried.
        got: String,
    },
}

/// One entry of `hello.channelIDs`: a bare CHID or a CHID with the version
/// the client already knows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelEntry {
    /// CHID without a known version.
    Bare(String),
    /// CHID with the client's last known version.
    Versioned {
        /// Channel identifier.
        #[serde(alias = "channelID")]
        chid: String,
        /// Last version the client has seen.
        #[serde(default)]
        version: Version,
    },
}

impl ChannelEntry {
    /// Channel identifier.
    pub fn chid(&self) -> &str {
        match self {
            ChannelEntry::Bare(chid) | ChannelEntry::Versioned { chid, .. } => chid,
        }
    }

    /// Version the client already knows (0 when unknown).
    pub fn version(&self) -> Version {
        match self {
            ChannelEntry::Bare(_) => 0,
            ChannelEntry::Versioned { version, .. } => *version,
        }
    }
}

/// Client → server message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Handshake.
    Hello {
        /// Existing UAID, or absent/empty to have one assigned.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uaid: Option<String>,
        /// Channels the client is subscribed to.
        #[serde(rename = "channelIDs", default)]
        channel_ids: Vec<ChannelEntry>,
    },
    /// Subscribe to a new channel.
    Register {
        /// Channel identifier.
        #[serde(alias = "channelID")]
        chid: String,
    },
    /// Drop a channel subscription.
    Unregister {
        /// Channel identifier.
        #[serde(alias = "channelID")]
        chid: String,
    },
    /// Confirm receipt of a notification.
    Ack {
        /// Channel identifier.
        #[serde(alias = "channelID")]
        chid: String,
        /// Version received.
        version: Version,
    },
    /// Client keepalive request.
    Ping,
    /// Answer to a server ping.
    Pong,
}

impl ClientMessage {
    /// Message type name, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Hello { .. } => "hello",
            ClientMessage::Register { .. } => "register",
            ClientMessage::Unregister { .. } => "unregister",
            ClientMessage::Ack { .. } => "ack",
            ClientMessage::Ping => "ping",
            ClientMessage::Pong => "pong",
        }
    }

    /// Encode as a JSON text frame.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).expect("client message serialization cannot fail")
    }
}

/// Server → client message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Handshake reply carrying the assigned/confirmed UAID.
    Hello {
        /// Client identifier.
        uaid: String,
        /// Reply status.
        status: u16,
    },
    /// Reply to `register`.
    Register {
        /// Channel identifier.
        chid: String,
        /// Reply status.
        status: u16,
    },
    /// Reply to `unregister`.
    Unregister {
        /// Channel identifier.
        chid: String,
        /// Reply status.
        status: u16,
    },
    /// A channel has a new version.
    Notification {
        /// Channel identifier.
        chid: String,
        /// New version.
        version: Version,
    },
    /// Server keepalive request.
    Ping,
    /// Answer to a client ping.
    Pong,
}

impl ServerMessage {
    /// Encode as a JSON text frame.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).expect("server message serialization cannot fail")
    }
}

/// Decode a client text frame.
pub fn decode_client(text: &str) -> Result<ClientMessage, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Decode a server text frame (client side of the protocol).
pub fn decode_server(text: &str) -> Result<ServerMessage, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}
