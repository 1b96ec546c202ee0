//! Protobuf messages and wire constants carried by the core. The wider
//! message catalog lives with the application; only the frames the library
//! itself emits or consumes are defined here.

use prost::Message;

/// Magic carried inside `ProtocolVersion`.
pub const PROTOCOL_VERSION_MAGIC: u32 = 0x4752_4944;
/// Magic carried inside `ForwardRemote`.
pub const FORWARD_REMOTE_MAGIC: u32 = 0x4657_4452;

/// Signature a forwarding server echoes back when it accepted the tunnel.
pub const FORWARD_REMOTE_SIGNATURE: &str = "peer-forward-ready/1.0";

/// Message-type byte of a pre-handshake data frame.
pub const MSG_FORWARD_HOLD: u8 = 0;
pub const MSG_FORWARD_REMOTE: u8 = 1;
pub const MSG_FORWARD_REPLY: u8 = 2;
pub const MSG_FORWARD_ERROR: u8 = 3;

/// `ForwardError` codes.
pub const FORWARD_SERVER_ERROR: u32 = 0;
pub const FORWARD_PEER_TIMEOUT: u32 = 1;

/// Data-type byte prefixed to grid MESG payloads.
pub const MSG_PROTOCOL_VERSION: u8 = 1;
pub const MSG_PEER_REPLY: u8 = 2;

/// Version handshake exchanged with the grid after REDY.
#[derive(Clone, PartialEq, Message)]
pub struct ProtocolVersion {
    #[prost(uint32, tag = "1")]
    pub magic: u32,
    #[prost(uint32, tag = "2")]
    pub major: u32,
    #[prost(uint32, tag = "3")]
    pub minor: u32,
}

/// Tunnel request presented to a forwarding server.
#[derive(Clone, PartialEq, Message)]
pub struct ForwardRemote {
    #[prost(uint32, tag = "1")]
    pub magic: u32,
    #[prost(uint32, tag = "2")]
    pub protocol_major: u32,
    #[prost(uint32, tag = "3")]
    pub protocol_minor: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub tunnel_id: Vec<u8>,
    #[prost(string, tag = "5")]
    pub signature: String,
}

/// Forwarding server's acceptance of a tunnel request.
#[derive(Clone, PartialEq, Message)]
pub struct ForwardReply {
    #[prost(string, tag = "1")]
    pub signature: String,
}

/// Forwarding server's rejection of a tunnel request.
#[derive(Clone, PartialEq, Message)]
pub struct ForwardError {
    #[prost(uint32, tag = "1")]
    pub code: u32,
}

/// Grid response to a peer lookup. The `id` field carries the registry uid
/// the request was issued under; dispatching the reply belongs to the upper
/// layer.
#[derive(Clone, PartialEq, Message)]
pub struct PeerReply {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(uint32, tag = "2")]
    pub result: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub tunnel_id: Vec<u8>,
}
