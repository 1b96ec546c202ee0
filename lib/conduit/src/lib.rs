//! Client library for a proprietary overlay/grid network. A process
//! authenticates to a grid server with its long-term Curve25519 keypair,
//! looks up remote peers, and opens end-to-end encrypted tunnels over
//! which application protobuf messages are exchanged. Transport is TCP;
//! the framed crypto follows the CurveCP design.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

/// Protocol version announced to (and required from) the grid.
pub const PROTOCOL_VERSION_MAJOR: u32 = 1;
pub const PROTOCOL_VERSION_MINOR: u32 = 0;

pub mod buffer;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod mainloop;
pub mod nonce;
pub mod proto;
pub mod registry;

pub(crate) mod handshake;
pub(crate) mod tunnel;

#[cfg(test)]
pub(crate) mod testgrid;

pub use crate::connection::{Connection, ConnectionId, Endpoint, Mode, Status};
pub use crate::error::{ConnResult, ErrorKind, Fault};
pub use crate::mainloop::{init, init_with_logger, shutdown, MainLoop};

pub use ion::encoding::{bin_to_hex, hex_to_bin};
pub use ion::identity::{
    create_private_key, derive_public_key, ClientIdentity, ClientKeys, SecretKey,
};
