//! Nonce construction. Every box uses a 24-byte nonce assembled from an
//! ASCII prefix both sides know and a tail that travels on the wire: a
//! big-endian counter for short-term nonces, 16 echoed or random bytes for
//! long-term ones.

use byteorder::{BigEndian, ByteOrder};
use ion::crypto;

pub const NONCE_SIZE: usize = crypto::NONCE_SIZE;
pub const SHORT_PREFIX_SIZE: usize = 16;
pub const LONG_PREFIX_SIZE: usize = 8;

pub const CLIENT_HELLO: &[u8; SHORT_PREFIX_SIZE] = b"CurveCP-client-H";
pub const CLIENT_INITIATE: &[u8; SHORT_PREFIX_SIZE] = b"CurveCP-client-I";
pub const CLIENT_MESSAGE: &[u8; SHORT_PREFIX_SIZE] = b"CurveCP-client-M";
pub const SERVER_READY: &[u8; SHORT_PREFIX_SIZE] = b"CurveCP-server-R";
pub const SERVER_MESSAGE: &[u8; SHORT_PREFIX_SIZE] = b"CurveCP-server-M";

pub const COOKIE_PREFIX: &[u8; LONG_PREFIX_SIZE] = b"CurveCPK";
pub const VOUCH_PREFIX: &[u8; LONG_PREFIX_SIZE] = b"CurveCPV";

/// Builds a short-term nonce from a prefix and a counter value. The last 8
/// bytes are what goes on the wire.
#[inline]
pub fn short_term(prefix: &[u8; SHORT_PREFIX_SIZE], counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..SHORT_PREFIX_SIZE].copy_from_slice(prefix);
    BigEndian::write_u64(&mut nonce[SHORT_PREFIX_SIZE..], counter);
    nonce
}

/// Extracts the wire tail of a short-term nonce.
#[inline]
pub fn short_tail(nonce: &[u8; NONCE_SIZE]) -> &[u8] {
    &nonce[SHORT_PREFIX_SIZE..]
}

/// Builds a long-term nonce from a prefix and a 16-byte tail echoed from
/// the peer.
#[inline]
pub fn long_term(prefix: &[u8; LONG_PREFIX_SIZE], tail: &[u8]) -> [u8; NONCE_SIZE] {
    assert_eq!(tail.len(), NONCE_SIZE - LONG_PREFIX_SIZE);

    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..LONG_PREFIX_SIZE].copy_from_slice(prefix);
    nonce[LONG_PREFIX_SIZE..].copy_from_slice(tail);
    nonce
}

/// Builds a long-term nonce with a fresh random tail.
#[inline]
pub fn random_long_term(prefix: &[u8; LONG_PREFIX_SIZE]) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..LONG_PREFIX_SIZE].copy_from_slice(prefix);
    crypto::random_bytes(&mut nonce[LONG_PREFIX_SIZE..]);
    nonce
}

/// Extracts the wire tail of a long-term nonce.
#[inline]
pub fn long_tail(nonce: &[u8; NONCE_SIZE]) -> &[u8] {
    &nonce[LONG_PREFIX_SIZE..]
}
