//! Packet framing. Every frame on the wire is a 2-byte big-endian length
//! followed by the body; handshake and MESG bodies start with an 8-byte
//! header (magic, reserved, 4-byte command tag), pre-handshake data frames
//! carry a single message-type byte instead.

use crate::error::{ErrorKind, Fault, NetError, NetResult};
use byteorder::{BigEndian, ByteOrder};
use ion::crypto;
use std::io;
use std::io::Write;
use std::thread;

pub const LENGTH_SIZE: usize = 2;
pub const HEADER_SIZE: usize = 8;
/// Offset of the first payload byte in a full frame buffer.
pub const PAYLOAD_OFF: usize = LENGTH_SIZE + HEADER_SIZE;

pub const PACKET_MAGIC: u16 = 0xf09d;

pub const CMD_TELL: &[u8; 4] = b"TELL";
pub const CMD_WELC: &[u8; 4] = b"WELC";
pub const CMD_HELO: &[u8; 4] = b"HELO";
pub const CMD_COOK: &[u8; 4] = b"COOK";
pub const CMD_VOCH: &[u8; 4] = b"VOCH";
pub const CMD_REDY: &[u8; 4] = b"REDY";
pub const CMD_MESG: &[u8; 4] = b"MESG";

pub const KEY_SIZE: usize = crypto::KEY_SIZE;
pub const COOKIE_SIZE: usize = 96;
/// Wire size of a short-term (counter) nonce tail.
pub const SHORT_TAIL_SIZE: usize = 8;
/// Wire size of a long-term (echoed or random) nonce tail.
pub const LONG_TAIL_SIZE: usize = 16;

pub const PACKET_TELL_SIZE: usize = PAYLOAD_OFF;
pub const PACKET_WELC_SIZE: usize = PAYLOAD_OFF + KEY_SIZE;

/// HELO carries a box of 64 zeros proving possession of the ephemeral key.
pub const HELO_PLAIN_SIZE: usize = 64;
pub const HELO_CIPHERTEXT_SIZE: usize = HELO_PLAIN_SIZE + crypto::MAC_SIZE;
pub const PACKET_HELO_SIZE: usize = PAYLOAD_OFF + KEY_SIZE + SHORT_TAIL_SIZE + HELO_CIPHERTEXT_SIZE;

pub const COOK_CIPHERTEXT_SIZE: usize = KEY_SIZE + COOKIE_SIZE + crypto::MAC_SIZE;
pub const PACKET_COOK_SIZE: usize = PAYLOAD_OFF + LONG_TAIL_SIZE + COOK_CIPHERTEXT_SIZE;

/// Inner vouch: the ephemeral public key boxed under the long-term keys.
pub const VOUCH_INNER_BOX_SIZE: usize = KEY_SIZE + crypto::MAC_SIZE;
/// Outer vouch plaintext without the certificate block: long-term public
/// key, long-term nonce tail, inner box, have-certificate flag.
pub const VOUCH_BASE_PLAIN_SIZE: usize = KEY_SIZE + LONG_TAIL_SIZE + VOUCH_INNER_BOX_SIZE + 1;

/// Certificate block appended in grid mode: length-prefixed label and a
/// length-prefixed all-zero key.
pub const CERT_LABEL: &[u8; 11] = b"certificate";
pub const CERT_KEY_SIZE: usize = 32;
pub const CERT_BLOCK_SIZE: usize = 1 + CERT_LABEL.len() + 1 + CERT_KEY_SIZE;

pub const PACKET_VOCH_BASE_SIZE: usize =
    PAYLOAD_OFF + SHORT_TAIL_SIZE + COOKIE_SIZE + VOUCH_BASE_PLAIN_SIZE + crypto::MAC_SIZE;
pub const PACKET_VOCH_MAX_SIZE: usize = PACKET_VOCH_BASE_SIZE + CERT_BLOCK_SIZE;

/// Smallest receive buffer that can carry every handshake packet.
pub const MIN_BUFFER_SIZE: usize = PACKET_VOCH_MAX_SIZE;

/// Writes the length prefix and packet header for a frame of `frame_size`
/// total bytes (including the prefix itself).
#[inline]
pub fn build_header(buf: &mut [u8], command: &[u8; 4], frame_size: usize) {
    BigEndian::write_u16(&mut buf[0..2], (frame_size - LENGTH_SIZE) as u16);
    BigEndian::write_u16(&mut buf[2..4], PACKET_MAGIC);
    BigEndian::write_u16(&mut buf[4..6], 0);
    buf[6..PAYLOAD_OFF].copy_from_slice(command);
}

/// Validates the header of a complete frame and returns its command tag.
#[inline]
pub fn parse_command(packet: &[u8]) -> NetResult<[u8; 4]> {
    if packet.len() < PAYLOAD_OFF {
        return Err(NetError::fatal(ErrorKind::Protocol));
    }

    if BigEndian::read_u16(&packet[2..4]) != PACKET_MAGIC {
        return Err(NetError::fatal(ErrorKind::Protocol));
    }

    let mut command = [0u8; 4];
    command.copy_from_slice(&packet[6..PAYLOAD_OFF]);
    Ok(command)
}

/// Offset of the message-type byte in a pre-handshake data frame.
pub const DATA_TYPE_OFF: usize = LENGTH_SIZE;
/// Offset of the protobuf payload in a pre-handshake data frame.
pub const DATA_PAYLOAD_OFF: usize = DATA_TYPE_OFF + 1;

/// Writes a pre-handshake data frame around an already-encoded protobuf
/// payload of `payload_size` bytes sitting at `DATA_PAYLOAD_OFF`. Returns
/// the full frame size.
#[inline]
pub fn build_data_frame(buf: &mut [u8], msg_type: u8, payload_size: usize) -> usize {
    BigEndian::write_u16(&mut buf[0..2], (payload_size + 1) as u16);
    buf[DATA_TYPE_OFF] = msg_type;
    DATA_PAYLOAD_OFF + payload_size
}

/// Transmits a complete frame. Partial writes are retried until the frame
/// is fully on the wire or the socket faults; `WouldBlock` yields the
/// thread and retries.
pub fn send_frame<W: Write>(stream: &mut W, frame: &[u8]) -> NetResult<()> {
    let mut written = 0;

    while written < frame.len() {
        match stream.write(&frame[written..]) {
            Ok(0) => return Err(NetError::Fatal(Fault::new(ErrorKind::Socket))),
            Ok(count) => written += count,
            Err(err) => match err.kind() {
                io::ErrorKind::WouldBlock => thread::yield_now(),
                io::ErrorKind::Interrupted => (),
                _ => return Err(err.into()),
            },
        }
    }

    Ok(())
}
