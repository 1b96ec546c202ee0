//! The authenticated-encryption envelope. Sealing and opening happen in
//! place inside the packet buffer: the NaCl padding bytes deliberately fall
//! over the region that on the wire carries the header and nonce tail,
//! which are written after sealing (and zeroed before opening). The MAC
//! only verifies if this layout is preserved exactly.

use crate::error::{ErrorKind, Fault};
use crate::frame;
use crate::nonce;
use byteorder::{BigEndian, ByteOrder};
use ion::crypto;

/// Start of the zero pad in a MESG-family frame: the magic, reserved,
/// command and nonce-tail bytes form exactly one outer pad.
pub const PAD_OFF: usize = frame::LENGTH_SIZE;
/// Start of the ciphertext in a MESG-family frame.
pub const CIPHER_OFF: usize = frame::PAYLOAD_OFF + frame::SHORT_TAIL_SIZE;
/// Start of the plaintext after an in-place open.
pub const PLAIN_OFF: usize = PAD_OFF + crypto::ZERO_PAD;
/// Offset of the payload size field inside the opened plaintext.
pub const DATA_SIZE_OFF: usize = PLAIN_OFF;
/// Offset of the payload data.
pub const DATA_OFF: usize = DATA_SIZE_OFF + 2;
/// Frame bytes beyond the payload data.
pub const MESG_OVERHEAD: usize = DATA_OFF;

/// Offset of the nonce tail in a MESG-family frame.
const TAIL_OFF: usize = frame::PAYLOAD_OFF;

/// Opens a complete MESG-family frame in place under the precomputed
/// shared secret. Returns the plaintext length, which starts at
/// `PLAIN_OFF`.
pub fn open_mesg(
    packet: &mut [u8],
    prefix: &[u8; nonce::SHORT_PREFIX_SIZE],
    shared: &[u8; crypto::KEY_SIZE],
) -> Result<usize, Fault> {
    if packet.len() < CIPHER_OFF + crypto::MAC_SIZE {
        return Err(Fault::new(ErrorKind::Protocol));
    }

    let counter = BigEndian::read_u64(&packet[TAIL_OFF..TAIL_OFF + frame::SHORT_TAIL_SIZE]);
    let nonce = nonce::short_term(prefix, counter);

    // The pad overwrites header and nonce, both already consumed
    for byte in &mut packet[PAD_OFF..CIPHER_OFF] {
        *byte = 0;
    }

    let end = packet.len();
    if !crypto::open_afternm_inplace(&mut packet[PAD_OFF..end], &nonce, shared) {
        return Err(Fault::new(ErrorKind::Decryption));
    }

    Ok(end - CIPHER_OFF - crypto::MAC_SIZE)
}

/// Seals a MESG frame in place around `data_len` payload bytes already
/// sitting at `DATA_OFF`, then writes the header and nonce tail over the
/// pad. Returns the full frame length.
pub fn seal_mesg(
    packet: &mut [u8],
    data_len: usize,
    prefix: &[u8; nonce::SHORT_PREFIX_SIZE],
    counter: u64,
    shared: &[u8; crypto::KEY_SIZE],
) -> Result<usize, Fault> {
    let frame_len = MESG_OVERHEAD + data_len;

    BigEndian::write_u16(&mut packet[DATA_SIZE_OFF..DATA_OFF], data_len as u16);

    let nonce = nonce::short_term(prefix, counter);
    seal_afternm_at(packet, PAD_OFF, data_len + 2, &nonce, shared)?;

    frame::build_header(packet, frame::CMD_MESG, frame_len);
    packet[TAIL_OFF..CIPHER_OFF].copy_from_slice(nonce::short_tail(&nonce));

    Ok(frame_len)
}

/// Zeroes the 32-byte pad at `pad_off` and seals the following
/// `plain_len` bytes in place under the precomputed shared secret.
pub fn seal_afternm_at(
    buf: &mut [u8],
    pad_off: usize,
    plain_len: usize,
    nonce: &[u8; nonce::NONCE_SIZE],
    shared: &[u8; crypto::KEY_SIZE],
) -> Result<(), Fault> {
    let end = pad_off + crypto::ZERO_PAD + plain_len;

    for byte in &mut buf[pad_off..pad_off + crypto::ZERO_PAD] {
        *byte = 0;
    }

    if !crypto::seal_afternm_inplace(&mut buf[pad_off..end], nonce, shared) {
        return Err(Fault::new(ErrorKind::CryptoCore));
    }

    Ok(())
}

/// Zeroes the 16-byte outer pad before `cipher_off` and opens the
/// `cipher_len` ciphertext in place under long-term keys.
pub fn open_box_at(
    buf: &mut [u8],
    cipher_off: usize,
    cipher_len: usize,
    nonce: &[u8; nonce::NONCE_SIZE],
    public: &[u8; crypto::KEY_SIZE],
    secret: &[u8; crypto::KEY_SIZE],
) -> Result<(), Fault> {
    let start = cipher_off - crypto::BOX_ZERO_PAD;
    let end = cipher_off + cipher_len;

    for byte in &mut buf[start..cipher_off] {
        *byte = 0;
    }

    if !crypto::box_open_inplace(&mut buf[start..end], nonce, public, secret) {
        return Err(Fault::new(ErrorKind::Decryption));
    }

    Ok(())
}
