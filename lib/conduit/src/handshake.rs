//! The CurveCP-style handshake engine. Purely reactive: each complete
//! inbound packet produces at most one outbound packet or a state
//! transition. Grid connections finish with a protocol version exchange on
//! top of REDY; peer connections are done at REDY.

use crate::connection::{Link, LinkEvent, Mode};
use crate::envelope;
use crate::error::{ErrorKind, NetError, NetResult};
use crate::frame;
use crate::nonce;
use crate::proto;
use crate::proto::ProtocolVersion;
use crate::{PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR};
use byteorder::{BigEndian, ByteOrder};
use ion::choose;
use ion::crypto;
use ion::identity::{ClientKeys, SecretKey};
use ion::logging;
use prost::Message;
use std::io::Write;

/// Where the connection stands in the pre-handshake and handshake flow. A
/// packet arriving outside its expected phase indicates corruption (the
/// server never retransmits).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Phase {
    Idle,
    Forwarding,
    AwaitWelcome,
    AwaitCookie,
    AwaitReady,
    AwaitVersion,
    Ready,
}

/// Per-connection cryptographic state. Ephemeral material is wiped on drop
/// and on explicit teardown.
pub struct Session {
    pub(crate) client_public: [u8; frame::KEY_SIZE],
    pub(crate) client_secret: SecretKey,
    pub(crate) temp_public: [u8; frame::KEY_SIZE],
    pub(crate) temp_secret: SecretKey,
    pub(crate) server_public: [u8; frame::KEY_SIZE],
    pub(crate) cookie: [u8; frame::COOKIE_SIZE],
    pub(crate) shared: SecretKey,
    nonce: u64,
}

impl Session {
    pub(crate) fn new(keys: ClientKeys) -> Session {
        Session {
            client_public: keys.public,
            client_secret: keys.secret,
            temp_public: [0u8; frame::KEY_SIZE],
            temp_secret: SecretKey::new([0u8; frame::KEY_SIZE]),
            server_public: [0u8; frame::KEY_SIZE],
            cookie: [0u8; frame::COOKIE_SIZE],
            shared: SecretKey::new([0u8; frame::KEY_SIZE]),
            nonce: 0,
        }
    }

    /// Reads and post-increments the short-term nonce counter. Strictly
    /// monotonic for the lifetime of the connection.
    #[inline]
    pub(crate) fn next_nonce(&mut self) -> u64 {
        let nonce = self.nonce;
        self.nonce += 1;
        nonce
    }

    #[cfg(test)]
    pub(crate) fn nonce_value(&self) -> u64 {
        self.nonce
    }

    /// Wipes every piece of key material held by the session.
    pub(crate) fn wipe(&mut self) {
        crypto::memzero(&mut *self.client_secret);
        crypto::memzero(&mut *self.temp_secret);
        crypto::memzero(&mut *self.shared);
        crypto::memzero(&mut self.temp_public);
        crypto::memzero(&mut self.cookie);
    }

    #[cfg(test)]
    pub(crate) fn is_wiped(&self) -> bool {
        *self.client_secret == [0u8; frame::KEY_SIZE]
            && *self.temp_secret == [0u8; frame::KEY_SIZE]
            && *self.shared == [0u8; frame::KEY_SIZE]
    }
}

// Handshake packet offsets inside a full frame buffer.
const WELC_KEY_OFF: usize = frame::PAYLOAD_OFF;

const HELO_KEY_OFF: usize = frame::PAYLOAD_OFF;
const HELO_TAIL_OFF: usize = HELO_KEY_OFF + frame::KEY_SIZE;
const HELO_CIPHER_OFF: usize = HELO_TAIL_OFF + frame::SHORT_TAIL_SIZE;

const COOK_TAIL_OFF: usize = frame::PAYLOAD_OFF;
const COOK_CIPHER_OFF: usize = COOK_TAIL_OFF + frame::LONG_TAIL_SIZE;
const COOK_KEY_OFF: usize = COOK_CIPHER_OFF + crypto::MAC_SIZE;
const COOK_COOKIE_OFF: usize = COOK_KEY_OFF + frame::KEY_SIZE;

const VOCH_TAIL_OFF: usize = frame::PAYLOAD_OFF;
const VOCH_COOKIE_OFF: usize = VOCH_TAIL_OFF + frame::SHORT_TAIL_SIZE;
const VOCH_CIPHER_OFF: usize = VOCH_COOKIE_OFF + frame::COOKIE_SIZE;
const VOCH_PAD_OFF: usize = VOCH_CIPHER_OFF - crypto::BOX_ZERO_PAD;
const VOCH_PLAIN_OFF: usize = VOCH_PAD_OFF + crypto::ZERO_PAD;
const VOCH_PUB_OFF: usize = VOCH_PLAIN_OFF;
const VOCH_LTAIL_OFF: usize = VOCH_PUB_OFF + frame::KEY_SIZE;
const VOCH_INNER_OFF: usize = VOCH_LTAIL_OFF + frame::LONG_TAIL_SIZE;
const VOCH_FLAG_OFF: usize = VOCH_INNER_OFF + frame::VOUCH_INNER_BOX_SIZE;
const VOCH_CERT_OFF: usize = VOCH_FLAG_OFF + 1;

impl Link {
    /// Dispatches one complete handshake or MESG packet.
    pub(crate) fn handle_packet<S: Write>(&mut self, stream: &mut S) -> NetResult<LinkEvent> {
        let command = frame::parse_command(self.recv.packet())?;

        if command == *frame::CMD_WELC {
            self.handle_welcome(stream)
        } else if command == *frame::CMD_COOK {
            self.handle_cookie(stream)
        } else if command == *frame::CMD_REDY {
            self.handle_ready(stream)
        } else if command == *frame::CMD_MESG {
            self.handle_message()
        } else {
            logging::debug!(self.log, "unknown packet received, ignoring";
                            "context" => "handshake",
                            "command" => ?command);
            Ok(LinkEvent::None)
        }
    }

    fn handle_welcome<S: Write>(&mut self, stream: &mut S) -> NetResult<LinkEvent> {
        if self.phase != Phase::AwaitWelcome {
            return Err(NetError::fatal(ErrorKind::Protocol));
        }

        {
            let packet = self.recv.packet();
            if packet.len() != frame::PACKET_WELC_SIZE {
                return Err(NetError::fatal(ErrorKind::Protocol));
            }

            self.session
                .server_public
                .copy_from_slice(&packet[WELC_KEY_OFF..WELC_KEY_OFF + frame::KEY_SIZE]);
        }

        let (temp_public, temp_secret) = crypto::box_keypair();
        self.session.temp_public = temp_public;
        self.session.temp_secret = SecretKey::new(temp_secret);

        logging::debug!(self.log, "server key received, ephemeral pair created";
                        "context" => "handshake");

        let mut buf = self.pool.get();
        let result = build_hello(&mut buf, &mut self.session)
            .and_then(|len| frame::send_frame(stream, &buf[..len]));
        self.pool.put(buf);
        result?;

        self.phase = Phase::AwaitCookie;
        Ok(LinkEvent::None)
    }

    fn handle_cookie<S: Write>(&mut self, stream: &mut S) -> NetResult<LinkEvent> {
        if self.phase != Phase::AwaitCookie {
            return Err(NetError::fatal(ErrorKind::Protocol));
        }

        {
            let Link { recv, session, .. } = self;
            let packet = recv.packet();
            if packet.len() != frame::PACKET_COOK_SIZE {
                return Err(NetError::fatal(ErrorKind::Protocol));
            }

            let mut tail = [0u8; frame::LONG_TAIL_SIZE];
            tail.copy_from_slice(&packet[COOK_TAIL_OFF..COOK_CIPHER_OFF]);
            let cook_nonce = nonce::long_term(nonce::COOKIE_PREFIX, &tail);

            envelope::open_box_at(
                packet,
                COOK_CIPHER_OFF,
                frame::COOK_CIPHERTEXT_SIZE,
                &cook_nonce,
                &session.server_public,
                &session.temp_secret,
            )
            .map_err(NetError::Fatal)?;

            let mut server_temp = [0u8; frame::KEY_SIZE];
            server_temp.copy_from_slice(&packet[COOK_KEY_OFF..COOK_COOKIE_OFF]);
            session
                .cookie
                .copy_from_slice(&packet[COOK_COOKIE_OFF..frame::PACKET_COOK_SIZE]);

            let mut shared = [0u8; frame::KEY_SIZE];
            if !crypto::box_beforenm(&mut shared, &server_temp, &session.temp_secret) {
                return Err(NetError::fatal(ErrorKind::CryptoCore));
            }
            session.shared = SecretKey::new(shared);
        }

        logging::debug!(self.log, "cookie received, shared secret precomputed";
                        "context" => "handshake");

        let grid = self.mode == Mode::Grid;
        let mut buf = self.pool.get();
        let result = build_vouch(&mut buf, &mut self.session, grid)
            .and_then(|len| frame::send_frame(stream, &buf[..len]));
        self.pool.put(buf);
        result?;

        self.phase = Phase::AwaitReady;
        Ok(LinkEvent::None)
    }

    fn handle_ready<S: Write>(&mut self, stream: &mut S) -> NetResult<LinkEvent> {
        if self.phase != Phase::AwaitReady {
            return Err(NetError::fatal(ErrorKind::Protocol));
        }

        let payload_len = {
            let Link { recv, session, .. } = self;
            envelope::open_mesg(recv.packet(), nonce::SERVER_READY, &session.shared)
                .map_err(NetError::Fatal)?
        };

        // Some servers attach an opaque certificate here; accepted and
        // ignored.
        logging::trace!(self.log, "server ready";
                        "context" => "handshake",
                        "payload_size" => payload_len);

        if self.mode == Mode::Peer {
            self.phase = Phase::Ready;
            return Ok(LinkEvent::Connected);
        }

        let version = ProtocolVersion {
            magic: proto::PROTOCOL_VERSION_MAGIC,
            major: PROTOCOL_VERSION_MAJOR,
            minor: PROTOCOL_VERSION_MINOR,
        };
        self.send_mesg(stream, proto::MSG_PROTOCOL_VERSION, &version)?;

        self.phase = Phase::AwaitVersion;
        Ok(LinkEvent::None)
    }

    fn handle_message(&mut self) -> NetResult<LinkEvent> {
        if self.phase != Phase::AwaitVersion && self.phase != Phase::Ready {
            return Err(NetError::fatal(ErrorKind::Protocol));
        }

        let data_size = {
            let Link { recv, session, .. } = self;
            let packet = recv.packet();
            let payload_len =
                envelope::open_mesg(packet, nonce::SERVER_MESSAGE, &session.shared)
                    .map_err(NetError::Fatal)?;

            let data_size =
                BigEndian::read_u16(&packet[envelope::DATA_SIZE_OFF..envelope::DATA_OFF]) as usize;

            if data_size == 0 || data_size + 2 > payload_len {
                return Err(NetError::fatal(ErrorKind::Protocol));
            }

            data_size
        };

        if self.phase == Phase::AwaitVersion {
            return self.finish_version_exchange(data_size);
        }

        let packet = self.recv.packet();
        let data = packet[envelope::DATA_OFF..envelope::DATA_OFF + data_size].to_vec();

        logging::trace!(self.log, "application data received";
                        "context" => "mesg",
                        "size" => data_size);

        Ok(LinkEvent::Data(data))
    }

    fn finish_version_exchange(&mut self, data_size: usize) -> NetResult<LinkEvent> {
        let packet = self.recv.packet();
        let data = &packet[envelope::DATA_OFF..envelope::DATA_OFF + data_size];

        if data[0] != proto::MSG_PROTOCOL_VERSION {
            return Err(NetError::fatal(ErrorKind::Protocol));
        }

        let version = match ProtocolVersion::decode(&data[1..]) {
            Ok(version) => version,
            Err(_) => return Err(NetError::fatal(ErrorKind::Protocol)),
        };

        if version.magic != proto::PROTOCOL_VERSION_MAGIC {
            logging::warn!(self.log, "incorrect protocol version magic";
                           "context" => "handshake",
                           "magic" => version.magic);
            return Err(NetError::fatal(ErrorKind::Protocol));
        }

        if version.major != PROTOCOL_VERSION_MAJOR || version.minor != PROTOCOL_VERSION_MINOR {
            logging::warn!(self.log, "unsupported server protocol version";
                           "context" => "handshake",
                           "major" => version.major,
                           "minor" => version.minor);
            return Err(NetError::fatal(ErrorKind::Protocol));
        }

        logging::debug!(self.log, "protocol version agreed";
                        "context" => "handshake",
                        "major" => version.major,
                        "minor" => version.minor);

        self.phase = Phase::Ready;
        Ok(LinkEvent::Connected)
    }

    /// Packs a protobuf message behind its data-type byte, seals it into a
    /// MESG frame and transmits it.
    pub(crate) fn send_mesg<S: Write, M: Message>(
        &mut self,
        stream: &mut S,
        data_type: u8,
        message: &M,
    ) -> NetResult<()> {
        let data_len = message.encoded_len() + 1;
        let frame_len = envelope::MESG_OVERHEAD + data_len;

        if frame_len > self.buffer_size {
            logging::warn!(self.log, "outgoing packet exceeds buffer";
                           "context" => "mesg",
                           "packet_size" => frame_len,
                           "buffer_size" => self.buffer_size);
            return Err(NetError::fatal(ErrorKind::BufferExceeded));
        }

        let mut buf = self.pool.get();
        buf[envelope::DATA_OFF] = data_type;
        {
            let mut target = &mut buf[envelope::DATA_OFF + 1..envelope::DATA_OFF + data_len];
            message
                .encode(&mut target)
                .expect("Sized buffer must fit the packed message");
        }

        let counter = self.session.next_nonce();
        let result = envelope::seal_mesg(
            &mut buf,
            data_len,
            nonce::CLIENT_MESSAGE,
            counter,
            &self.session.shared,
        )
        .map_err(NetError::Fatal)
        .and_then(|len| frame::send_frame(stream, &buf[..len]));

        self.pool.put(buf);
        result
    }
}

/// Builds the HELO packet: the ephemeral public key plus a box of 64 zeros
/// proving possession of its secret half. The box is sealed into place so
/// its pad falls over the key and nonce fields, which are written after.
fn build_hello(buf: &mut [u8], session: &mut Session) -> NetResult<usize> {
    let hello_nonce = nonce::short_term(nonce::CLIENT_HELLO, session.next_nonce());
    let zeros = [0u8; crypto::ZERO_PAD + frame::HELO_PLAIN_SIZE];

    if !crypto::box_seal(
        &mut buf[HELO_CIPHER_OFF - crypto::BOX_ZERO_PAD..frame::PACKET_HELO_SIZE],
        &zeros,
        &hello_nonce,
        &session.server_public,
        &session.temp_secret,
    ) {
        return Err(NetError::fatal(ErrorKind::CryptoCore));
    }

    frame::build_header(buf, frame::CMD_HELO, frame::PACKET_HELO_SIZE);
    buf[HELO_KEY_OFF..HELO_TAIL_OFF].copy_from_slice(&session.temp_public);
    buf[HELO_TAIL_OFF..HELO_CIPHER_OFF].copy_from_slice(nonce::short_tail(&hello_nonce));

    Ok(frame::PACKET_HELO_SIZE)
}

/// Builds the VOCH packet. The outer plaintext carries the long-term
/// public key, the inner vouch nonce tail, the inner box, and in grid mode
/// the certificate key-value block; the whole thing is sealed under the
/// precomputed shared secret and the cookie is echoed in front of it.
fn build_vouch(buf: &mut [u8], session: &mut Session, grid: bool) -> NetResult<usize> {
    let cert_size = choose!(grid => frame::CERT_BLOCK_SIZE, 0);
    let plain_len = frame::VOUCH_BASE_PLAIN_SIZE + cert_size;
    let frame_len = frame::PACKET_VOCH_BASE_SIZE + cert_size;

    // Inner box: the ephemeral public key under the long-term keys
    let mut inner = [0u8; crypto::ZERO_PAD + frame::KEY_SIZE];
    inner[crypto::ZERO_PAD..].copy_from_slice(&session.temp_public);

    let vouch_nonce = nonce::random_long_term(nonce::VOUCH_PREFIX);
    if !crypto::box_seal(
        &mut buf[VOCH_INNER_OFF - crypto::BOX_ZERO_PAD..VOCH_FLAG_OFF],
        &inner,
        &vouch_nonce,
        &session.server_public,
        &session.client_secret,
    ) {
        return Err(NetError::fatal(ErrorKind::CryptoCore));
    }

    buf[VOCH_PUB_OFF..VOCH_LTAIL_OFF].copy_from_slice(&session.client_public);
    buf[VOCH_LTAIL_OFF..VOCH_INNER_OFF].copy_from_slice(nonce::long_tail(&vouch_nonce));
    buf[VOCH_FLAG_OFF] = grid as u8;

    if grid {
        // An empty license key is reported as all zeroes
        buf[VOCH_CERT_OFF] = frame::CERT_LABEL.len() as u8;
        buf[VOCH_CERT_OFF + 1..VOCH_CERT_OFF + 1 + frame::CERT_LABEL.len()]
            .copy_from_slice(frame::CERT_LABEL);
        buf[VOCH_CERT_OFF + 12] = frame::CERT_KEY_SIZE as u8;
        for byte in &mut buf[VOCH_CERT_OFF + 13..VOCH_CERT_OFF + frame::CERT_BLOCK_SIZE] {
            *byte = 0;
        }
    }

    let voch_nonce = nonce::short_term(nonce::CLIENT_INITIATE, session.next_nonce());
    envelope::seal_afternm_at(buf, VOCH_PAD_OFF, plain_len, &voch_nonce, &session.shared)
        .map_err(NetError::Fatal)?;

    frame::build_header(buf, frame::CMD_VOCH, frame_len);
    buf[VOCH_TAIL_OFF..VOCH_COOKIE_OFF].copy_from_slice(nonce::short_tail(&voch_nonce));
    buf[VOCH_COOKIE_OFF..VOCH_CIPHER_OFF].copy_from_slice(&session.cookie);

    Ok(frame_len)
}
