//! Test support: an in-memory stream for driving the link state machine,
//! the server side of the handshake built directly on the crypto
//! primitives, and a scripted TCP server for end-to-end scenarios.

use crate::envelope;
use crate::frame;
use crate::nonce;
use crate::proto;
use crate::proto::{ForwardError, ForwardRemote, ForwardReply, ProtocolVersion};
use byteorder::{BigEndian, ByteOrder};
use ion::crypto;
use prost::Message;
use std::io;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::thread::JoinHandle;

/// A non-blocking in-memory stream: reads drain previously fed bytes and
/// then report WouldBlock, writes accumulate.
pub struct TestStream {
    input: Vec<u8>,
    cursor: usize,
    output: Vec<u8>,
}

impl TestStream {
    pub fn new() -> TestStream {
        TestStream {
            input: Vec::new(),
            cursor: 0,
            output: Vec::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.input.extend_from_slice(bytes);
    }

    /// Splits everything written so far into wire frames and clears the
    /// output.
    pub fn take_frames(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut rest = &self.output[..];

        while rest.len() >= 2 {
            let size = BigEndian::read_u16(&rest[..2]) as usize;
            assert!(rest.len() >= 2 + size, "partial frame in output");
            frames.push(rest[..2 + size].to_vec());
            rest = &rest[2 + size..];
        }

        assert!(rest.is_empty(), "trailing garbage in output");
        self.output.clear();
        frames
    }
}

impl Read for TestStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cursor == self.input.len() {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let count = buf.len().min(self.input.len() - self.cursor);
        buf[..count].copy_from_slice(&self.input[self.cursor..self.cursor + count]);
        self.cursor += count;
        Ok(count)
    }
}

impl Write for TestStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The server half of the handshake, verifying every client packet with
/// independent offset arithmetic.
pub struct ServerSide {
    pub long_public: [u8; 32],
    long_secret: [u8; 32],
    temp_public: [u8; 32],
    temp_secret: [u8; 32],
    pub client_temp: [u8; 32],
    pub client_long: [u8; 32],
    pub shared: [u8; 32],
    pub cookie: [u8; 96],
    nonce: u64,
}

impl ServerSide {
    pub fn new() -> ServerSide {
        let (long_public, long_secret) = crypto::box_keypair();
        let mut cookie = [0u8; 96];
        crypto::random_bytes(&mut cookie);

        ServerSide {
            long_public,
            long_secret,
            temp_public: [0u8; 32],
            temp_secret: [0u8; 32],
            client_temp: [0u8; 32],
            client_long: [0u8; 32],
            shared: [0u8; 32],
            cookie,
            nonce: 0,
        }
    }

    fn next_nonce(&mut self) -> u64 {
        let nonce = self.nonce;
        self.nonce += 1;
        nonce
    }

    pub fn welc_frame(&self) -> Vec<u8> {
        let mut buf = vec![0u8; frame::PACKET_WELC_SIZE];
        frame::build_header(&mut buf, frame::CMD_WELC, frame::PACKET_WELC_SIZE);
        buf[10..42].copy_from_slice(&self.long_public);
        buf
    }

    /// Verifies HELO and learns the client's ephemeral key. Returns the
    /// nonce counter the client used.
    pub fn accept_hello(&mut self, packet: &[u8]) -> u64 {
        assert_eq!(packet.len(), frame::PACKET_HELO_SIZE);
        assert_eq!(&packet[6..10], frame::CMD_HELO);

        self.client_temp.copy_from_slice(&packet[10..42]);
        let counter = BigEndian::read_u64(&packet[42..50]);

        let mut padded = vec![0u8; crypto::BOX_ZERO_PAD];
        padded.extend_from_slice(&packet[50..130]);

        let hello_nonce = nonce::short_term(nonce::CLIENT_HELLO, counter);
        assert!(
            crypto::box_open_inplace(&mut padded, &hello_nonce, &self.client_temp, &self.long_secret),
            "HELO box did not verify"
        );
        assert_eq!(&padded[crypto::ZERO_PAD..], &[0u8; 64][..], "HELO plaintext not zero");

        counter
    }

    pub fn cook_frame(&mut self) -> Vec<u8> {
        let (temp_public, temp_secret) = crypto::box_keypair();
        self.temp_public = temp_public;
        self.temp_secret = temp_secret;

        let mut message = vec![0u8; crypto::ZERO_PAD];
        message.extend_from_slice(&self.temp_public);
        message.extend_from_slice(&self.cookie);

        let mut tail = [0u8; 16];
        crypto::random_bytes(&mut tail);
        let cook_nonce = nonce::long_term(nonce::COOKIE_PREFIX, &tail);

        let mut cipher = vec![0u8; message.len()];
        assert!(crypto::box_seal(
            &mut cipher,
            &message,
            &cook_nonce,
            &self.client_temp,
            &self.long_secret
        ));

        let mut buf = vec![0u8; frame::PACKET_COOK_SIZE];
        frame::build_header(&mut buf, frame::CMD_COOK, frame::PACKET_COOK_SIZE);
        buf[10..26].copy_from_slice(&tail);
        buf[26..].copy_from_slice(&cipher[crypto::BOX_ZERO_PAD..]);

        assert!(crypto::box_beforenm(
            &mut self.shared,
            &self.client_temp,
            &self.temp_secret
        ));

        buf
    }

    /// Verifies VOCH: cookie echo, outer box, inner vouch and the
    /// certificate block. Returns the nonce counter the client used.
    pub fn accept_vouch(&mut self, packet: &[u8], expect_cert: bool) -> u64 {
        assert_eq!(&packet[6..10], frame::CMD_VOCH);
        let counter = BigEndian::read_u64(&packet[10..18]);
        assert_eq!(&packet[18..114], &self.cookie[..], "cookie not echoed verbatim");

        let mut padded = vec![0u8; crypto::BOX_ZERO_PAD];
        padded.extend_from_slice(&packet[114..]);

        let vouch_nonce = nonce::short_term(nonce::CLIENT_INITIATE, counter);
        assert!(
            crypto::open_afternm_inplace(&mut padded, &vouch_nonce, &self.shared),
            "VOCH outer box did not verify"
        );

        let plain = &padded[crypto::ZERO_PAD..];
        self.client_long.copy_from_slice(&plain[..32]);
        let long_tail = &plain[32..48];
        let inner_box = &plain[48..96];
        let flag = plain[96];

        let mut inner_padded = vec![0u8; crypto::BOX_ZERO_PAD];
        inner_padded.extend_from_slice(inner_box);

        let inner_nonce = nonce::long_term(nonce::VOUCH_PREFIX, long_tail);
        assert!(
            crypto::box_open_inplace(
                &mut inner_padded,
                &inner_nonce,
                &self.client_long,
                &self.long_secret
            ),
            "inner vouch did not verify"
        );
        assert_eq!(
            &inner_padded[crypto::ZERO_PAD..],
            &self.client_temp[..],
            "vouched key does not match HELO"
        );

        if expect_cert {
            assert_eq!(flag, 1);
            let cert = &plain[97..];
            assert_eq!(cert.len(), frame::CERT_BLOCK_SIZE);
            assert_eq!(cert[0] as usize, frame::CERT_LABEL.len());
            assert_eq!(&cert[1..12], &frame::CERT_LABEL[..]);
            assert_eq!(cert[12] as usize, frame::CERT_KEY_SIZE);
            assert_eq!(&cert[13..], &[0u8; frame::CERT_KEY_SIZE][..]);
        } else {
            assert_eq!(flag, 0);
            assert_eq!(plain.len(), frame::VOUCH_BASE_PLAIN_SIZE);
        }

        counter
    }

    fn sealed_frame(&mut self, command: &[u8; 4], prefix: &[u8; 16], plain: &[u8]) -> Vec<u8> {
        let frame_len = envelope::PLAIN_OFF + plain.len() + crypto::MAC_SIZE
            - crypto::BOX_ZERO_PAD;
        let mut buf = vec![0u8; frame_len];
        buf[envelope::PLAIN_OFF..].copy_from_slice(plain);

        let counter = self.next_nonce();
        let mesg_nonce = nonce::short_term(prefix, counter);
        envelope::seal_afternm_at(&mut buf, envelope::PAD_OFF, plain.len(), &mesg_nonce, &self.shared)
            .unwrap();

        frame::build_header(&mut buf, command, frame_len);
        buf[10..18].copy_from_slice(nonce::short_tail(&mesg_nonce));
        buf
    }

    pub fn redy_frame(&mut self) -> Vec<u8> {
        self.sealed_frame(frame::CMD_REDY, nonce::SERVER_READY, &[])
    }

    /// Builds a server MESG around `data` (first byte is the data type).
    pub fn mesg_frame(&mut self, data: &[u8]) -> Vec<u8> {
        let mut plain = vec![0u8; 2];
        BigEndian::write_u16(&mut plain, data.len() as u16);
        plain.extend_from_slice(data);
        self.sealed_frame(frame::CMD_MESG, nonce::SERVER_MESSAGE, &plain)
    }

    pub fn version_frame(&mut self, major: u32, minor: u32) -> Vec<u8> {
        let version = ProtocolVersion {
            magic: proto::PROTOCOL_VERSION_MAGIC,
            major,
            minor,
        };

        let mut data = vec![proto::MSG_PROTOCOL_VERSION];
        data.extend_from_slice(&version.encode_to_vec());
        self.mesg_frame(&data)
    }

    /// Opens a client MESG and returns its data (first byte is the data
    /// type).
    pub fn open_client_mesg(&mut self, packet: &[u8]) -> Vec<u8> {
        assert_eq!(&packet[6..10], frame::CMD_MESG);
        let counter = BigEndian::read_u64(&packet[10..18]);

        let mut padded = vec![0u8; crypto::BOX_ZERO_PAD];
        padded.extend_from_slice(&packet[18..]);

        let mesg_nonce = nonce::short_term(nonce::CLIENT_MESSAGE, counter);
        assert!(
            crypto::open_afternm_inplace(&mut padded, &mesg_nonce, &self.shared),
            "client MESG did not verify"
        );

        let plain = &padded[crypto::ZERO_PAD..];
        let size = BigEndian::read_u16(&plain[..2]) as usize;
        plain[2..2 + size].to_vec()
    }
}

fn data_frame(msg_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 2];
    BigEndian::write_u16(&mut buf, (payload.len() + 1) as u16);
    buf.push(msg_type);
    buf.extend_from_slice(payload);
    buf
}

pub fn hold_frame() -> Vec<u8> {
    data_frame(proto::MSG_FORWARD_HOLD, &[])
}

pub fn reply_frame(signature: &str) -> Vec<u8> {
    let reply = ForwardReply {
        signature: signature.to_string(),
    };
    data_frame(proto::MSG_FORWARD_REPLY, &reply.encode_to_vec())
}

pub fn forward_error_frame(code: u32) -> Vec<u8> {
    let error = ForwardError { code };
    data_frame(proto::MSG_FORWARD_ERROR, &error.encode_to_vec())
}

/// What the scripted TCP server should do with its single client.
pub enum Script {
    /// Full grid handshake, version exchange, then echo one application
    /// MESG back.
    GridEcho,
    /// Grid handshake but answer the version exchange with this version.
    GridVersion { major: u32, minor: u32 },
    /// Grid handshake, then a MESG with a corrupted MAC.
    BadMac,
    /// Forwarding server followed by the peer handshake.
    Peer { tunnel: Vec<u8>, hold: bool },
    /// Forwarding server that rejects with the given error code.
    ForwardError { code: u32 },
    /// Forwarding server replying with a broken signature.
    BadSignature,
    /// Announce an impossible frame length after TELL.
    Oversize { announce: u16 },
}

pub struct GridServer {
    pub addr: SocketAddr,
    pub handle: JoinHandle<()>,
}

pub fn spawn(script: Script) -> GridServer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        run_script(stream, script);
    });

    GridServer { addr, handle }
}

fn read_wire_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut prefix = [0u8; 2];
    stream.read_exact(&mut prefix)?;

    let size = BigEndian::read_u16(&prefix) as usize;
    let mut packet = vec![0u8; 2 + size];
    packet[..2].copy_from_slice(&prefix);
    stream.read_exact(&mut packet[2..])?;
    Ok(packet)
}

fn linger(stream: &mut TcpStream) {
    while read_wire_frame(stream).is_ok() {}
}

fn grid_handshake(stream: &mut TcpStream, server: &mut ServerSide) {
    let tell = read_wire_frame(stream).unwrap();
    assert_eq!(&tell[6..10], frame::CMD_TELL);

    stream.write_all(&server.welc_frame()).unwrap();

    let hello = read_wire_frame(stream).unwrap();
    server.accept_hello(&hello);

    let cook = server.cook_frame();
    stream.write_all(&cook).unwrap();

    let vouch = read_wire_frame(stream).unwrap();
    server.accept_vouch(&vouch, true);

    let redy = server.redy_frame();
    stream.write_all(&redy).unwrap();

    let mesg = read_wire_frame(stream).unwrap();
    let data = server.open_client_mesg(&mesg);
    assert_eq!(data[0], proto::MSG_PROTOCOL_VERSION);

    let version = ProtocolVersion::decode(&data[1..]).unwrap();
    assert_eq!(version.magic, proto::PROTOCOL_VERSION_MAGIC);
    assert_eq!((version.major, version.minor), (1, 0));
}

fn run_script(mut stream: TcpStream, script: Script) {
    let mut server = ServerSide::new();

    match script {
        Script::GridEcho => {
            grid_handshake(&mut stream, &mut server);
            stream.write_all(&server.version_frame(1, 0)).unwrap();

            if let Ok(mesg) = read_wire_frame(&mut stream) {
                let data = server.open_client_mesg(&mesg);
                let echo = server.mesg_frame(&data);
                stream.write_all(&echo).unwrap();
            }

            linger(&mut stream);
        }
        Script::GridVersion { major, minor } => {
            grid_handshake(&mut stream, &mut server);
            stream.write_all(&server.version_frame(major, minor)).unwrap();
            linger(&mut stream);
        }
        Script::BadMac => {
            grid_handshake(&mut stream, &mut server);
            stream.write_all(&server.version_frame(1, 0)).unwrap();

            let mut mesg = server.mesg_frame(&[0x7F, 1, 2, 3]);
            let last = mesg.len() - 1;
            mesg[last] ^= 0x01;
            stream.write_all(&mesg).unwrap();

            linger(&mut stream);
        }
        Script::Peer { tunnel, hold } => {
            let fwd = read_wire_frame(&mut stream).unwrap();
            assert_eq!(fwd[frame::DATA_TYPE_OFF], proto::MSG_FORWARD_REMOTE);

            let remote = ForwardRemote::decode(&fwd[frame::DATA_PAYLOAD_OFF..]).unwrap();
            assert_eq!(remote.magic, proto::FORWARD_REMOTE_MAGIC);
            assert_eq!(remote.signature, proto::FORWARD_REMOTE_SIGNATURE);
            assert_eq!(remote.tunnel_id, tunnel);

            if hold {
                stream.write_all(&hold_frame()).unwrap();
            }
            stream
                .write_all(&reply_frame(proto::FORWARD_REMOTE_SIGNATURE))
                .unwrap();

            let tell = read_wire_frame(&mut stream).unwrap();
            assert_eq!(&tell[6..10], frame::CMD_TELL);

            stream.write_all(&server.welc_frame()).unwrap();

            let hello = read_wire_frame(&mut stream).unwrap();
            server.accept_hello(&hello);

            let cook = server.cook_frame();
            stream.write_all(&cook).unwrap();

            let vouch = read_wire_frame(&mut stream).unwrap();
            server.accept_vouch(&vouch, false);

            let redy = server.redy_frame();
            stream.write_all(&redy).unwrap();

            if let Ok(mesg) = read_wire_frame(&mut stream) {
                let data = server.open_client_mesg(&mesg);
                let echo = server.mesg_frame(&data);
                stream.write_all(&echo).unwrap();
            }

            linger(&mut stream);
        }
        Script::ForwardError { code } => {
            let fwd = read_wire_frame(&mut stream).unwrap();
            assert_eq!(fwd[frame::DATA_TYPE_OFF], proto::MSG_FORWARD_REMOTE);

            stream.write_all(&forward_error_frame(code)).unwrap();
            linger(&mut stream);
        }
        Script::BadSignature => {
            let fwd = read_wire_frame(&mut stream).unwrap();
            assert_eq!(fwd[frame::DATA_TYPE_OFF], proto::MSG_FORWARD_REMOTE);

            stream.write_all(&reply_frame("not-the-signature")).unwrap();
            linger(&mut stream);
        }
        Script::Oversize { announce } => {
            let tell = read_wire_frame(&mut stream).unwrap();
            assert_eq!(&tell[6..10], frame::CMD_TELL);

            let mut prefix = [0u8; 2];
            BigEndian::write_u16(&mut prefix, announce);
            stream.write_all(&prefix).unwrap();
            linger(&mut stream);
        }
    }
}
