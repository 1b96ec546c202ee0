//! Pre-handshake tunnel dispatch. A peer-mode connection first trades one
//! pair of unauthenticated protobuf frames with the forwarding server; on
//! an accepted reply the CurveCP handshake starts with TELL. Grid-mode
//! connections send TELL straight away and never see these frames.

use crate::connection::{Link, LinkEvent};
use crate::error::{ErrorKind, NetError, NetResult};
use crate::frame;
use crate::handshake::Phase;
use crate::proto;
use crate::proto::{ForwardError, ForwardRemote, ForwardReply};
use crate::{PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR};
use ion::logging;
use prost::Message;
use std::io::Write;

impl Link {
    /// Kicks off a freshly connected stream: FORWARD_REMOTE when a tunnel
    /// id is pending, TELL otherwise. Returns true if the connection is in
    /// the forwarding stage.
    pub(crate) fn start<S: Write>(&mut self, stream: &mut S) -> NetResult<bool> {
        match self.tunnel_id.take() {
            Some(tunnel_id) => {
                self.send_forward_remote(stream, tunnel_id)?;
                self.phase = Phase::Forwarding;
                Ok(true)
            }
            None => {
                self.send_tell(stream)?;
                self.phase = Phase::AwaitWelcome;
                Ok(false)
            }
        }
    }

    /// Asks the forwarding server for a tunnel to the peer. The frame is
    /// sent unencrypted; the tunnel id is released afterwards.
    fn send_forward_remote<S: Write>(&mut self, stream: &mut S, tunnel_id: Vec<u8>) -> NetResult<()> {
        let remote = ForwardRemote {
            magic: proto::FORWARD_REMOTE_MAGIC,
            protocol_major: PROTOCOL_VERSION_MAJOR,
            protocol_minor: PROTOCOL_VERSION_MINOR,
            tunnel_id,
            signature: proto::FORWARD_REMOTE_SIGNATURE.to_string(),
        };

        let payload_size = remote.encoded_len();
        let frame_len = frame::DATA_PAYLOAD_OFF + payload_size;

        if frame_len > self.buffer_size {
            return Err(NetError::fatal(ErrorKind::BufferExceeded));
        }

        logging::debug!(self.log, "requesting tunnel"; "context" => "forward");

        let mut buf = self.pool.get();
        {
            let mut target = &mut buf[frame::DATA_PAYLOAD_OFF..frame_len];
            remote
                .encode(&mut target)
                .expect("Sized buffer must fit the packed message");
        }
        frame::build_data_frame(&mut buf, proto::MSG_FORWARD_REMOTE, payload_size);

        let result = frame::send_frame(stream, &buf[..frame_len]);
        self.pool.put(buf);
        result
    }

    /// Announces the client to the remote end, prompting it to send WELC.
    pub(crate) fn send_tell<S: Write>(&mut self, stream: &mut S) -> NetResult<()> {
        let mut buf = [0u8; frame::PACKET_TELL_SIZE];
        frame::build_header(&mut buf, frame::CMD_TELL, frame::PACKET_TELL_SIZE);
        frame::send_frame(stream, &buf)
    }

    /// Dispatches one pre-handshake data frame.
    pub(crate) fn handle_data_frame<S: Write>(&mut self, stream: &mut S) -> NetResult<LinkEvent> {
        let msg_type = {
            let packet = self.recv.packet();
            if packet.len() < frame::DATA_PAYLOAD_OFF {
                return Err(NetError::fatal(ErrorKind::Protocol));
            }
            packet[frame::DATA_TYPE_OFF]
        };

        match msg_type {
            // Some servers send this before the reply; no action, no state
            // change.
            proto::MSG_FORWARD_HOLD => {
                logging::trace!(self.log, "forward hold"; "context" => "forward");
                Ok(LinkEvent::None)
            }
            proto::MSG_FORWARD_REPLY => self.handle_forward_reply(stream),
            proto::MSG_FORWARD_ERROR => self.handle_forward_error(),
            _ => {
                logging::warn!(self.log, "unexpected forward message";
                               "context" => "forward",
                               "msg_type" => msg_type);
                Err(NetError::fatal(ErrorKind::Protocol))
            }
        }
    }

    fn handle_forward_reply<S: Write>(&mut self, stream: &mut S) -> NetResult<LinkEvent> {
        let reply = {
            let packet = self.recv.packet();
            match ForwardReply::decode(&packet[frame::DATA_PAYLOAD_OFF..]) {
                Ok(reply) => reply,
                Err(_) => return Err(NetError::fatal(ErrorKind::Protocol)),
            }
        };

        if reply.signature != proto::FORWARD_REMOTE_SIGNATURE {
            logging::warn!(self.log, "wrong forwarding signature";
                           "context" => "forward",
                           "signature" => reply.signature.as_str());
            return Err(NetError::fatal(ErrorKind::Protocol));
        }

        logging::debug!(self.log, "tunnel accepted"; "context" => "forward");

        self.send_tell(stream)?;
        self.phase = Phase::AwaitWelcome;
        Ok(LinkEvent::Handshaking)
    }

    fn handle_forward_error(&mut self) -> NetResult<LinkEvent> {
        let error = {
            let packet = self.recv.packet();
            match ForwardError::decode(&packet[frame::DATA_PAYLOAD_OFF..]) {
                Ok(error) => error,
                Err(_) => return Err(NetError::fatal(ErrorKind::Protocol)),
            }
        };

        let kind = match error.code {
            proto::FORWARD_SERVER_ERROR => ErrorKind::ServerError,
            proto::FORWARD_PEER_TIMEOUT => ErrorKind::PeerTimeout,
            code => {
                logging::warn!(self.log, "unexpected forward error code";
                               "context" => "forward",
                               "code" => code);
                ErrorKind::Protocol
            }
        };

        Err(NetError::fatal(kind))
    }
}
