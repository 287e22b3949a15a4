//! Transport messages: `HELLO`, `STATUS`, `PING`, `PONG`, `DISCONNECT`,
//! `APP_TEST` (§4.5). Encoded the same way discovery messages are: `code(u8)
//! || body`, body fields via `wire::codec`.

use crate::identity::Node;
use crate::wire::{CodecError, CodecResult, Reader, Serializer, Writer};

pub mod message_code {
    pub const HELLO: u8 = 1;
    pub const STATUS: u8 = 2;
    pub const PING: u8 = 3;
    pub const PONG: u8 = 4;
    pub const DISCONNECT: u8 = 5;
    pub const APP_TEST: u8 = 6;
}

/// Reasons a channel is closed via `DISCONNECT`, matching §7's distinct
/// error kinds that must close-with-reason rather than merely close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    BadProtocol,
    Incompatible,
    Timeout,
    Shutdown,
    Other(u8),
}

impl DisconnectReason {
    fn to_code(self) -> u8 {
        match self {
            DisconnectReason::BadProtocol => 1,
            DisconnectReason::Incompatible => 2,
            DisconnectReason::Timeout => 3,
            DisconnectReason::Shutdown => 4,
            DisconnectReason::Other(c) => c,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            1 => DisconnectReason::BadProtocol,
            2 => DisconnectReason::Incompatible,
            3 => DisconnectReason::Timeout,
            4 => DisconnectReason::Shutdown,
            other => DisconnectReason::Other(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Hello {
    pub network_id: u8,
    pub network_version: i16,
    pub peer_descriptor: Node,
}

#[derive(Debug, Clone)]
pub struct Status {
    /// Opaque application metadata exchanged once the handshake completes.
    pub app_data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Disconnect {
    pub reason: DisconnectReason,
}

#[derive(Debug, Clone)]
pub enum TransportMessage {
    Hello(Hello),
    Status(Status),
    Ping,
    Pong,
    Disconnect(Disconnect),
    AppTest(Vec<u8>),
}

impl TransportMessage {
    pub fn code(&self) -> u8 {
        match self {
            TransportMessage::Hello(_) => message_code::HELLO,
            TransportMessage::Status(_) => message_code::STATUS,
            TransportMessage::Ping => message_code::PING,
            TransportMessage::Pong => message_code::PONG,
            TransportMessage::Disconnect(_) => message_code::DISCONNECT,
            TransportMessage::AppTest(_) => message_code::APP_TEST,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![self.code()];
        let mut writer = Writer::new(&mut bytes);
        match self {
            TransportMessage::Hello(hello) => {
                writer.write_u8(hello.network_id);
                writer.write_i16(hello.network_version);
                hello.peer_descriptor.write(&mut writer);
            }
            TransportMessage::Status(status) => {
                writer.write_optional_bytes(Some(&status.app_data));
            }
            TransportMessage::Ping | TransportMessage::Pong => {}
            TransportMessage::Disconnect(disconnect) => {
                writer.write_u8(disconnect.reason.to_code());
            }
            TransportMessage::AppTest(payload) => {
                writer.write_optional_bytes(Some(payload));
            }
        }
        bytes
    }

    pub fn decode(frame: &[u8]) -> CodecResult<Self> {
        if frame.is_empty() {
            return Err(CodecError::UnexpectedEof {
                wanted: 1,
                available: 0,
            });
        }
        let code = frame[0];
        let mut reader = Reader::new(&frame[1..]);
        let message = match code {
            message_code::HELLO => {
                let network_id = reader.read_u8()?;
                let network_version = reader.read_i16()?;
                let peer_descriptor = Node::read(&mut reader)?;
                TransportMessage::Hello(Hello {
                    network_id,
                    network_version,
                    peer_descriptor,
                })
            }
            message_code::STATUS => {
                let app_data = reader.read_optional_bytes()?.unwrap_or_default();
                TransportMessage::Status(Status { app_data })
            }
            message_code::PING => TransportMessage::Ping,
            message_code::PONG => TransportMessage::Pong,
            message_code::DISCONNECT => {
                let reason = DisconnectReason::from_code(reader.read_u8()?);
                TransportMessage::Disconnect(Disconnect { reason })
            }
            message_code::APP_TEST => {
                let payload = reader.read_optional_bytes()?.unwrap_or_default();
                TransportMessage::AppTest(payload)
            }
            _ => return Err(CodecError::InvalidValue),
        };
        Ok(message)
    }
}
