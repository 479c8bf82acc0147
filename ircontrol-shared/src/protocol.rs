use core::fmt;

use crate::code::{InvalidProtocolId, IrCode, Protocol};

/// Every packet exchanged with the microcontroller is exactly this long.
pub const PACKET_SIZE: usize = 16;

/// Size of the type tag at the start of a packet.
pub const TYPE_SIZE: usize = 2;

/// Size of the payload region following the type tag.
pub const PAYLOAD_SIZE: usize = PACKET_SIZE - TYPE_SIZE;

/// Message type tag, little endian `u16` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Nop = 0,
    SetConfig = 1,
    GetConfig = 2,
    GetStatus = 3,
    ActionIrSend = 4,
    ActionIrReceived = 5,
}

impl MessageType {
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Nop => "nop",
            MessageType::SetConfig => "set_config",
            MessageType::GetConfig => "get_config",
            MessageType::GetStatus => "get_status",
            MessageType::ActionIrSend => "action_IR_send",
            MessageType::ActionIrReceived => "action_IR_received",
        }
    }
}

impl TryFrom<u16> for MessageType {
    type Error = ProtocolError;

    fn try_from(tag: u16) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => MessageType::Nop,
            1 => MessageType::SetConfig,
            2 => MessageType::GetConfig,
            3 => MessageType::GetStatus,
            4 => MessageType::ActionIrSend,
            5 => MessageType::ActionIrReceived,
            other => return Err(ProtocolError::InvalidMessageType(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("truncated message, {len} of 16 bytes")]
    TruncatedMessage { len: usize },
    #[error("invalid message type {0}")]
    InvalidMessageType(u16),
    #[error("refusing to transmit a {0} code")]
    SentinelProtocol(Protocol),
}

/// Device configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigPayload {
    pub serial_receive_timeout: u16,
}

/// Device status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusPayload {
    pub uptime: u32,
}

/// The infrared signal carried by `action_IR_send` and `action_IR_received`.
///
/// The protocol id is kept raw so any packet the firmware sends can be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IrSpecification {
    pub protocol: u8,
    pub bits: u8,
    pub value: u32,
}

impl From<IrCode> for IrSpecification {
    fn from(code: IrCode) -> Self {
        IrSpecification {
            protocol: code.protocol().as_u8(),
            bits: code.bits(),
            value: code.value(),
        }
    }
}

impl TryFrom<IrSpecification> for IrCode {
    type Error = InvalidProtocolId;

    fn try_from(spec: IrSpecification) -> Result<Self, Self::Error> {
        IrCode::with_protocol_id(spec.protocol, spec.bits, spec.value)
    }
}

/// A packet, decoded according to its type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Nop([u8; PAYLOAD_SIZE]),
    SetConfig(ConfigPayload),
    GetConfig(ConfigPayload),
    GetStatus(StatusPayload),
    IrSend(IrSpecification),
    IrReceived(IrSpecification),
}

impl Message {
    /// Request the firmware to transmit `code`.
    pub fn ir_send(code: &IrCode) -> Result<Message, ProtocolError> {
        if code.protocol().is_sentinel() {
            return Err(ProtocolError::SentinelProtocol(code.protocol()));
        }
        Ok(Message::IrSend((*code).into()))
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Nop(_) => MessageType::Nop,
            Message::SetConfig(_) => MessageType::SetConfig,
            Message::GetConfig(_) => MessageType::GetConfig,
            Message::GetStatus(_) => MessageType::GetStatus,
            Message::IrSend(_) => MessageType::ActionIrSend,
            Message::IrReceived(_) => MessageType::ActionIrReceived,
        }
    }

    /// Serialize to the fixed size wire format.
    ///
    /// ```text
    /// offset  size  field
    ///      0     2  message type (u16 LE)
    ///      2    14  payload, zero padded
    /// ```
    pub fn encode(&self) -> [u8; PACKET_SIZE] {
        let mut buf = [0u8; PACKET_SIZE];
        buf[..TYPE_SIZE].copy_from_slice(&(self.message_type() as u16).to_le_bytes());

        let payload = &mut buf[TYPE_SIZE..];
        match self {
            Message::Nop(raw) => payload.copy_from_slice(raw),
            Message::SetConfig(config) | Message::GetConfig(config) => {
                payload[0..2].copy_from_slice(&config.serial_receive_timeout.to_le_bytes());
            }
            Message::GetStatus(status) => {
                payload[0..4].copy_from_slice(&status.uptime.to_le_bytes());
            }
            Message::IrSend(ir) | Message::IrReceived(ir) => {
                payload[0] = ir.protocol;
                payload[1] = ir.bits;
                payload[2..6].copy_from_slice(&ir.value.to_le_bytes());
            }
        }

        buf
    }

    /// Parse a packet. Only the first `PACKET_SIZE` bytes are looked at.
    pub fn decode(buf: &[u8]) -> Result<Message, ProtocolError> {
        if buf.len() < PACKET_SIZE {
            return Err(ProtocolError::TruncatedMessage { len: buf.len() });
        }

        let tag = u16::from_le_bytes([buf[0], buf[1]]);
        let p = &buf[TYPE_SIZE..PACKET_SIZE];

        let u16_at = |o: usize| u16::from_le_bytes([p[o], p[o + 1]]);
        let u32_at = |o: usize| u32::from_le_bytes([p[o], p[o + 1], p[o + 2], p[o + 3]]);

        let config = || ConfigPayload {
            serial_receive_timeout: u16_at(0),
        };
        let ir = || IrSpecification {
            protocol: p[0],
            bits: p[1],
            value: u32_at(2),
        };

        Ok(match MessageType::try_from(tag)? {
            MessageType::Nop => {
                let mut raw = [0u8; PAYLOAD_SIZE];
                raw.copy_from_slice(p);
                Message::Nop(raw)
            }
            MessageType::SetConfig => Message::SetConfig(config()),
            MessageType::GetConfig => Message::GetConfig(config()),
            MessageType::GetStatus => Message::GetStatus(StatusPayload { uptime: u32_at(0) }),
            MessageType::ActionIrSend => Message::IrSend(ir()),
            MessageType::ActionIrReceived => Message::IrReceived(ir()),
        })
    }
}

impl fmt::Display for IrSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Protocol::try_from(self.protocol) {
            Ok(p) => write!(f, "dict(type=\"{}\", bits={}, value=0x{:08X})", p, self.bits, self.value),
            Err(_) => write!(f, "dict(type={}, bits={}, value=0x{:08X})", self.protocol, self.bits, self.value),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.message_type().name();
        match self {
            Message::Nop(_) => write!(f, "<Msg {}: ->", name),
            Message::SetConfig(c) | Message::GetConfig(c) => write!(
                f,
                "<Msg {}: {{serial_receive_timeout: {}}}>",
                name, c.serial_receive_timeout
            ),
            Message::GetStatus(s) => write!(f, "<Msg {}: {{uptime: {}}}>", name, s.uptime),
            Message::IrSend(ir) | Message::IrReceived(ir) => write!(f, "<Msg {}: {}>", name, ir),
        }
    }
}
