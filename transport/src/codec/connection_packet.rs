use crate::codec::byte_order::{ByteOrder, FieldReader, OrderedBufMut};
use crate::codec::options::{deser_options, ser_options, PacketOption};
use crate::error::CodecError;
use bitflags::bitflags;
use bytes::BufMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::net::IpAddr;

/// Maximum length of the opaque connect message carried in a connect request
pub const MAX_CONNECT_MESSAGE_LEN: usize = 64512;

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ConnectionPacketType {
    ConnectRequest = 0x40,
    ConnectReply = 0x41,
    Heartbeat = 0x42,
    Close = 0x43,
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct ConnectionPacketFlags: u8 {
        const OPT_PRESENT = 0b0000_0001;
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectRequest {
    pub instance_id: u32,
    pub heartbeat_timeout_millis: u32,
    pub heartbeat_interval_millis: u32,
    pub one_way_heartbeat: bool,
    /// the port on which the requesting instance accepts connections, 0 if none
    pub source_port: u16,
    pub source_addr: IpAddr,
    pub connect_message: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ConnectReply {
    pub accepted: bool,
    pub instance_id: u32,
    pub heartbeat_timeout_millis: u32,
}

/// Connection control packet. These packets have their own header family, so they are never
///  confused with stream packets on the wire:
///
/// ```ascii
/// 0: byte order mark (4 bytes) - 0x01020304 in the sender's byte order
/// 4: packet type (u8) - 0x40..0x43
/// 5: version (u8)
/// 6: flags (u8)
/// 7: reserved (u8)
/// 8: body (type specific), followed by options if OPT_PRESENT is set
/// ```
///
/// All multi-byte fields are written in the sender's byte order; the receiver detects it
///  from the byte order mark.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConnectionPacket {
    ConnectRequest(ConnectRequest),
    ConnectReply(ConnectReply),
    Heartbeat,
    Close,
}

impl ConnectionPacket {
    pub const VERSION: u8 = 1;
    pub const HEADER_LEN: usize = 8;

    pub fn packet_type(&self) -> ConnectionPacketType {
        match self {
            ConnectionPacket::ConnectRequest(_) => ConnectionPacketType::ConnectRequest,
            ConnectionPacket::ConnectReply(_) => ConnectionPacketType::ConnectReply,
            ConnectionPacket::Heartbeat => ConnectionPacketType::Heartbeat,
            ConnectionPacket::Close => ConnectionPacketType::Close,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut, order: ByteOrder) {
        let options = match self {
            ConnectionPacket::ConnectRequest(ConnectRequest { connect_message: Some(msg), .. }) => {
                vec![PacketOption::ConnectionMessage(msg.clone())]
            }
            _ => Vec::new(),
        };
        let mut flags = ConnectionPacketFlags::empty();
        flags.set(ConnectionPacketFlags::OPT_PRESENT, !options.is_empty());

        buf.put_slice(&order.mark_bytes());
        buf.put_u8(self.packet_type().into());
        buf.put_u8(Self::VERSION);
        buf.put_u8(flags.bits());
        buf.put_u8(0);

        match self {
            ConnectionPacket::ConnectRequest(req) => {
                buf.put_u32_ord(order, req.instance_id);
                buf.put_u32_ord(order, req.heartbeat_timeout_millis);
                buf.put_u32_ord(order, req.heartbeat_interval_millis);
                buf.put_u8(req.one_way_heartbeat.into());
                buf.put_u8(0);
                buf.put_u16_ord(order, req.source_port);
                buf.put_nla(order, req.source_addr);
            }
            ConnectionPacket::ConnectReply(rep) => {
                buf.put_u8(if rep.accepted { 0 } else { 1 });
                buf.put_u8(0);
                buf.put_u16(0);
                buf.put_u32_ord(order, rep.instance_id);
                buf.put_u32_ord(order, rep.heartbeat_timeout_millis);
            }
            ConnectionPacket::Heartbeat | ConnectionPacket::Close => {}
        }

        ser_options(&options, buf, order);
    }

    /// Parses a connection packet, returning it together with the byte order the peer uses
    pub fn deser(buf: &[u8]) -> Result<(ConnectionPacket, ByteOrder), CodecError> {
        if buf.len() < Self::HEADER_LEN {
            return Err(CodecError::TooShort { needed: Self::HEADER_LEN - buf.len() });
        }
        let order = ByteOrder::from_mark([buf[0], buf[1], buf[2], buf[3]])?;

        let mut reader = FieldReader::new(buf, order);
        reader.skip(4)?;
        let raw_type = reader.u8()?;
        let packet_type = ConnectionPacketType::try_from(raw_type)
            .map_err(|_| CodecError::UnknownPacketType(raw_type))?;
        let _version = reader.u8()?;
        let flags = ConnectionPacketFlags::from_bits_truncate(reader.u8()?);
        let _reserved = reader.u8()?;

        let packet = match packet_type {
            ConnectionPacketType::ConnectRequest => {
                let instance_id = reader.u32()?;
                let heartbeat_timeout_millis = reader.u32()?;
                let heartbeat_interval_millis = reader.u32()?;
                let one_way_heartbeat = reader.u8()? != 0;
                let _reserved = reader.u8()?;
                let source_port = reader.u16()?;
                let source_addr = reader.nla()?;

                let options = if flags.contains(ConnectionPacketFlags::OPT_PRESENT) {
                    deser_options(&mut reader)?
                }
                else {
                    Vec::new()
                };
                let connect_message = options.into_iter()
                    .find_map(|o| match o {
                        PacketOption::ConnectionMessage(msg) => Some(msg),
                        _ => None,
                    });

                ConnectionPacket::ConnectRequest(ConnectRequest {
                    instance_id,
                    heartbeat_timeout_millis,
                    heartbeat_interval_millis,
                    one_way_heartbeat,
                    source_port,
                    source_addr,
                    connect_message,
                })
            }
            ConnectionPacketType::ConnectReply => {
                let accepted = reader.u8()? == 0;
                reader.skip(3)?;
                ConnectionPacket::ConnectReply(ConnectReply {
                    accepted,
                    instance_id: reader.u32()?,
                    heartbeat_timeout_millis: reader.u32()?,
                })
            }
            ConnectionPacketType::Heartbeat => ConnectionPacket::Heartbeat,
            ConnectionPacketType::Close => ConnectionPacket::Close,
        };

        Ok((packet, order))
    }
}
