//! Wire format of RUM packets. See the crate documentation for the layouts.

pub mod byte_order;
pub mod connection_packet;
pub mod frame;
pub mod message_record;
pub mod options;
pub mod packet_header;

use crate::codec::byte_order::{patch_u16, read_u16_at, ByteOrder};
use crate::codec::connection_packet::ConnectionPacketType;
use crate::codec::packet_header::CommonHeader;
use crate::error::CodecError;
use crc::{Crc, CRC_16_IBM_SDLC};

static CHECKSUM: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

/// Stream packets and connection packets share the connection's byte stream. Both have their
///  type byte at offset 4, and the type ranges do not overlap.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PacketFamily {
    Stream,
    Connection,
}

impl PacketFamily {
    pub fn of(packet: &[u8]) -> Result<PacketFamily, CodecError> {
        let type_byte = *packet.get(CommonHeader::OFFSET_TYPE)
            .ok_or_else(|| CodecError::TooShort { needed: CommonHeader::OFFSET_TYPE + 1 - packet.len() })?;

        if ConnectionPacketType::try_from(type_byte).is_ok() {
            Ok(PacketFamily::Connection)
        }
        else {
            Ok(PacketFamily::Stream)
        }
    }
}

/// CRC-16 over a serialized stream packet with the checksum field taken as zero. A computed
///  value of 0 is mapped to 0xffff since 0 on the wire means 'no checksum'.
pub fn compute_checksum(packet: &[u8]) -> u16 {
    let range = CommonHeader::OFFSET_CHECKSUM..CommonHeader::OFFSET_CHECKSUM + 2;
    if packet.len() < range.end {
        return 0xffff;
    }

    let mut digest = CHECKSUM.digest();
    digest.update(&packet[..range.start]);
    digest.update(&[0, 0]);
    digest.update(&packet[range.end..]);
    match digest.finalize() {
        0 => 0xffff,
        crc => crc,
    }
}

pub fn apply_checksum(packet: &mut [u8], order: ByteOrder) {
    let checksum = compute_checksum(packet);
    patch_u16(packet, CommonHeader::OFFSET_CHECKSUM, order, checksum);
}

/// Verifies the checksum of a received stream packet; packets with a zero checksum field are
///  accepted as-is.
pub fn verify_checksum(packet: &[u8], order: ByteOrder) -> Result<(), CodecError> {
    let actual = read_u16_at(packet, CommonHeader::OFFSET_CHECKSUM, order)?;
    if actual == 0 {
        return Ok(());
    }
    let expected = compute_checksum(packet);
    if actual != expected {
        return Err(CodecError::ChecksumMismatch { actual, expected });
    }
    Ok(())
}
