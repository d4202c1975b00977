use crate::codec::byte_order::{nla_len, ByteOrder, FieldReader, OrderedBufMut};
use crate::codec::options::{deser_options, serialized_options_len, ser_options, PacketOption};
use crate::error::CodecError;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::seq::Sqn;
use bitflags::bitflags;
use bytes::BufMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Debug, Formatter};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Spm = 0x00,
    Odata = 0x04,
    Rdata = 0x05,
    Nak = 0x08,
    Ncf = 0x0a,
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct HeaderOptions: u8 {
        const OPT_PRESENT = 0b0000_0001;
        const OPT_NETWORK = 0b0000_0010;
    }
}

/// Global stream id: 48 bits, the high 32 bits identify the transmitting instance, the low
///  16 bits are the transmitter's stream id
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Gsi(u64);

impl Debug for Gsi {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "GSI{{{:08x}:{}}}", self.high(), self.low())
    }
}

impl Gsi {
    pub fn new(high: u32, low: u16) -> Gsi {
        Gsi(((high as u64) << 16) | low as u64)
    }

    pub fn from_raw(raw: u64) -> Gsi {
        Gsi(raw & 0xffff_ffff_ffff)
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }

    pub fn high(self) -> u32 {
        (self.0 >> 16) as u32
    }

    pub fn low(self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

/// The header shared by all stream packets:
///
/// ```ascii
///  0: source port (u16)
///  2: destination port (u16)
///  4: packet type (u8)
///  5: options flags (u8)
///  6: checksum (u16), 0 if checksums are disabled
///  8: GSI high (u32)
/// 12: GSI low (u16)
/// 14: TSDU length (u16) - number of payload bytes after header, body and options
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CommonHeader {
    pub source_port: u16,
    pub dest_port: u16,
    pub packet_type: PacketType,
    pub options: HeaderOptions,
    pub checksum: u16,
    pub gsi: Gsi,
    pub tsdu_length: u16,
}

impl CommonHeader {
    pub const SERIALIZED_LEN: usize = 16;
    pub const OFFSET_TYPE: usize = 4;
    pub const OFFSET_CHECKSUM: usize = 6;
    pub const OFFSET_TSDU_LENGTH: usize = 14;

    pub fn ser(&self, buf: &mut impl BufMut, order: ByteOrder) {
        buf.put_u16_ord(order, self.source_port);
        buf.put_u16_ord(order, self.dest_port);
        buf.put_u8(self.packet_type.into());
        buf.put_u8(self.options.bits());
        buf.put_u16_ord(order, self.checksum);
        buf.put_u32_ord(order, self.gsi.high());
        buf.put_u16_ord(order, self.gsi.low());
        buf.put_u16_ord(order, self.tsdu_length);
    }

    pub fn deser(reader: &mut FieldReader) -> Result<CommonHeader, CodecError> {
        let source_port = reader.u16()?;
        let dest_port = reader.u16()?;
        let raw_type = reader.u8()?;
        let packet_type = PacketType::try_from(raw_type)
            .map_err(|_| CodecError::UnknownPacketType(raw_type))?;
        let options = HeaderOptions::from_bits_truncate(reader.u8()?);
        let checksum = reader.u16()?;
        let gsi_high = reader.u32()?;
        let gsi_low = reader.u16()?;
        let tsdu_length = reader.u16()?;

        Ok(CommonHeader {
            source_port,
            dest_port,
            packet_type,
            options,
            checksum,
            gsi: Gsi::new(gsi_high, gsi_low),
            tsdu_length,
        })
    }
}

/// SPM: the transmitter's periodic announcement of its window
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SpmBody {
    pub spm_sqn: Sqn,
    pub trail: Sqn,
    pub lead: Sqn,
    pub nla: IpAddr,
}

/// ODATA / RDATA
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DataBody {
    pub data_sqn: Sqn,
    pub trail: Sqn,
}
impl DataBody {
    /// offset of the trail field in a serialized data packet, for patching at send time
    pub const OFFSET_TRAIL: usize = CommonHeader::SERIALIZED_LEN + 4;
}

/// NAK / NCF
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct NakBody {
    pub nak_sqn: Sqn,
    pub source_nla: IpAddr,
    pub group_nla: IpAddr,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PacketBody {
    Spm(SpmBody),
    Data(DataBody),
    Nak(NakBody),
}

impl PacketBody {
    fn serialized_len(&self) -> usize {
        match self {
            PacketBody::Spm(spm) => 12 + nla_len(spm.nla),
            PacketBody::Data(_) => 8,
            PacketBody::Nak(nak) => 4 + nla_len(nak.source_nla) + nla_len(nak.group_nla),
        }
    }

    fn ser(&self, buf: &mut impl BufMut, order: ByteOrder) {
        match self {
            PacketBody::Spm(spm) => {
                buf.put_u32_ord(order, spm.spm_sqn.to_raw());
                buf.put_u32_ord(order, spm.trail.to_raw());
                buf.put_u32_ord(order, spm.lead.to_raw());
                buf.put_nla(order, spm.nla);
            }
            PacketBody::Data(data) => {
                buf.put_u32_ord(order, data.data_sqn.to_raw());
                buf.put_u32_ord(order, data.trail.to_raw());
            }
            PacketBody::Nak(nak) => {
                buf.put_u32_ord(order, nak.nak_sqn.to_raw());
                buf.put_nla(order, nak.source_nla);
                buf.put_nla(order, nak.group_nla);
            }
        }
    }

    fn deser(packet_type: PacketType, reader: &mut FieldReader) -> Result<PacketBody, CodecError> {
        Ok(match packet_type {
            PacketType::Spm => PacketBody::Spm(SpmBody {
                spm_sqn: Sqn::from_raw(reader.u32()?),
                trail: Sqn::from_raw(reader.u32()?),
                lead: Sqn::from_raw(reader.u32()?),
                nla: reader.nla()?,
            }),
            PacketType::Odata | PacketType::Rdata => PacketBody::Data(DataBody {
                data_sqn: Sqn::from_raw(reader.u32()?),
                trail: Sqn::from_raw(reader.u32()?),
            }),
            PacketType::Nak | PacketType::Ncf => PacketBody::Nak(NakBody {
                nak_sqn: Sqn::from_raw(reader.u32()?),
                source_nla: reader.nla()?,
                group_nla: reader.nla()?,
            }),
        })
    }
}

/// A stream packet (SPM, ODATA, RDATA, NAK, NCF) without its payload
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StreamPacket {
    pub header: CommonHeader,
    pub body: PacketBody,
    pub options: Vec<PacketOption>,
}

impl StreamPacket {
    /// Length of header, body and options, i.e. the offset of the payload
    pub fn serialized_len_without_payload(&self) -> usize {
        CommonHeader::SERIALIZED_LEN + self.body.serialized_len() + serialized_options_len(&self.options)
    }

    /// Writes the packet followed by its payload. The header's TSDU length and options flag
    ///  are derived from the payload and options, the checksum field is written as given.
    pub fn ser(&self, buf: &mut impl BufMut, order: ByteOrder, payload: &[u8]) {
        let mut header = self.header;
        header.tsdu_length = payload.len().prechecked_cast();
        header.options.set(HeaderOptions::OPT_PRESENT, !self.options.is_empty());

        header.ser(buf, order);
        self.body.ser(buf, order);
        ser_options(&self.options, buf, order);
        buf.put_slice(payload);
    }

    /// Parses a packet, returning it together with the offset of its payload. The payload's
    ///  length must match the header's TSDU length.
    pub fn deser(buf: &[u8], order: ByteOrder) -> Result<(StreamPacket, usize), CodecError> {
        let mut reader = FieldReader::new(buf, order);
        let header = CommonHeader::deser(&mut reader)?;
        let body = PacketBody::deser(header.packet_type, &mut reader)?;

        let options = if header.options.contains(HeaderOptions::OPT_PRESENT) {
            deser_options(&mut reader)?
        }
        else {
            Vec::new()
        };

        let declared: usize = header.tsdu_length.safe_cast();
        if reader.remaining() != declared {
            return Err(CodecError::LengthMismatch { declared, actual: reader.remaining() });
        }

        Ok((StreamPacket { header, body, options }, reader.position()))
    }

    pub fn option<T>(&self, f: impl Fn(&PacketOption) -> Option<T>) -> Option<T> {
        self.options.iter().find_map(f)
    }

    pub fn data_body(&self) -> Option<&DataBody> {
        match &self.body {
            PacketBody::Data(data) => Some(data),
            _ => None,
        }
    }

    /// all sequence numbers of a NAK or NCF: the one in the body followed by the NAK list option
    pub fn nak_sqns(&self) -> Vec<Sqn> {
        let mut result = Vec::new();
        if let PacketBody::Nak(nak) = &self.body {
            result.push(nak.nak_sqn);
            if let Some(list) = self.option(|o| match o {
                PacketOption::NakList(list) => Some(list.clone()),
                _ => None,
            }) {
                result.extend(list);
            }
        }
        result
    }

    /// Builds a NAK or NCF for a list of sequence numbers: the first goes into the body, the
    ///  rest into a NAK list option
    pub fn nak_or_ncf(packet_type: PacketType, source_port: u16, dest_port: u16, gsi: Gsi, sqns: &[Sqn], source_nla: IpAddr, group_nla: IpAddr) -> Option<StreamPacket> {
        let (&first, rest) = sqns.split_first()?;
        let options = if rest.is_empty() {
            Vec::new()
        }
        else {
            vec![PacketOption::NakList(rest.to_vec())]
        };

        Some(StreamPacket {
            header: CommonHeader {
                source_port,
                dest_port,
                packet_type,
                options: HeaderOptions::empty(),
                checksum: 0,
                gsi,
                tsdu_length: 0,
            },
            body: PacketBody::Nak(NakBody {
                nak_sqn: first,
                source_nla,
                group_nla,
            }),
            options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::options::{FragmentInfo, Reliability, StreamControl};
    use rstest::rstest;
    use std::net::Ipv6Addr;

    fn header(packet_type: PacketType) -> CommonHeader {
        CommonHeader {
            source_port: 7,
            dest_port: 9,
            packet_type,
            options: HeaderOptions::empty(),
            checksum: 0,
            gsi: Gsi::new(0x0a0b0c0d, 3),
            tsdu_length: 0,
        }
    }

    fn spm() -> StreamPacket {
        StreamPacket {
            header: header(PacketType::Spm),
            body: PacketBody::Spm(SpmBody {
                spm_sqn: Sqn::from_raw(4),
                trail: Sqn::from_raw(10),
                lead: Sqn::from_raw(20),
                nla: IpAddr::from([127, 0, 0, 1]),
            }),
            options: vec![
                PacketOption::Join { late_join_mark: Sqn::from_raw(10) },
                PacketOption::StreamControl(StreamControl { reliability: Reliability::Reliable, is_active: true, keep_history: true, close_linger_millis: 0 }),
                PacketOption::QueueName("q".to_string()),
            ],
        }
    }

    fn odata() -> StreamPacket {
        StreamPacket {
            header: header(PacketType::Odata),
            body: PacketBody::Data(DataBody { data_sqn: Sqn::from_raw(u32::MAX), trail: Sqn::from_raw(3) }),
            options: vec![PacketOption::MsgToPacket { first_msg_sqn: 77 }],
        }
    }

    fn rdata_fragment() -> StreamPacket {
        StreamPacket {
            header: header(PacketType::Rdata),
            body: PacketBody::Data(DataBody { data_sqn: Sqn::from_raw(12), trail: Sqn::from_raw(3) }),
            options: vec![PacketOption::Fragment(FragmentInfo { first_sqn: Sqn::from_raw(11), offset: 100, total_len: 150 })],
        }
    }

    fn nak() -> StreamPacket {
        StreamPacket::nak_or_ncf(
            PacketType::Nak, 9, 7, Gsi::new(1, 2),
            &[Sqn::from_raw(3), Sqn::from_raw(5), Sqn::from_raw(6)],
            IpAddr::from([10, 0, 0, 1]),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ).unwrap()
    }

    fn ncf() -> StreamPacket {
        StreamPacket::nak_or_ncf(
            PacketType::Ncf, 7, 9, Gsi::new(1, 2),
            &[Sqn::from_raw(3)],
            IpAddr::from([10, 0, 0, 1]),
            IpAddr::from([10, 0, 0, 2]),
        ).unwrap()
    }

    #[rstest]
    #[case::spm(spm(), vec![])]
    #[case::odata(odata(), vec![1, 2, 3, 4])]
    #[case::rdata_fragment(rdata_fragment(), vec![5; 50])]
    #[case::nak(nak(), vec![])]
    #[case::ncf(ncf(), vec![])]
    fn test_ser_deser(#[case] packet: StreamPacket, #[case] payload: Vec<u8>, #[values(ByteOrder::Big, ByteOrder::Little)] order: ByteOrder) {
        let mut buf = Vec::new();
        packet.ser(&mut buf, order, &payload);
        assert_eq!(buf.len(), packet.serialized_len_without_payload() + payload.len());

        let (parsed, payload_offset) = StreamPacket::deser(&buf, order).unwrap();
        assert_eq!(&buf[payload_offset..], payload.as_slice());

        assert_eq!(parsed.body, packet.body);
        assert_eq!(parsed.options, packet.options);
        assert_eq!(parsed.header.gsi, packet.header.gsi);
        assert_eq!(parsed.header.packet_type, packet.header.packet_type);
        assert_eq!(parsed.header.tsdu_length as usize, payload.len());
        assert_eq!(parsed.header.options.contains(HeaderOptions::OPT_PRESENT), !packet.options.is_empty());
    }

    #[test]
    fn test_odata_wire_layout() {
        let packet = StreamPacket {
            header: header(PacketType::Odata),
            body: PacketBody::Data(DataBody { data_sqn: Sqn::from_raw(5), trail: Sqn::from_raw(2) }),
            options: vec![],
        };
        let mut buf = Vec::new();
        packet.ser(&mut buf, ByteOrder::Big, &[0xaa]);
        assert_eq!(buf, vec![
            0, 7, 0, 9,
            0x04, 0, 0, 0,
            0x0a, 0x0b, 0x0c, 0x0d, 0, 3,
            0, 1,
            0, 0, 0, 5,
            0, 0, 0, 2,
            0xaa,
        ]);
        assert_eq!(&buf[DataBody::OFFSET_TRAIL..DataBody::OFFSET_TRAIL + 4], &[0, 0, 0, 2]);
    }

    #[test]
    fn test_nak_sqns() {
        assert_eq!(nak().nak_sqns(), vec![Sqn::from_raw(3), Sqn::from_raw(5), Sqn::from_raw(6)]);
        assert_eq!(ncf().nak_sqns(), vec![Sqn::from_raw(3)]);
        assert!(ncf().options.is_empty());
        assert!(odata().nak_sqns().is_empty());
    }

    #[test]
    fn test_nak_empty_list() {
        assert!(StreamPacket::nak_or_ncf(PacketType::Nak, 1, 2, Gsi::new(1, 1), &[], IpAddr::from([1, 1, 1, 1]), IpAddr::from([1, 1, 1, 1])).is_none());
    }

    #[rstest]
    #[case::too_short(vec![0, 7, 0, 9, 0x04])]
    #[case::unknown_type(vec![0, 7, 0, 9, 0x33, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0])]
    #[case::tsdu_mismatch(vec![0, 7, 0, 9, 0x04, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 5, 0, 0, 0, 1, 0, 0, 0, 1, 9])]
    fn test_malformed(#[case] buf: Vec<u8>) {
        assert!(StreamPacket::deser(&buf, ByteOrder::Big).is_err());
    }

    #[test]
    fn test_swapped_parse_of_big_endian_packet_differs() {
        let mut buf = Vec::new();
        odata().ser(&mut buf, ByteOrder::Big, &[]);
        let result = StreamPacket::deser(&buf, ByteOrder::Little);
        assert!(result.is_err() || result.unwrap().0 != odata());
    }

    #[rstest]
    #[case::simple(0x1234_5678, 9)]
    #[case::max(u32::MAX, u16::MAX)]
    fn test_gsi(#[case] high: u32, #[case] low: u16) {
        let gsi = Gsi::new(high, low);
        assert_eq!(gsi.high(), high);
        assert_eq!(gsi.low(), low);
        assert_eq!(Gsi::from_raw(gsi.to_raw()), gsi);
    }
}
