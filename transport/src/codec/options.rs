use crate::codec::byte_order::{ByteOrder, FieldReader, OrderedBufMut};
use crate::error::CodecError;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::seq::Sqn;
use bytes::BufMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::trace;

pub const OPT_LENGTH: u8 = 0x00;
pub const OPT_FRAGMENT: u8 = 0x01;
pub const OPT_NAK_LIST: u8 = 0x02;
pub const OPT_JOIN: u8 = 0x03;
pub const OPT_MSG_TO_PACKET: u8 = 0x20;
pub const OPT_MSG_PROPERTIES: u8 = 0x21;
pub const OPT_STREAM_CONTROL: u8 = 0x22;
pub const OPT_QUEUE_NAME: u8 = 0x23;
pub const OPT_CONNECTION_MSG: u8 = 0x24;

pub const OPT_END: u8 = 0x80;
const OPT_TYPE_MASK: u8 = 0x7f;

/// OPT_LENGTH is 4 bytes, and so is the prefix of every other option
pub const OPTION_PREFIX_LEN: usize = 4;

pub const MAX_QUEUE_NAME_LEN: usize = 2048;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Reliability {
    Unreliable = 0,
    Reliable = 1,
    ReliableNoHistory = 2,
}
impl Reliability {
    pub fn is_reliable(self) -> bool {
        self != Reliability::Unreliable
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FragmentInfo {
    /// sequence number of the packet carrying the first fragment
    pub first_sqn: Sqn,
    pub offset: u32,
    pub total_len: u32,
}

/// transmitter state that is announced in SPM packets
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StreamControl {
    pub reliability: Reliability,
    pub is_active: bool,
    pub keep_history: bool,
    pub close_linger_millis: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PacketOption {
    Fragment(FragmentInfo),
    NakList(Vec<Sqn>),
    Join { late_join_mark: Sqn },
    MsgToPacket { first_msg_sqn: u64 },
    MsgProperties,
    StreamControl(StreamControl),
    QueueName(String),
    ConnectionMessage(Vec<u8>),
}

impl PacketOption {
    fn option_type(&self) -> u8 {
        match self {
            PacketOption::Fragment(_) => OPT_FRAGMENT,
            PacketOption::NakList(_) => OPT_NAK_LIST,
            PacketOption::Join { .. } => OPT_JOIN,
            PacketOption::MsgToPacket { .. } => OPT_MSG_TO_PACKET,
            PacketOption::MsgProperties => OPT_MSG_PROPERTIES,
            PacketOption::StreamControl(_) => OPT_STREAM_CONTROL,
            PacketOption::QueueName(_) => OPT_QUEUE_NAME,
            PacketOption::ConnectionMessage(_) => OPT_CONNECTION_MSG,
        }
    }

    fn data_len(&self) -> usize {
        match self {
            PacketOption::Fragment(_) => 12,
            PacketOption::NakList(sqns) => 4 * sqns.len(),
            PacketOption::Join { .. } => 4,
            PacketOption::MsgToPacket { .. } => 8,
            PacketOption::MsgProperties => 0,
            PacketOption::StreamControl(_) => 8,
            PacketOption::QueueName(name) => name.len(),
            PacketOption::ConnectionMessage(msg) => msg.len(),
        }
    }

    fn ser_data(&self, buf: &mut impl BufMut, order: ByteOrder) {
        match self {
            PacketOption::Fragment(info) => {
                buf.put_u32_ord(order, info.first_sqn.to_raw());
                buf.put_u32_ord(order, info.offset);
                buf.put_u32_ord(order, info.total_len);
            }
            PacketOption::NakList(sqns) => {
                for sqn in sqns {
                    buf.put_u32_ord(order, sqn.to_raw());
                }
            }
            PacketOption::Join { late_join_mark } => buf.put_u32_ord(order, late_join_mark.to_raw()),
            PacketOption::MsgToPacket { first_msg_sqn } => buf.put_u64_ord(order, *first_msg_sqn),
            PacketOption::MsgProperties => {}
            PacketOption::StreamControl(control) => {
                buf.put_u8(control.reliability.into());
                buf.put_u8(control.is_active as u8);
                buf.put_u8(control.keep_history as u8);
                buf.put_u8(0);
                buf.put_u32_ord(order, control.close_linger_millis);
            }
            PacketOption::QueueName(name) => buf.put_slice(name.as_bytes()),
            PacketOption::ConnectionMessage(msg) => buf.put_slice(msg),
        }
    }

    fn deser_data(option_type: u8, data: &[u8], order: ByteOrder) -> Result<Option<PacketOption>, CodecError> {
        let mut reader = FieldReader::new(data, order);
        let result = match option_type {
            OPT_FRAGMENT => PacketOption::Fragment(FragmentInfo {
                first_sqn: Sqn::from_raw(reader.u32()?),
                offset: reader.u32()?,
                total_len: reader.u32()?,
            }),
            OPT_NAK_LIST => {
                if data.len() % 4 != 0 {
                    return Err(CodecError::BadOptionChain("NAK list length is not a multiple of 4"));
                }
                let mut sqns = Vec::with_capacity(data.len() / 4);
                while reader.remaining() > 0 {
                    sqns.push(Sqn::from_raw(reader.u32()?));
                }
                PacketOption::NakList(sqns)
            }
            OPT_JOIN => PacketOption::Join { late_join_mark: Sqn::from_raw(reader.u32()?) },
            OPT_MSG_TO_PACKET => PacketOption::MsgToPacket { first_msg_sqn: reader.u64()? },
            OPT_MSG_PROPERTIES => PacketOption::MsgProperties,
            OPT_STREAM_CONTROL => {
                let reliability = Reliability::try_from(reader.u8()?)
                    .map_err(|_| CodecError::BadOptionChain("unknown reliability"))?;
                let is_active = reader.u8()? != 0;
                let keep_history = reader.u8()? != 0;
                let _reserved = reader.u8()?;
                PacketOption::StreamControl(StreamControl {
                    reliability,
                    is_active,
                    keep_history,
                    close_linger_millis: reader.u32()?,
                })
            }
            OPT_QUEUE_NAME => {
                if data.len() > MAX_QUEUE_NAME_LEN {
                    return Err(CodecError::BadOptionChain("queue name too long"));
                }
                let name = std::str::from_utf8(data)
                    .map_err(|_| CodecError::BadOptionChain("queue name is not valid UTF-8"))?;
                PacketOption::QueueName(name.to_string())
            }
            OPT_CONNECTION_MSG => PacketOption::ConnectionMessage(data.to_vec()),
            other => {
                trace!("skipping unknown option type {:#04x}", other);
                return Ok(None);
            }
        };
        Ok(Some(result))
    }
}

pub fn serialized_options_len(options: &[PacketOption]) -> usize {
    if options.is_empty() {
        return 0;
    }
    OPTION_PREFIX_LEN + options.iter()
        .map(|o| OPTION_PREFIX_LEN + o.data_len())
        .sum::<usize>()
}

/// Writes the option chain: OPT_LENGTH (type, length 4, total length of the chain as u16)
///  followed by each option as type, reserved byte, u16 length including the 4 byte prefix, and
///  data. The last option has the OPT_END bit set in its type.
///
/// Nothing is written for an empty list.
pub fn ser_options(options: &[PacketOption], buf: &mut impl BufMut, order: ByteOrder) {
    if options.is_empty() {
        return;
    }

    buf.put_u8(OPT_LENGTH);
    buf.put_u8(OPTION_PREFIX_LEN as u8);
    buf.put_u16_ord(order, serialized_options_len(options).prechecked_cast());

    for (idx, option) in options.iter().enumerate() {
        let end_flag = if idx == options.len() - 1 { OPT_END } else { 0 };
        buf.put_u8(option.option_type() | end_flag);
        buf.put_u8(0);
        buf.put_u16_ord(order, (OPTION_PREFIX_LEN + option.data_len()).prechecked_cast());
        option.ser_data(buf, order);
    }
}

/// Reads an option chain written by [ser_options]. Unknown option types are skipped based on
///  their length.
pub fn deser_options(reader: &mut FieldReader) -> Result<Vec<PacketOption>, CodecError> {
    let start = reader.position();

    if reader.u8()? != OPT_LENGTH {
        return Err(CodecError::BadOptionChain("option chain does not start with OPT_LENGTH"));
    }
    if reader.u8()?.safe_cast() != OPTION_PREFIX_LEN {
        return Err(CodecError::BadOptionChain("OPT_LENGTH has an invalid length"));
    }
    let total_len: usize = reader.u16()?.safe_cast();
    if total_len < OPTION_PREFIX_LEN {
        return Err(CodecError::BadOptionChain("total option length is too small"));
    }

    let mut result = Vec::new();
    loop {
        if reader.position() - start >= total_len {
            return Err(CodecError::BadOptionChain("option chain is not terminated"));
        }

        let raw_type = reader.u8()?;
        let _reserved = reader.u8()?;
        let option_len: usize = reader.u16()?.safe_cast();
        if option_len < OPTION_PREFIX_LEN {
            return Err(CodecError::BadOptionChain("option length is too small"));
        }
        let data = reader.bytes(option_len - OPTION_PREFIX_LEN)?;

        if let Some(option) = PacketOption::deser_data(raw_type & OPT_TYPE_MASK, data, reader.order())? {
            result.push(option);
        }

        if raw_type & OPT_END != 0 {
            break;
        }
    }

    if reader.position() - start != total_len {
        return Err(CodecError::BadOptionChain("total option length does not match the options"));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::fragment(vec![PacketOption::Fragment(FragmentInfo { first_sqn: Sqn::from_raw(9), offset: 100, total_len: 300 })])]
    #[case::nak_list(vec![PacketOption::NakList(vec![Sqn::from_raw(3), Sqn::from_raw(5)])])]
    #[case::join_and_msg_to_packet(vec![PacketOption::Join { late_join_mark: Sqn::from_raw(17) }, PacketOption::MsgToPacket { first_msg_sqn: 1 << 40 }])]
    #[case::spm_options(vec![
        PacketOption::StreamControl(StreamControl { reliability: Reliability::ReliableNoHistory, is_active: false, keep_history: true, close_linger_millis: 50 }),
        PacketOption::MsgProperties,
        PacketOption::QueueName("queue/a".to_string()),
    ])]
    #[case::connection_msg(vec![PacketOption::ConnectionMessage(vec![1, 2, 3])])]
    fn test_ser_deser(#[case] options: Vec<PacketOption>, #[values(ByteOrder::Big, ByteOrder::Little)] order: ByteOrder) {
        let mut buf = Vec::new();
        ser_options(&options, &mut buf, order);
        assert_eq!(buf.len(), serialized_options_len(&options));

        let mut reader = FieldReader::new(&buf, order);
        assert_eq!(deser_options(&mut reader), Ok(options));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_wire_layout() {
        let mut buf = Vec::new();
        ser_options(&[PacketOption::Join { late_join_mark: Sqn::from_raw(5) }], &mut buf, ByteOrder::Big);
        assert_eq!(buf, vec![
            0x00, 4, 0, 12,
            0x83, 0, 0, 8, 0, 0, 0, 5,
        ]);
    }

    #[test]
    fn test_empty_writes_nothing() {
        let mut buf = Vec::new();
        ser_options(&[], &mut buf, ByteOrder::Big);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_option_is_skipped() {
        let buf = vec![
            0x00, 4, 0, 18,
            0x55, 0, 0, 6, 9, 9,
            0x83, 0, 0, 8, 0, 0, 0, 5,
        ];
        let mut reader = FieldReader::new(&buf, ByteOrder::Big);
        assert_eq!(deser_options(&mut reader), Ok(vec![PacketOption::Join { late_join_mark: Sqn::from_raw(5) }]));
    }

    #[rstest]
    #[case::no_opt_length(vec![0x03, 4, 0, 8, 0x83, 0, 0, 4])]
    #[case::bad_prefix_len(vec![0x00, 5, 0, 8, 0x83, 0, 0, 4])]
    #[case::not_terminated(vec![0x00, 4, 0, 8, 0x03, 0, 0, 4])]
    #[case::total_mismatch(vec![0x00, 4, 0, 12, 0x83, 0, 0, 4])]
    #[case::option_len_too_small(vec![0x00, 4, 0, 8, 0x83, 0, 0, 2])]
    #[case::truncated(vec![0x00, 4, 0, 12, 0x83, 0, 0, 8, 0, 0])]
    fn test_malformed(#[case] buf: Vec<u8>) {
        let mut reader = FieldReader::new(&buf, ByteOrder::Big);
        assert!(deser_options(&mut reader).is_err());
    }
}
