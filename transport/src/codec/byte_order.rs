use crate::error::CodecError;
use bytes::BufMut;
use bytes_varint::VarIntSupport;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Byte order of multi-byte fields in a peer's packets. Packets are written in network byte
///  order, but a peer may announce a different order through the byte order mark in its
///  connect request, and all of its packets are then read with swapped fields.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    pub const NETWORK: ByteOrder = ByteOrder::Big;
    pub const BYTE_ORDER_MARK: u32 = 0x0102_0304;

    pub fn native() -> ByteOrder {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        }
        else {
            ByteOrder::Little
        }
    }

    pub fn mark_bytes(self) -> [u8; 4] {
        match self {
            ByteOrder::Big => Self::BYTE_ORDER_MARK.to_be_bytes(),
            ByteOrder::Little => Self::BYTE_ORDER_MARK.to_le_bytes(),
        }
    }

    pub fn from_mark(raw: [u8; 4]) -> Result<ByteOrder, CodecError> {
        if raw == ByteOrder::Big.mark_bytes() {
            Ok(ByteOrder::Big)
        }
        else if raw == ByteOrder::Little.mark_bytes() {
            Ok(ByteOrder::Little)
        }
        else {
            Err(CodecError::BadByteOrderMark(raw))
        }
    }
}

pub const AFI_IPV4: u16 = 1;
pub const AFI_IPV6: u16 = 2;

/// Reads fixed-size fields from a packet, swapping multi-byte values according to the peer's
///  byte order. All reads are bounds checked.
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8], order: ByteOrder) -> FieldReader<'a> {
        FieldReader { buf, pos: 0, order }
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::TooShort { needed: len - self.remaining() });
        }
        let result = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(result)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), CodecError> {
        self.bytes(len).map(|_| ())
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let result = &self.buf[self.pos..];
        self.pos = self.buf.len();
        result
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut result = [0u8; N];
        result.copy_from_slice(self.bytes(N)?);
        Ok(result)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16, CodecError> {
        let raw = self.array()?;
        Ok(match self.order {
            ByteOrder::Big => u16::from_be_bytes(raw),
            ByteOrder::Little => u16::from_le_bytes(raw),
        })
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        let raw = self.array()?;
        Ok(match self.order {
            ByteOrder::Big => u32::from_be_bytes(raw),
            ByteOrder::Little => u32::from_le_bytes(raw),
        })
    }

    pub fn u64(&mut self) -> Result<u64, CodecError> {
        let raw = self.array()?;
        Ok(match self.order {
            ByteOrder::Big => u64::from_be_bytes(raw),
            ByteOrder::Little => u64::from_le_bytes(raw),
        })
    }

    /// network layer address: afi (u16), reserved (u16), 4 or 16 address bytes. Address bytes
    ///  are never swapped.
    pub fn nla(&mut self) -> Result<IpAddr, CodecError> {
        let afi = self.u16()?;
        let _reserved = self.u16()?;
        match afi {
            AFI_IPV4 => Ok(IpAddr::V4(Ipv4Addr::from(self.array::<4>()?))),
            AFI_IPV6 => Ok(IpAddr::V6(Ipv6Addr::from(self.array::<16>()?))),
            other => Err(CodecError::BadAddressFamily(other)),
        }
    }
}

/// Writing counterpart of [FieldReader]
pub trait OrderedBufMut: BufMut {
    fn put_u16_ord(&mut self, order: ByteOrder, value: u16) {
        match order {
            ByteOrder::Big => self.put_u16(value),
            ByteOrder::Little => self.put_u16_le(value),
        }
    }

    fn put_u32_ord(&mut self, order: ByteOrder, value: u32) {
        match order {
            ByteOrder::Big => self.put_u32(value),
            ByteOrder::Little => self.put_u32_le(value),
        }
    }

    fn put_u64_ord(&mut self, order: ByteOrder, value: u64) {
        match order {
            ByteOrder::Big => self.put_u64(value),
            ByteOrder::Little => self.put_u64_le(value),
        }
    }

    fn put_nla(&mut self, order: ByteOrder, addr: IpAddr) {
        match addr {
            IpAddr::V4(addr) => {
                self.put_u16_ord(order, AFI_IPV4);
                self.put_u16(0);
                self.put_slice(&addr.octets());
            }
            IpAddr::V6(addr) => {
                self.put_u16_ord(order, AFI_IPV6);
                self.put_u16(0);
                self.put_slice(&addr.octets());
            }
        }
    }
}

impl<T: BufMut> OrderedBufMut for T {}

pub fn nla_len(addr: IpAddr) -> usize {
    match addr {
        IpAddr::V4(_) => 4 + 4,
        IpAddr::V6(_) => 4 + 16,
    }
}

/// overwrite a u16 field of an already serialized packet
pub fn patch_u16(buf: &mut [u8], offset: usize, order: ByteOrder, value: u16) {
    let raw = match order {
        ByteOrder::Big => value.to_be_bytes(),
        ByteOrder::Little => value.to_le_bytes(),
    };
    buf[offset..offset + 2].copy_from_slice(&raw);
}

/// overwrite a u32 field of an already serialized packet
pub fn patch_u32(buf: &mut [u8], offset: usize, order: ByteOrder, value: u32) {
    let raw = match order {
        ByteOrder::Big => value.to_be_bytes(),
        ByteOrder::Little => value.to_le_bytes(),
    };
    buf[offset..offset + 4].copy_from_slice(&raw);
}

pub fn read_u16_at(buf: &[u8], offset: usize, order: ByteOrder) -> Result<u16, CodecError> {
    let mut reader = FieldReader::new(buf, order);
    reader.skip(offset)?;
    reader.u16()
}

pub fn read_u32_at(buf: &[u8], offset: usize, order: ByteOrder) -> Result<u32, CodecError> {
    let mut reader = FieldReader::new(buf, order);
    reader.skip(offset)?;
    reader.u32()
}

impl<'a> FieldReader<'a> {
    /// variable length unsigned integer as written by `bytes_varint`
    pub fn varint(&mut self) -> Result<usize, CodecError> {
        let mut rest: &[u8] = &self.buf[self.pos..];
        let before = rest.len();
        let value = rest.try_get_usize_varint()
            .map_err(|_| CodecError::TooShort { needed: 1 })?;
        self.pos += before - rest.len();
        Ok(value)
    }

    /// bytes prefixed with a varint length
    pub fn varint_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.varint()?;
        self.bytes(len)
    }
}
