use crate::codec::byte_order::{ByteOrder, FieldReader, OrderedBufMut};
use crate::error::CodecError;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use bytes::BufMut;
use bytes_varint::VarIntSupportMut;
use ordered_float::OrderedFloat;

pub const MAX_PROPERTY_NAME_LEN: usize = 1024;

const PROP_TYPE_INT32: u8 = 1;
const PROP_TYPE_INT64: u8 = 2;
const PROP_TYPE_DOUBLE: u8 = 3;
const PROP_TYPE_BYTES: u8 = 4;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PropertyValue {
    Int32(i32),
    Int64(i64),
    Double(OrderedFloat<f64>),
    Bytes(Vec<u8>),
}

/// A named, typed value that travels with a message on streams that have message properties
///  enabled
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MessageProperty {
    pub name: String,
    pub value: PropertyValue,
}

impl MessageProperty {
    pub fn new(name: impl Into<String>, value: PropertyValue) -> MessageProperty {
        MessageProperty { name: name.into(), value }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("property name must not be empty");
        }
        if self.name.len() > MAX_PROPERTY_NAME_LEN {
            anyhow::bail!("property name {} exceeds the maximum length of {}", self.name, MAX_PROPERTY_NAME_LEN);
        }
        Ok(())
    }
}

/// Serializes a property block: varint count, then for each property the varint-prefixed name,
///  a type byte and the value.
pub fn ser_properties(properties: &[MessageProperty], buf: &mut impl BufMut, order: ByteOrder) {
    buf.put_usize_varint(properties.len());
    for prop in properties {
        buf.put_usize_varint(prop.name.len());
        buf.put_slice(prop.name.as_bytes());
        match &prop.value {
            PropertyValue::Int32(v) => {
                buf.put_u8(PROP_TYPE_INT32);
                buf.put_u32_ord(order, *v as u32);
            }
            PropertyValue::Int64(v) => {
                buf.put_u8(PROP_TYPE_INT64);
                buf.put_u64_ord(order, *v as u64);
            }
            PropertyValue::Double(v) => {
                buf.put_u8(PROP_TYPE_DOUBLE);
                buf.put_u64_ord(order, v.0.to_bits());
            }
            PropertyValue::Bytes(v) => {
                buf.put_u8(PROP_TYPE_BYTES);
                buf.put_usize_varint(v.len());
                buf.put_slice(v);
            }
        }
    }
}

fn deser_properties(reader: &mut FieldReader) -> Result<Vec<MessageProperty>, CodecError> {
    let count = reader.varint()?;
    if count > reader.remaining() {
        return Err(CodecError::BadMessageRecord("property count exceeds the record"));
    }

    let mut result = Vec::with_capacity(count);
    for _ in 0..count {
        let name = std::str::from_utf8(reader.varint_bytes()?)
            .map_err(|_| CodecError::BadMessageRecord("property name is not valid UTF-8"))?
            .to_string();
        let value = match reader.u8()? {
            PROP_TYPE_INT32 => PropertyValue::Int32(reader.u32()? as i32),
            PROP_TYPE_INT64 => PropertyValue::Int64(reader.u64()? as i64),
            PROP_TYPE_DOUBLE => PropertyValue::Double(OrderedFloat(f64::from_bits(reader.u64()?))),
            PROP_TYPE_BYTES => PropertyValue::Bytes(reader.varint_bytes()?.to_vec()),
            _ => return Err(CodecError::BadMessageRecord("unknown property type")),
        };
        result.push(MessageProperty { name, value });
    }
    Ok(result)
}

/// Length prefix of every message record in a data packet
pub const RECORD_HEADER_LEN: usize = size_of::<u32>();

/// Writes one message record: u32 length of the rest of the record, the serialized property
///  block (if the stream has properties enabled), and the message bytes.
pub fn ser_record(buf: &mut impl BufMut, order: ByteOrder, property_block: Option<&[u8]>, message: &[u8]) {
    let props_len = property_block.map(|b| b.len()).unwrap_or(0);
    buf.put_u32_ord(order, (props_len + message.len()).prechecked_cast());
    if let Some(block) = property_block {
        buf.put_slice(block);
    }
    buf.put_slice(message);
}

pub fn record_len(property_block: Option<&[u8]>, message: &[u8]) -> usize {
    RECORD_HEADER_LEN + property_block.map(|b| b.len()).unwrap_or(0) + message.len()
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ParsedRecord<'a> {
    pub properties: Vec<MessageProperty>,
    pub message: &'a [u8],
}

/// Splits a data packet's payload (or a reassembled fragmented record) into message records
pub fn parse_records(payload: &[u8], order: ByteOrder, with_properties: bool) -> Result<Vec<ParsedRecord<'_>>, CodecError> {
    let mut reader = FieldReader::new(payload, order);
    let mut result = Vec::new();
    while reader.remaining() > 0 {
        let record_len: usize = reader.u32()?.safe_cast();
        let record = reader.bytes(record_len)?;
        result.push(parse_record_body(record, order, with_properties)?);
    }
    Ok(result)
}

fn parse_record_body(record: &[u8], order: ByteOrder, with_properties: bool) -> Result<ParsedRecord<'_>, CodecError> {
    let mut reader = FieldReader::new(record, order);
    let properties = if with_properties {
        deser_properties(&mut reader)?
    }
    else {
        Vec::new()
    };
    Ok(ParsedRecord {
        properties,
        message: reader.rest(),
    })
}
