use std::io;

/// Failure to decode a packet from the wire. Decode errors are never fatal for a connection:
///  the offending packet is logged and dropped.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("packet too short: needed {needed} more bytes")]
    TooShort { needed: usize },

    #[error("unknown packet type {0:#04x}")]
    UnknownPacketType(u8),

    #[error("malformed option chain: {0}")]
    BadOptionChain(&'static str),

    #[error("byte order mark {0:02x?} is not recognized")]
    BadByteOrderMark([u8; 4]),

    #[error("checksum mismatch: packet has {actual:#06x}, computed {expected:#06x}")]
    ChecksumMismatch { actual: u16, expected: u16 },

    #[error("unsupported address family {0}")]
    BadAddressFamily(u16),

    #[error("declared length {declared} does not match the actual length {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("malformed message record: {0}")]
    BadMessageRecord(&'static str),
}

/// Coarse classification of [RumError]s
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorKind {
    Configuration,
    ResourceExhaustion,
    Protocol,
    TransientNetwork,
    Timeout,
    InvalidHandle,
}

/// The error type of all public RUM operations. Each variant has the numeric code that RUM
///  applications know from the C API.
#[derive(Debug, thiserror::Error)]
pub enum RumError {
    #[error("instance handle is not valid")]
    InstanceInvalid,

    #[error("instance is closed")]
    InstanceClosed,

    #[error("queue handle is not valid")]
    QueueInvalid,

    #[error("queue is closed")]
    QueueClosed,

    #[error("too many instances (maximum is {0})")]
    TooManyInstances(usize),

    #[error("too many streams (maximum is {0})")]
    TooManyStreams(usize),

    #[error("connection is not valid")]
    ConnectionInvalid,

    #[error("bad message property: {0}")]
    BadMessageProperty(String),

    #[error("invalid configuration entry: {0}")]
    ConfigEntry(String),

    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("memory allocation failed: {0}")]
    MemoryAllocation(String),

    #[error("internal limit reached: {0}")]
    InternalLimit(String),

    #[error("bad control data: {0}")]
    BadControlData(String),

    #[error("bad address: {0}")]
    BadAddress(String),

    #[error("port is busy: {0}")]
    PortBusy(io::Error),

    #[error("connection establishment timed out after {0} ms")]
    EstablishTimeout(u64),

    #[error("connection establishment failed: {0}")]
    EstablishFailed(String),

    #[error("connection is not yet removed")]
    ConnectionNotRemoved,

    #[error("transmitter memory alert: pending queue is full")]
    MemoryAlert,

    #[error("engine did not stop in time: {0}")]
    StopTimeout(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl RumError {
    pub fn code(&self) -> u32 {
        match self {
            RumError::InstanceInvalid => 150,
            RumError::InstanceClosed => 151,
            RumError::QueueInvalid => 152,
            RumError::QueueClosed => 153,
            RumError::TooManyInstances(_) => 154,
            RumError::TooManyStreams(_) => 155,
            RumError::ConnectionInvalid => 156,
            RumError::BadMessageProperty(_) => 157,
            RumError::ConfigEntry(_) => 116,
            RumError::BadParameter(_) => 117,
            RumError::MemoryAllocation(_) => 110,
            RumError::InternalLimit(_) => 124,
            RumError::BadControlData(_) => 122,
            RumError::BadAddress(_) => 127,
            RumError::PortBusy(_) => 129,
            RumError::EstablishTimeout(_) => 52,
            RumError::EstablishFailed(_) => 51,
            RumError::ConnectionNotRemoved => 124,
            RumError::MemoryAlert => 24,
            RumError::StopTimeout(_) => 124,
            RumError::Io(_) => 100,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RumError::InstanceInvalid
            | RumError::InstanceClosed
            | RumError::QueueInvalid
            | RumError::QueueClosed
            | RumError::ConnectionInvalid => ErrorKind::InvalidHandle,

            RumError::TooManyInstances(_)
            | RumError::TooManyStreams(_)
            | RumError::MemoryAllocation(_)
            | RumError::InternalLimit(_)
            | RumError::MemoryAlert => ErrorKind::ResourceExhaustion,

            RumError::ConfigEntry(_)
            | RumError::BadParameter(_)
            | RumError::BadMessageProperty(_)
            | RumError::BadAddress(_) => ErrorKind::Configuration,

            RumError::BadControlData(_) => ErrorKind::Protocol,

            RumError::PortBusy(_)
            | RumError::EstablishFailed(_)
            | RumError::Io(_) => ErrorKind::TransientNetwork,

            RumError::EstablishTimeout(_)
            | RumError::ConnectionNotRemoved
            | RumError::StopTimeout(_) => ErrorKind::Timeout,
        }
    }
}

pub type RumResult<T> = Result<T, RumError>;
