//! The transport core of RUM, a reliable multicast messaging protocol in the spirit of PGM
//!  (RFC 3208), carried over point-to-point TCP connections between instances.
//!
//! ## Overview
//!
//! * An application *transmits* on named queues. Each transmit queue is a *stream*, identified
//!   by a 48 bit global stream id (GSI), whose packets carry 32 bit sequence numbers.
//! * The transmitter keeps a history window `[txw_trail, txw_lead)` of sent packets for repair,
//!   and periodically announces that window in source path messages (SPM).
//! * A receiver joins a stream when it sees the stream's first SPM, tracks its own window
//!   `[rxw_trail, rxw_lead)`, and requests missing packets with NAKs. The transmitter confirms
//!   a NAK with an NCF and sends the repair as RDATA.
//! * Reliability is *negative*: nothing is acknowledged, a packet that is not NAK'ed is assumed
//!   to have arrived. Packets that the transmitter trimmed from its history before they were
//!   repaired are reported to the receiving application as lost.
//! * Messages are batched into data packets. Messages too big for one packet are fragmented
//!   and reassembled by the receiver.
//!
//! ## Wire format
//!
//! A connection carries a byte stream of frames, each a u32 length (big endian) followed by the
//!  packet. There are two packet families that share the type byte at offset 4: connection
//!  control packets (types 0x40..0x43, see [codec::connection_packet]) and stream packets.
//!
//! Stream packets start with the common header. Multi-byte fields are in network byte order,
//!  unless the sending peer announced its native order through the byte order mark of its
//!  connect request:
//!
//! ```ascii
//!  0: source port (u16)
//!  2: destination port (u16)
//!  4: packet type (u8): SPM 0x00, ODATA 0x04, RDATA 0x05, NAK 0x08, NCF 0x0a
//!  5: options flags (u8): OPT_PRESENT, OPT_NETWORK
//!  6: checksum (u16) - CRC-16 of the packet, 0 if checksums are disabled
//!  8: GSI high (u32)
//! 12: GSI low (u16)
//! 14: TSDU length (u16)
//! ```
//!
//! The type specific body follows.
//!
//! ```ascii
//! SPM:         spm sqn (u32), trail (u32), lead (u32), NLA
//! ODATA/RDATA: data sqn (u32), trail (u32)
//! NAK/NCF:     nak sqn (u32), source NLA, group NLA
//!
//! NLA:         address family (u16: 1 for V4, 2 for V6), reserved (u16), address (4 or 16 bytes)
//! ```
//!
//! If OPT_PRESENT is set, an option chain follows the body. It starts with OPT_LENGTH: type 0x00,
//!  its own length 4 (u8), and the chain's total length (u16). Every other option is
//!
//! ```ascii
//! 0: type (u8) - the high bit marks the last option of the chain
//! 1: reserved (u8)
//! 2: length (u16) - length of the whole option including this prefix
//! 4: option data
//! ```
//!
//! Unknown option types are skipped. The payload (`TSDU length` bytes) comes last. For data
//!  packets it is a sequence of message records:
//!
//! ```ascii
//! 0: record length (u32) - number of bytes after this field
//! 4: property block (streams with message properties only)
//! *: message bytes
//! ```
//!
//! A record that does not fit into a packet is split across consecutive packets, each carrying
//!  a fragment option with the first fragment's sequence number, the byte offset, and the
//!  record length.
//!
//! ## Tasks
//!
//! Everything runs on tokio. Per instance there is a connection handler task with a reader and
//!  a writer task per connection, the transmitter's send round task, the receiver's NAK
//!  generator and timer tasks, a message announcer task per receive queue, and the event
//!  announcer that serializes all application callbacks. Stream state machines are synchronous
//!  and get the current time passed in, so they are tested under a paused clock.

pub mod buffers;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod receiver;
pub mod safe_converter;
pub mod seq;
pub mod transmitter;
