use crate::codec::packet_header::{PacketType, StreamPacket};
use crate::codec::verify_checksum;
use crate::connection::connection::Connection;
use crate::connection::PacketRouter;
use crate::events::{ConnectionEventType, ConnectionId};
use crate::receiver::Receiver;
use crate::transmitter::Transmitter;
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Routes stream packets from connections to the engines: NAKs to the transmitter, everything
///  else to the receiver. An instance that only transmits or only receives has no engine for
///  the other direction, and packets for it are dropped.
pub struct StreamDispatcher {
    transmitter: Option<Arc<Transmitter>>,
    receiver: Option<Arc<Receiver>>,
}

impl StreamDispatcher {
    pub fn new(transmitter: Option<Arc<Transmitter>>, receiver: Option<Arc<Receiver>>) -> StreamDispatcher {
        StreamDispatcher {
            transmitter,
            receiver,
        }
    }
}

#[async_trait]
impl PacketRouter for StreamDispatcher {
    async fn on_stream_packet(&self, connection: &Arc<Connection>, packet: BytesMut) {
        let order = connection.peer_order();
        if let Err(e) = verify_checksum(&packet, order) {
            warn!(msg_key = 4320, "dropping packet from {:?}: {}", connection.id(), e);
            return;
        }

        let (parsed, payload_offset) = match StreamPacket::deser(&packet, order) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("dropping unparseable packet from {:?}: {}", connection.id(), e);
                return;
            }
        };
        let now = Instant::now();

        match parsed.header.packet_type {
            PacketType::Nak => match &self.transmitter {
                Some(transmitter) => transmitter.on_nak(parsed.header.gsi, &parsed.nak_sqns(), now),
                None => trace!("no transmitter - dropping NAK for {:?}", parsed.header.gsi),
            },
            _ => match &self.receiver {
                Some(receiver) => receiver.on_packet(connection, &parsed, &packet[payload_offset..], now),
                None => trace!("no receiver - dropping {:?} for {:?}", parsed.header.packet_type, parsed.header.gsi),
            },
        }
    }

    async fn on_connection_down(&self, connection_id: ConnectionId, reason: ConnectionEventType) {
        debug!("{:?} is down ({:?}) - breaking its streams", connection_id, reason);
        if let Some(transmitter) = &self.transmitter {
            transmitter.on_connection_down(connection_id, reason);
        }
        if let Some(receiver) = &self.receiver {
            receiver.on_connection_down(connection_id, reason);
        }
    }
}
