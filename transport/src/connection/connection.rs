use crate::codec::byte_order::ByteOrder;
use crate::codec::connection_packet::ConnectionPacket;
use crate::codec::frame::{put_frame, FrameDecoder};
use crate::codec::PacketFamily;
use crate::connection::PacketRouter;
use crate::events::{ConnectionEventType, ConnectionId, ConnectionInfo, ConnectionListener};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, span, trace, warn, Instrument, Level};
use uuid::Uuid;

/// Life cycle of a connection:
///
/// ```ascii
/// Init -> Handshake -> Active -> Timeout | Closing -> Closed
///              \
///               -> Closed (rejected or failed handshake)
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    /// the socket is connected, nothing was exchanged yet
    Init,
    /// connect request / reply in flight
    Handshake,
    Active,
    Timeout,
    Closing,
    Closed,
}

/// Heartbeat settings agreed on during the handshake
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HeartbeatParams {
    pub timeout: Option<Duration>,
    pub interval: Option<Duration>,
    pub one_way: bool,
}

impl HeartbeatParams {
    pub const DISABLED: HeartbeatParams = HeartbeatParams {
        timeout: None,
        interval: None,
        one_way: false,
    };

    /// With one-way heartbeats only the initiating side sends heartbeats, and only the
    ///  accepting side watches for their absence
    pub fn sends_heartbeats(&self, is_inbound: bool) -> bool {
        self.timeout.is_some() && self.interval.is_some() && !(self.one_way && is_inbound)
    }

    pub fn checks_timeout(&self, is_inbound: bool) -> bool {
        self.timeout.is_some() && !(self.one_way && !is_inbound)
    }
}

/// What the handshake settles about the peer
#[derive(Clone)]
pub struct PeerParams {
    pub remote_instance_id: u32,
    pub peer_order: ByteOrder,
    pub heartbeat: HeartbeatParams,
    /// the listener that receives this connection's events
    pub owner: Arc<dyn ConnectionListener>,
}

/// This is an abstraction for writing framed packets to a connection's socket, introduced to
///  facilitate mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    async fn send_frames(&self, frames: &[u8]) -> anyhow::Result<()>;
}

#[async_trait]
impl FrameSink for tokio::sync::Mutex<OwnedWriteHalf> {
    async fn send_frames(&self, frames: &[u8]) -> anyhow::Result<()> {
        trace!("TCP socket: writing {} bytes", frames.len());
        self.lock().await
            .write_all(frames).await?;
        Ok(())
    }
}

/// A connection to a peer instance. It is created in [ConnectionState::Init] once the socket is
///  connected, and becomes active when [Connection::activate] records the handshake's outcome.
///  Packets for the peer are queued with [Connection::send_packet] and written by the
///  connection's fire-out task.
pub struct Connection {
    info: ConnectionInfo,
    local_order: ByteOrder,
    peer: OnceLock<PeerParams>,
    state: Mutex<ConnectionState>,
    last_receive: Mutex<Instant>,
    last_send: Mutex<Instant>,
    outbound: mpsc::UnboundedSender<Bytes>,
    is_invalid: AtomicBool,
}

impl Connection {
    pub fn new(info: ConnectionInfo, local_order: ByteOrder, now: Instant) -> (Arc<Connection>, mpsc::UnboundedReceiver<Bytes>) {
        let (outbound, receiver) = mpsc::unbounded_channel();
        let connection = Arc::new(Connection {
            info,
            local_order,
            peer: OnceLock::new(),
            state: Mutex::new(ConnectionState::Init),
            last_receive: Mutex::new(now),
            last_send: Mutex::new(now),
            outbound,
            is_invalid: AtomicBool::new(false),
        });
        (connection, receiver)
    }

    /// an active connection, skipping the handshake
    #[cfg(test)]
    pub fn established(
        info: ConnectionInfo,
        local_order: ByteOrder,
        peer_order: ByteOrder,
        heartbeat: HeartbeatParams,
        owner: Arc<dyn ConnectionListener>,
        now: Instant,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<Bytes>) {
        let remote_instance_id = info.remote_instance_id.unwrap_or_default();
        let (connection, outbound) = Connection::new(info, local_order, now);
        connection.begin_handshake();
        connection.activate(PeerParams { remote_instance_id, peer_order, heartbeat, owner }, now);
        (connection, outbound)
    }

    pub fn id(&self) -> ConnectionId {
        self.info.connection_id
    }

    /// The connection's description; the remote instance id is known once the handshake is done
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            remote_instance_id: self.peer.get()
                .map(|p| p.remote_instance_id)
                .or(self.info.remote_instance_id),
            ..self.info.clone()
        }
    }

    pub fn is_inbound(&self) -> bool {
        self.info.is_inbound
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.info.remote_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.info.local_addr
    }

    /// byte order of the packets this side sends
    pub fn local_order(&self) -> ByteOrder {
        self.local_order
    }

    /// byte order of the packets the peer sends; the local order until the handshake is done
    pub fn peer_order(&self) -> ByteOrder {
        self.peer.get()
            .map_or(self.local_order, |p| p.peer_order)
    }

    pub fn heartbeat(&self) -> HeartbeatParams {
        self.peer.get()
            .map_or(HeartbeatParams::DISABLED, |p| p.heartbeat)
    }

    pub fn owner(&self) -> Option<&Arc<dyn ConnectionListener>> {
        self.peer.get()
            .map(|p| &p.owner)
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn set_state(&self, state: ConnectionState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!("{:?}: {:?} -> {:?}", self.id(), *current, state);
            *current = state;
        }
    }

    pub fn begin_handshake(&self) {
        self.set_state(ConnectionState::Handshake);
    }

    /// Records the outcome of a successful handshake and makes the connection active. Returns
    ///  `false` if the connection is not in its handshake.
    pub fn activate(&self, peer: PeerParams, now: Instant) -> bool {
        let mut state = lock(&self.state);
        if *state != ConnectionState::Handshake || self.peer.set(peer).is_err() {
            warn!("{:?}: cannot activate a connection in state {:?}", self.id(), *state);
            return false;
        }
        debug!("{:?}: {:?} -> {:?}", self.id(), *state, ConnectionState::Active);
        *state = ConnectionState::Active;
        *lock(&self.last_receive) = now;
        *lock(&self.last_send) = now;
        true
    }

    pub fn is_active(&self) -> bool {
        !self.is_invalid.load(Ordering::Acquire) && self.state() == ConnectionState::Active
    }

    /// marks the connection as going away: no more packets are accepted for sending
    pub fn invalidate(&self) {
        self.is_invalid.store(true, Ordering::Release);
    }

    pub fn send_packet(&self, packet: Bytes) -> bool {
        if self.is_invalid.load(Ordering::Acquire) {
            trace!("{:?} is invalid - dropping outbound packet", self.id());
            return false;
        }
        self.outbound.send(packet).is_ok()
    }

    pub fn send_connection_packet(&self, packet: &ConnectionPacket) -> bool {
        let mut buf = BytesMut::new();
        packet.ser(&mut buf, self.local_order);
        self.send_packet(buf.freeze())
    }

    pub fn on_received(&self, now: Instant) {
        *lock(&self.last_receive) = now;
    }

    fn on_sent(&self, now: Instant) {
        *lock(&self.last_send) = now;
    }

    pub fn is_heartbeat_expired(&self, now: Instant) -> bool {
        let heartbeat = self.heartbeat();
        match heartbeat.timeout {
            Some(timeout) if heartbeat.checks_timeout(self.info.is_inbound) => {
                now.saturating_duration_since(*lock(&self.last_receive)) > timeout
            }
            _ => false,
        }
    }

    pub fn is_heartbeat_due(&self, now: Instant) -> bool {
        let heartbeat = self.heartbeat();
        match heartbeat.interval {
            Some(interval) if heartbeat.sends_heartbeats(self.info.is_inbound) => {
                now.saturating_duration_since(*lock(&self.last_send)) >= interval
            }
            _ => false,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Notification from a connection's tasks to the connection handler
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ConnectionDown {
    pub connection_id: ConnectionId,
    pub reason: ConnectionEventType,
}

/// Writes queued packets to the socket, coalescing everything that is queued into a single
///  write. Runs until it is aborted or the socket fails.
pub async fn fire_out_loop(
    connection: Arc<Connection>,
    sink: Arc<dyn FrameSink>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    down: mpsc::UnboundedSender<ConnectionDown>,
) {
    let mut frames = BytesMut::new();
    while let Some(packet) = outbound.recv().await {
        frames.clear();
        put_frame(&mut frames, &packet);
        while let Ok(packet) = outbound.try_recv() {
            put_frame(&mut frames, &packet);
        }

        if let Err(e) = sink.send_frames(&frames).await {
            debug!("{:?}: error writing to socket: {}", connection.id(), e);
            let _ = down.send(ConnectionDown { connection_id: connection.id(), reason: ConnectionEventType::ConnectionBroke });
            return;
        }
        connection.on_sent(Instant::now());
    }
    trace!("{:?}: fire-out loop terminated", connection.id());
}

/// Reads framed packets from the socket and dispatches them: connection packets are handled
///  here, stream packets go to the router.
pub async fn read_loop(
    connection: Arc<Connection>,
    mut read_half: OwnedReadHalf,
    mut decoder: FrameDecoder,
    router: Arc<dyn PacketRouter>,
    down: mpsc::UnboundedSender<ConnectionDown>,
) {
    let reason = loop {
        match next_frame(&mut read_half, &mut decoder).await {
            Ok(Some(frame)) => {
                connection.on_received(Instant::now());

                let correlation_id = Uuid::new_v4();
                let span = span!(Level::TRACE, "packet_received", ?correlation_id);

                if let Some(reason) = on_frame(&connection, frame, router.as_ref()).instrument(span).await {
                    break reason;
                }
            }
            Ok(None) => {
                debug!("{:?}: peer closed the socket", connection.id());
                break ConnectionEventType::ConnectionBroke;
            }
            Err(e) => {
                debug!("{:?}: error reading from socket: {}", connection.id(), e);
                break ConnectionEventType::ConnectionBroke;
            }
        }
    };
    let _ = down.send(ConnectionDown { connection_id: connection.id(), reason });
}

/// reads until the decoder yields a frame; `Ok(None)` on EOF
pub async fn next_frame(read_half: &mut OwnedReadHalf, decoder: &mut FrameDecoder) -> anyhow::Result<Option<BytesMut>> {
    loop {
        if let Some(frame) = decoder.next_frame()? {
            return Ok(Some(frame));
        }
        if read_half.read_buf(decoder.read_buf()).await? == 0 {
            return Ok(None);
        }
    }
}

async fn on_frame(connection: &Arc<Connection>, frame: BytesMut, router: &dyn PacketRouter) -> Option<ConnectionEventType> {
    trace!("{:?}: received frame of {} bytes", connection.id(), frame.len());

    match PacketFamily::of(&frame) {
        Ok(PacketFamily::Stream) => {
            router.on_stream_packet(connection, frame).await;
            None
        }
        Ok(PacketFamily::Connection) => match ConnectionPacket::deser(&frame) {
            Ok((ConnectionPacket::Heartbeat, _)) => {
                trace!("{:?}: heartbeat", connection.id());
                None
            }
            Ok((ConnectionPacket::Close, _)) => {
                debug!("{:?}: peer closed the connection", connection.id());
                Some(ConnectionEventType::ConnectionClosed)
            }
            Ok((other, _)) => {
                warn!("{:?}: unexpected {:?} on an established connection - ignoring", connection.id(), other.packet_type());
                None
            }
            Err(e) => {
                warn!("{:?}: unparsable connection packet - dropping: {}", connection.id(), e);
                None
            }
        },
        Err(e) => {
            warn!("{:?}: truncated packet - dropping: {}", connection.id(), e);
            None
        }
    }
}
