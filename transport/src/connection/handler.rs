use crate::codec::byte_order::ByteOrder;
use crate::codec::connection_packet::{ConnectReply, ConnectRequest, ConnectionPacket, MAX_CONNECT_MESSAGE_LEN};
use crate::codec::frame::{put_frame, FrameDecoder};
use crate::config::RumConfig;
use crate::connection::connection::{fire_out_loop, next_frame, read_loop, Connection, ConnectionDown, ConnectionState, FrameSink, HeartbeatParams, PeerParams};
use crate::connection::listeners::{ConnectionListeners, ListenerId};
use crate::connection::{EstablishMethod, EstablishParams, PacketRouter};
use crate::error::{RumError, RumResult};
use crate::events::{ConnectionEvent, ConnectionEventType, ConnectionId, ConnectionInfo, ConnectionListener, EventAnnouncer};
use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

const HEARTBEAT_SCAN_INTERVAL: Duration = Duration::from_millis(50);
const CLOSE_WAIT: Duration = Duration::from_millis(2500);
const CLOSE_PACKET_WRITE_TIMEOUT: Duration = Duration::from_millis(500);
const LISTEN_BACKLOG: u32 = 1024;

enum Command {
    Establish {
        connection_id: ConnectionId,
        params: EstablishParams,
    },
    Close {
        connection_id: ConnectionId,
        done: oneshot::Sender<()>,
    },
    Stop,
}

struct ConnectionEntry {
    connection: Arc<Connection>,
    sink: Arc<dyn FrameSink>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for ConnectionEntry {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct Shared {
    config: Arc<RumConfig>,
    instance_id: u32,
    local_order: ByteOrder,
    local_port: u16,
    announcer: Arc<EventAnnouncer>,
    router: Arc<dyn PacketRouter>,
    listeners: ConnectionListeners,
    connections: RwLock<FxHashMap<ConnectionId, ConnectionEntry>>,
    next_connection_id: AtomicU64,
    down: mpsc::UnboundedSender<ConnectionDown>,
}

/// Owns all connections of an instance. A single handler task accepts inbound connections,
///  processes establish / close requests, watches heartbeats and removes connections that
///  went down. Handshakes run as separate tasks so a slow peer does not hold up the others.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

impl ConnectionManager {
    pub async fn start(
        config: Arc<RumConfig>,
        instance_id: u32,
        announcer: Arc<EventAnnouncer>,
        router: Arc<dyn PacketRouter>,
    ) -> RumResult<ConnectionManager> {
        let bind_addr = SocketAddr::new(config.listen_addr, config.server_port);
        let listener = Self::bind(&config, bind_addr)
            .map_err(|e| {
                error!(msg_key = 1128, "binding {:?} for inbound connections failed: {}", bind_addr, e);
                RumError::PortBusy(e)
            })?;
        let local_addr = listener.local_addr()?;

        let (down, down_receiver) = mpsc::unbounded_channel();
        let (commands, command_receiver) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            config,
            instance_id,
            local_order: ByteOrder::native(),
            local_port: local_addr.port(),
            announcer,
            router,
            listeners: ConnectionListeners::default(),
            connections: Default::default(),
            next_connection_id: AtomicU64::new(1),
            down,
        });

        let handle = tokio::spawn(Self::do_loop(shared.clone(), listener, command_receiver, down_receiver));
        Ok(ConnectionManager {
            shared,
            local_addr,
            commands,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn bind(config: &RumConfig, bind_addr: SocketAddr) -> std::io::Result<TcpListener> {
        let socket = if bind_addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        socket.set_reuseaddr(true)?;
        socket.set_recv_buffer_size(config.socket_receive_buffer_bytes)?;
        socket.set_send_buffer_size(config.socket_send_buffer_bytes)?;
        socket.bind(bind_addr)?;
        socket.listen(LISTEN_BACKLOG)
    }

    /// the address inbound connections are accepted on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn instance_id(&self) -> u32 {
        self.shared.instance_id
    }

    /// Starts establishing a connection. The outcome is reported to `params.listener` as an
    ///  [ConnectionEventType::EstablishSuccess], [ConnectionEventType::EstablishFailure] or
    ///  [ConnectionEventType::EstablishTimeout] event carrying the returned id.
    pub fn establish(&self, params: EstablishParams) -> RumResult<ConnectionId> {
        params.validate()
            .map_err(|e| RumError::BadParameter(e.to_string()))?;

        let target = SocketAddr::new(params.address, params.port);
        if params.method == EstablishMethod::UseExisting {
            if let Some(existing) = self.shared.find_active(target) {
                debug!("reusing {:?} to {:?}", existing.id(), target);
                self.shared.announcer.announce_connection_event(&params.listener, ConnectionEvent {
                    event_type: ConnectionEventType::EstablishSuccess,
                    connection: existing.info(),
                    details: "existing connection".to_string(),
                });
                return Ok(existing.id());
            }
        }

        let connection_id = self.shared.new_connection_id();
        debug!("establishing {:?} to {:?}", connection_id, target);
        self.commands.send(Command::Establish { connection_id, params })
            .map_err(|_| RumError::InstanceClosed)?;
        Ok(connection_id)
    }

    /// Closes a connection, notifying the peer. Waits until the handler removed the connection,
    ///  which includes notifying the engines of the streams riding on it.
    pub async fn close(&self, connection_id: ConnectionId) -> RumResult<()> {
        let connection = self.connection(connection_id)
            .ok_or(RumError::ConnectionInvalid)?;
        connection.invalidate();

        let (done, removed) = oneshot::channel();
        self.commands.send(Command::Close { connection_id, done })
            .map_err(|_| RumError::InstanceClosed)?;

        match timeout(CLOSE_WAIT, removed).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RumError::InstanceClosed),
            Err(_) => {
                warn!("{:?} was not removed within {:?}", connection_id, CLOSE_WAIT);
                Err(RumError::ConnectionNotRemoved)
            }
        }
    }

    pub fn connection(&self, connection_id: ConnectionId) -> Option<Arc<Connection>> {
        self.shared.read_connections()
            .get(&connection_id)
            .map(|e| e.connection.clone())
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.read_connections()
            .values()
            .map(|e| e.connection.clone())
            .collect()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) -> RumResult<ListenerId> {
        self.shared.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> RumResult<()> {
        self.shared.listeners.remove(id)
    }

    /// Closes all connections and terminates the handler task, returning `false` if that did not
    ///  happen within `max_wait`
    pub async fn stop(&self, max_wait: Duration) -> bool {
        let handle = match self.handle.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(handle) => handle,
            None => return true,
        };
        let _ = self.commands.send(Command::Stop);

        match timeout(max_wait, handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!("connection handler did not stop within {:?}", max_wait);
                false
            }
        }
    }

    async fn do_loop(
        shared: Arc<Shared>,
        listener: TcpListener,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut down: mpsc::UnboundedReceiver<ConnectionDown>,
    ) {
        info!(msg_key = 5069, "connection handler of {} is running on {:?}", shared.config.display_name(), listener.local_addr().ok());

        let mut pending = JoinSet::new();
        let mut heartbeat_scan = interval(HEARTBEAT_SCAN_INTERVAL);
        heartbeat_scan.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        let correlation_id = Uuid::new_v4();
                        let span = span!(Level::DEBUG, "accept", ?correlation_id, ?remote_addr);
                        pending.spawn(shared.clone().accept_inbound(stream, remote_addr).instrument(span));
                    }
                    Err(e) => warn!(msg_key = 1127, "accepting an inbound connection failed: {}", e),
                },
                cmd = commands.recv() => match cmd {
                    Some(Command::Establish { connection_id, params }) => {
                        let correlation_id = Uuid::new_v4();
                        let span = span!(Level::DEBUG, "establish", ?correlation_id, ?connection_id);
                        pending.spawn(shared.clone().establish_outbound(connection_id, params).instrument(span));
                    }
                    Some(Command::Close { connection_id, done }) => {
                        shared.remove_connection(connection_id, ConnectionEventType::ConnectionClosed, true).await;
                        let _ = done.send(());
                    }
                    Some(Command::Stop) | None => break,
                },
                Some(notification) = down.recv() => {
                    shared.remove_connection(notification.connection_id, notification.reason, false).await;
                }
                _ = heartbeat_scan.tick() => {
                    shared.scan_heartbeats(Instant::now()).await;
                }
                Some(joined) = pending.join_next() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("connection handshake task panicked: {}", e);
                        }
                    }
                }
            }
        }

        pending.shutdown().await;
        let ids = shared.read_connections().keys().copied().collect::<Vec<_>>();
        for connection_id in ids {
            shared.remove_connection(connection_id, ConnectionEventType::ConnectionClosed, true).await;
        }
        info!(msg_key = 5067, "connection handler of {} was stopped", shared.config.display_name());
    }
}

fn millis(duration: Option<Duration>) -> u32 {
    duration
        .map(|d| d.as_millis().min(u32::MAX as u128) as u32)
        .unwrap_or(0)
}

fn from_millis(millis: u32) -> Option<Duration> {
    match millis {
        0 => None,
        n => Some(Duration::from_millis(n.into())),
    }
}

impl Shared {
    fn read_connections(&self) -> RwLockReadGuard<'_, FxHashMap<ConnectionId, ConnectionEntry>> {
        self.connections.read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_connections(&self) -> RwLockWriteGuard<'_, FxHashMap<ConnectionId, ConnectionEntry>> {
        self.connections.write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn new_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed))
    }

    fn max_frame_len(&self) -> usize {
        self.config.packet_size.max(MAX_CONNECT_MESSAGE_LEN + 256)
    }

    fn find_active(&self, remote_addr: SocketAddr) -> Option<Arc<Connection>> {
        self.read_connections()
            .values()
            .map(|e| &e.connection)
            .find(|c| !c.is_inbound() && c.remote_addr() == remote_addr && c.is_active())
            .cloned()
    }

    fn serialize(&self, packet: &ConnectionPacket) -> BytesMut {
        let mut raw = BytesMut::new();
        packet.ser(&mut raw, self.local_order);
        let mut framed = BytesMut::with_capacity(raw.len() + 4);
        put_frame(&mut framed, &raw);
        framed
    }

    async fn establish_outbound(self: Arc<Self>, connection_id: ConnectionId, params: EstablishParams) {
        let remote_addr = SocketAddr::new(params.address, params.port);
        let started = Instant::now();

        let (event_type, info, details) = match timeout(params.establish_timeout, self.connect_and_handshake(connection_id, &params)).await {
            Ok(Ok(connection)) => {
                info!("{:?} to {:?} established", connection_id, remote_addr);
                (ConnectionEventType::EstablishSuccess, connection.info(), String::new())
            }
            Ok(Err(e)) => {
                warn!(msg_key = 1127, "establishing {:?} to {:?} failed after {:?}: {}", connection_id, remote_addr, started.elapsed(), e);
                (ConnectionEventType::EstablishFailure, Self::unestablished_info(connection_id, &params), e.to_string())
            }
            Err(_) => {
                warn!("establishing {:?} to {:?} timed out after {:?}", connection_id, remote_addr, params.establish_timeout);
                (ConnectionEventType::EstablishTimeout, Self::unestablished_info(connection_id, &params), format!("no connection after {:?}", params.establish_timeout))
            }
        };

        self.announcer.announce_connection_event(&params.listener, ConnectionEvent {
            event_type,
            connection: info,
            details,
        });
    }

    fn unestablished_info(connection_id: ConnectionId, params: &EstablishParams) -> ConnectionInfo {
        ConnectionInfo {
            connection_id,
            remote_addr: SocketAddr::new(params.address, params.port),
            local_addr: None,
            remote_instance_id: None,
            is_inbound: false,
            connect_message: params.connect_message.clone(),
        }
    }

    async fn connect_and_handshake(&self, connection_id: ConnectionId, params: &EstablishParams) -> anyhow::Result<Arc<Connection>> {
        let remote_addr = SocketAddr::new(params.address, params.port);

        let socket = if remote_addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        socket.set_recv_buffer_size(self.config.socket_receive_buffer_bytes)?;
        socket.set_send_buffer_size(self.config.socket_send_buffer_bytes)?;
        if let Some(tx_interface) = self.config.tx_interface {
            socket.bind(SocketAddr::new(tx_interface, 0))?;
        }

        trace!("connecting to {:?}", remote_addr);
        let stream = socket.connect(remote_addr).await?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let (mut read_half, mut write_half) = stream.into_split();

        let (connection, outbound) = Connection::new(ConnectionInfo {
            connection_id,
            remote_addr,
            local_addr: Some(local_addr),
            remote_instance_id: None,
            is_inbound: false,
            connect_message: params.connect_message.clone(),
        }, self.local_order, Instant::now());

        connection.begin_handshake();
        let mut decoder = FrameDecoder::new(self.max_frame_len());
        let peer = match self.outbound_handshake(params, local_addr, &mut read_half, &mut write_half, &mut decoder).await {
            Ok(peer) => peer,
            Err(e) => {
                connection.set_state(ConnectionState::Closed);
                return Err(e);
            }
        };
        if !connection.activate(peer, Instant::now()) {
            bail!("{:?} could not be activated", connection_id);
        }
        Ok(self.register(connection, outbound, read_half, write_half, decoder))
    }

    /// sends the connect request and waits for the reply
    async fn outbound_handshake(
        &self,
        params: &EstablishParams,
        local_addr: SocketAddr,
        read_half: &mut OwnedReadHalf,
        write_half: &mut OwnedWriteHalf,
        decoder: &mut FrameDecoder,
    ) -> anyhow::Result<PeerParams> {
        let remote_addr = SocketAddr::new(params.address, params.port);
        let request = ConnectionPacket::ConnectRequest(ConnectRequest {
            instance_id: self.instance_id,
            heartbeat_timeout_millis: millis(params.heartbeat_timeout),
            heartbeat_interval_millis: millis(params.heartbeat_interval),
            one_way_heartbeat: params.one_way_heartbeat,
            source_port: self.local_port,
            source_addr: local_addr.ip(),
            connect_message: params.connect_message.clone(),
        });
        write_half.write_all(&self.serialize(&request)).await?;

        let frame = next_frame(read_half, decoder).await?
            .ok_or_else(|| anyhow!("{:?} closed the connection during the handshake", remote_addr))?;
        let (reply, peer_order) = match ConnectionPacket::deser(&frame)? {
            (ConnectionPacket::ConnectReply(reply), order) => (reply, order),
            (other, _) => bail!("expected a connect reply, received {:?}", other.packet_type()),
        };
        if !reply.accepted {
            bail!("{:?} rejected the connection", remote_addr);
        }

        Ok(PeerParams {
            remote_instance_id: reply.instance_id,
            peer_order,
            heartbeat: HeartbeatParams {
                timeout: params.heartbeat_timeout,
                interval: params.heartbeat_interval,
                one_way: params.one_way_heartbeat,
            },
            owner: params.listener.clone(),
        })
    }

    async fn accept_inbound(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) {
        let establish_timeout = self.config.advanced.receiver_connection_establish_timeout;
        match timeout(establish_timeout, self.clone().do_accept_inbound(stream, remote_addr)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(msg_key = 1127, "inbound connection from {:?} failed: {}", remote_addr, e),
            Err(_) => warn!("no connect request from {:?} within {:?}", remote_addr, establish_timeout),
        }
    }

    async fn do_accept_inbound(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) -> anyhow::Result<()> {
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr().ok();
        let (mut read_half, mut write_half) = stream.into_split();

        let mut decoder = FrameDecoder::new(self.max_frame_len());
        let frame = next_frame(&mut read_half, &mut decoder).await?
            .ok_or_else(|| anyhow!("{:?} closed the connection before sending a connect request", remote_addr))?;
        let (request, peer_order) = match ConnectionPacket::deser(&frame)? {
            (ConnectionPacket::ConnectRequest(request), order) => (request, order),
            (other, _) => bail!("expected a connect request, received {:?}", other.packet_type()),
        };
        debug!("connect request from {:?}: instance {}, peer byte order {:?}", remote_addr, request.instance_id, peer_order);

        let (connection, outbound) = Connection::new(ConnectionInfo {
            connection_id: self.new_connection_id(),
            remote_addr,
            local_addr,
            remote_instance_id: Some(request.instance_id),
            is_inbound: true,
            connect_message: request.connect_message.clone(),
        }, self.local_order, Instant::now());
        connection.begin_handshake();

        let owner = self.announcer.offer_connection(self.listeners.snapshot(), ConnectionEvent {
            event_type: ConnectionEventType::NewConnection,
            connection: connection.info(),
            details: String::new(),
        }).await?;

        let reply = ConnectionPacket::ConnectReply(ConnectReply {
            accepted: owner.is_some(),
            instance_id: self.instance_id,
            heartbeat_timeout_millis: request.heartbeat_timeout_millis,
        });
        write_half.write_all(&self.serialize(&reply)).await?;

        let owner = match owner {
            Some(owner) => owner,
            None => {
                info!("no connection listener accepted the connection from {:?}", remote_addr);
                connection.set_state(ConnectionState::Closed);
                return Ok(());
            }
        };

        let peer = PeerParams {
            remote_instance_id: request.instance_id,
            peer_order,
            heartbeat: HeartbeatParams {
                timeout: from_millis(request.heartbeat_timeout_millis),
                interval: from_millis(request.heartbeat_interval_millis),
                one_way: request.one_way_heartbeat,
            },
            owner: owner.clone(),
        };
        if !connection.activate(peer, Instant::now()) {
            bail!("{:?} from {:?} could not be activated", connection.id(), remote_addr);
        }
        let connection = self.register(connection, outbound, read_half, write_half, decoder);
        info!("accepted {:?} from {:?}", connection.id(), remote_addr);

        self.announcer.announce_connection_event(&owner, ConnectionEvent {
            event_type: ConnectionEventType::ConnectionReady,
            connection: connection.info(),
            details: String::new(),
        });
        Ok(())
    }

    /// Starts the reader and fire-out tasks of an active connection and adds it to the
    ///  connection table
    fn register(
        &self,
        connection: Arc<Connection>,
        outbound: mpsc::UnboundedReceiver<Bytes>,
        read_half: OwnedReadHalf,
        write_half: OwnedWriteHalf,
        decoder: FrameDecoder,
    ) -> Arc<Connection> {
        let sink: Arc<dyn FrameSink> = Arc::new(tokio::sync::Mutex::new(write_half));

        let tasks = vec![
            tokio::spawn(fire_out_loop(connection.clone(), sink.clone(), outbound, self.down.clone())),
            tokio::spawn(read_loop(connection.clone(), read_half, decoder, self.router.clone(), self.down.clone())),
        ];

        self.write_connections().insert(connection.id(), ConnectionEntry {
            connection: connection.clone(),
            sink,
            tasks,
        });
        connection
    }

    async fn scan_heartbeats(&self, now: Instant) {
        let mut expired = Vec::new();
        for entry in self.read_connections().values() {
            let connection = &entry.connection;
            if !connection.is_active() {
                continue;
            }
            if connection.is_heartbeat_expired(now) {
                expired.push(connection.id());
            }
            else if connection.is_heartbeat_due(now) {
                trace!("{:?}: sending heartbeat", connection.id());
                connection.send_connection_packet(&ConnectionPacket::Heartbeat);
            }
        }

        for connection_id in expired {
            warn!(msg_key = 4224, "{:?} is no longer valid: no heartbeat within {:?}", connection_id,
                self.read_connections().get(&connection_id).and_then(|e| e.connection.heartbeat().timeout));
            self.remove_connection(connection_id, ConnectionEventType::ConnectionHeartbeatTimeout, false).await;
        }
    }

    /// Removes a connection: the engines drop the streams riding on it, and its owner is
    ///  notified. `notify_peer` sends a close packet before the socket is dropped.
    async fn remove_connection(&self, connection_id: ConnectionId, reason: ConnectionEventType, notify_peer: bool) {
        let entry = match self.write_connections().remove(&connection_id) {
            Some(entry) => entry,
            None => {
                trace!("{:?} was already removed", connection_id);
                return;
            }
        };
        let connection = entry.connection.clone();
        connection.invalidate();
        connection.set_state(if reason == ConnectionEventType::ConnectionHeartbeatTimeout {
            ConnectionState::Timeout
        }
        else {
            ConnectionState::Closing
        });

        if notify_peer {
            let close = self.serialize(&ConnectionPacket::Close);
            match timeout(CLOSE_PACKET_WRITE_TIMEOUT, entry.sink.send_frames(&close)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("{:?}: sending close packet failed: {}", connection_id, e),
                Err(_) => debug!("{:?}: sending close packet timed out", connection_id),
            }
        }
        drop(entry);

        self.router.on_connection_down(connection_id, reason).await;
        connection.set_state(ConnectionState::Closed);
        info!("{:?} to {:?} was removed: {:?}", connection_id, connection.remote_addr(), reason);

        if let Some(owner) = connection.owner() {
            self.announcer.announce_connection_event(owner, ConnectionEvent {
                event_type: reason,
                connection: connection.info(),
                details: if notify_peer { "closed locally".to_string() } else { String::new() },
            });
        }
    }
}
