//! The receiver engine: receive queues, the streams that feed them, and the NAK generator
//!  and housekeeping tasks.
//!
//! A stream comes into existence with its first SPM, which names the queue it belongs to.
//!  From then on its data, SPMs and NCFs are processed under the stream's lock by the
//!  [rx_stream::RxStream] core. What that produces is handed on without holding locks:
//!  messages to the queue's message announcer task, events to the instance's event announcer,
//!  NAKs to the stream's connection.

pub mod memory_alert;
pub mod nak;
pub mod reassembly;
pub mod rx_stream;

use crate::buffers::buffer_pool::BufferPool;
use crate::codec::options::{Reliability, MAX_QUEUE_NAME_LEN};
use crate::codec::packet_header::{Gsi, PacketType, StreamPacket};
use crate::config::RumConfig;
use crate::connection::connection::Connection;
use crate::error::{RumError, RumResult};
use crate::events::{ConnectionEventType, ConnectionId, EventAnnouncer, EventType, StreamEvent, StreamEventHandler};
use crate::receiver::memory_alert::MemoryAlert;
use crate::receiver::rx_stream::{DataInfo, DeliveryKind, RxDelivery, RxMessage, RxOutput, RxPacket, RxStream, RxStreamSetup, RxStreamStats, SpmInfo};
use crate::safe_converter::PrecheckedCast;
#[cfg(test)] use mockall::automock;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::hash_map::Entry;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, trace, warn};

#[cfg_attr(test, automock)]
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, message: &RxMessage);
}

#[cfg_attr(test, automock)]
pub trait PacketHandler: Send + Sync + 'static {
    fn on_packet(&self, packet: &RxPacket);
}

/// What a queue's acceptor gets to see of a newly announced stream
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NewStreamInfo {
    pub gsi: Gsi,
    pub queue_name: Option<String>,
    pub connection_id: ConnectionId,
    pub reliability: Reliability,
    pub msg_properties: bool,
}

/// Decides which new streams a queue takes, for queues that are not selected by name
#[cfg_attr(test, automock)]
pub trait StreamAcceptor: Send + Sync + 'static {
    fn accept_stream(&self, stream: &NewStreamInfo) -> bool;
}

#[derive(Clone)]
pub enum QueueSelector {
    Name(String),
    Acceptor(Arc<dyn StreamAcceptor>),
}

#[derive(Clone)]
pub enum DeliveryHandler {
    Messages(Arc<dyn MessageHandler>),
    Packets(Arc<dyn PacketHandler>),
}

impl DeliveryHandler {
    fn kind(&self) -> DeliveryKind {
        match self {
            DeliveryHandler::Messages(_) => DeliveryKind::Messages,
            DeliveryHandler::Packets(_) => DeliveryKind::Packets,
        }
    }

    fn deliver(&self, delivery: RxDelivery) {
        match (self, delivery) {
            (DeliveryHandler::Messages(handler), RxDelivery::Message(message)) => handler.on_message(&message),
            (DeliveryHandler::Packets(handler), RxDelivery::Packet(packet)) => handler.on_packet(&packet),
            (_, other) => debug!("delivery {:?} does not match the queue's handler - dropping", other),
        }
    }
}

pub struct RxQueueParams {
    pub selector: QueueSelector,
    pub delivery: DeliveryHandler,
    pub ordered: bool,
    pub join_backtrack: u32,
    pub reliability: Reliability,
    pub msg_properties: bool,
    pub events: Arc<dyn StreamEventHandler>,
}

impl RxQueueParams {
    pub fn new(queue_name: impl Into<String>, delivery: DeliveryHandler, events: Arc<dyn StreamEventHandler>) -> RxQueueParams {
        Self::with_selector(QueueSelector::Name(queue_name.into()), delivery, events)
    }

    pub fn with_acceptor(acceptor: Arc<dyn StreamAcceptor>, delivery: DeliveryHandler, events: Arc<dyn StreamEventHandler>) -> RxQueueParams {
        Self::with_selector(QueueSelector::Acceptor(acceptor), delivery, events)
    }

    fn with_selector(selector: QueueSelector, delivery: DeliveryHandler, events: Arc<dyn StreamEventHandler>) -> RxQueueParams {
        RxQueueParams {
            selector,
            delivery,
            ordered: true,
            join_backtrack: 0,
            reliability: Reliability::Reliable,
            msg_properties: false,
            events,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let QueueSelector::Name(name) = &self.selector {
            if name.is_empty() {
                anyhow::bail!("queue name must not be empty");
            }
            if name.len() > MAX_QUEUE_NAME_LEN {
                anyhow::bail!("queue name has {} bytes, maximum is {}", name.len(), MAX_QUEUE_NAME_LEN);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct RxQueueHandle(u64);

struct RxQueue {
    id: u64,
    selector: QueueSelector,
    delivery_kind: DeliveryKind,
    ordered: bool,
    join_backtrack: u32,
    reliability: Reliability,
    msg_properties: bool,
    events: Arc<dyn StreamEventHandler>,
    deliveries: mpsc::UnboundedSender<RxDelivery>,
}

impl RxQueue {
    fn name(&self) -> Option<&str> {
        match &self.selector {
            QueueSelector::Name(name) => Some(name),
            QueueSelector::Acceptor(_) => None,
        }
    }
}

struct RxStreamEntry {
    queue: Arc<RxQueue>,
    connection: Arc<Connection>,
    stream: Mutex<RxStream>,
}

impl RxStreamEntry {
    fn lock(&self) -> MutexGuard<'_, RxStream> {
        self.stream.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

struct RxShared {
    config: Arc<RumConfig>,
    pool: Arc<BufferPool>,
    announcer: Arc<EventAnnouncer>,
    queues: RwLock<FxHashMap<u64, Arc<RxQueue>>>,
    streams: RwLock<FxHashMap<Gsi, Arc<RxStreamEntry>>>,
    /// streams whose packets are dropped silently
    rejected: Mutex<FxHashSet<Gsi>>,
    memory: Mutex<MemoryAlert>,
    next_queue_id: AtomicU64,
    is_stopped: AtomicBool,
}

pub struct Receiver {
    shared: Arc<RxShared>,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    announcer_tasks: Mutex<FxHashMap<u64, JoinHandle<()>>>,
}

impl Drop for Receiver {
    fn drop(&mut self) {
        for handle in lock(&self.tasks).drain(..) {
            handle.abort();
        }
        for (_, handle) in lock(&self.announcer_tasks).drain() {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock()
        .unwrap_or_else(PoisonError::into_inner)
}

impl Receiver {
    pub fn start(config: Arc<RumConfig>, announcer: Arc<EventAnnouncer>) -> Receiver {
        let pool = BufferPool::new("receiver", config.packet_size, config.buffers_per_engine(), 1024);
        let memory = MemoryAlert::new(config.advanced.memory_alert_pct_hi, config.advanced.memory_alert_pct_lo);

        let shared = Arc::new(RxShared {
            config,
            pool,
            announcer,
            queues: Default::default(),
            streams: Default::default(),
            rejected: Default::default(),
            memory: Mutex::new(memory),
            next_queue_id: AtomicU64::new(1),
            is_stopped: AtomicBool::new(false),
        });

        let (stop, stop_receiver) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(Self::nak_loop(shared.clone(), stop_receiver.clone())),
            tokio::spawn(Self::timer_loop(shared.clone(), stop_receiver)),
        ];
        Receiver {
            shared,
            stop,
            tasks: Mutex::new(tasks),
            announcer_tasks: Default::default(),
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.shared.pool
    }

    pub fn num_streams(&self) -> usize {
        self.shared.read_streams().len()
    }

    pub fn create_queue(&self, params: RxQueueParams) -> RumResult<RxQueueHandle> {
        self.shared.check_running()?;
        params.validate()
            .map_err(|e| RumError::BadParameter(e.to_string()))?;

        let mut queues = self.shared.write_queues();
        if let QueueSelector::Name(name) = &params.selector {
            if queues.values().any(|q| q.name() == Some(name.as_str())) {
                return Err(RumError::BadParameter(format!("there is already a receive queue {:?}", name)));
            }
        }

        let id = self.shared.next_queue_id.fetch_add(1, Ordering::Relaxed);
        let (deliveries, delivery_receiver) = mpsc::unbounded_channel();
        let queue = Arc::new(RxQueue {
            id,
            selector: params.selector,
            delivery_kind: params.delivery.kind(),
            ordered: params.ordered,
            join_backtrack: params.join_backtrack,
            reliability: params.reliability,
            msg_properties: params.msg_properties,
            events: params.events,
            deliveries,
        });
        info!(msg_key = 5310, "creating receive queue {:?}", queue.name().unwrap_or("<acceptor>"));
        queues.insert(id, queue);
        drop(queues);

        let handle = tokio::spawn(Self::message_announcer(delivery_receiver, params.delivery));
        lock(&self.announcer_tasks).insert(id, handle);
        Ok(RxQueueHandle(id))
    }

    /// Closes a queue together with all its streams. Messages that were already handed to the
    ///  queue's announcer are still delivered.
    pub fn close_queue(&self, handle: RxQueueHandle) -> RumResult<()> {
        self.shared.check_running()?;
        let queue = self.shared.write_queues().remove(&handle.0)
            .ok_or(RumError::QueueInvalid)?;
        info!(msg_key = 5314, "closing receive queue {:?}", queue.name().unwrap_or("<acceptor>"));

        let removed = {
            let mut streams = self.shared.write_streams();
            let gsis = streams.iter()
                .filter(|(_, e)| e.queue.id == queue.id)
                .map(|(gsi, _)| *gsi)
                .collect::<Vec<_>>();
            gsis.into_iter()
                .filter_map(|gsi| streams.remove(&gsi))
                .collect::<Vec<_>>()
        };
        for entry in removed {
            entry.lock().close();
        }
        // the announcer task ends once the last sender is gone
        lock(&self.announcer_tasks).remove(&handle.0);
        Ok(())
    }

    /// Routes a stream packet received on `connection`. NAKs are not for the receiver and
    ///  are ignored here.
    pub fn on_packet(&self, connection: &Arc<Connection>, packet: &StreamPacket, payload: &[u8], now: Instant) {
        if self.shared.is_stopped.load(Ordering::Acquire) {
            return;
        }
        let gsi = packet.header.gsi;
        match packet.header.packet_type {
            PacketType::Spm => {
                if let Some(spm) = SpmInfo::from_packet(packet) {
                    self.shared.on_spm(connection, gsi, &spm, now);
                }
            }
            PacketType::Odata | PacketType::Rdata => {
                let Some(data) = DataInfo::from_packet(packet) else {
                    return;
                };
                let Some(entry) = self.shared.stream(gsi) else {
                    trace!("data for unknown stream {:?} - dropping", gsi);
                    return;
                };
                let mut out = RxOutput::default();
                entry.lock().on_data(&data, payload, &self.shared.pool, now, &mut out);
                self.shared.dispatch(&entry, out);
                self.shared.check_memory();
            }
            PacketType::Ncf => {
                if let Some(entry) = self.shared.stream(gsi) {
                    entry.lock().on_ncf(&packet.nak_sqns(), now);
                }
            }
            PacketType::Nak => {
                trace!("NAK for {:?} reached the receiver - ignoring", gsi);
            }
        }
    }

    pub fn nak_cycle(&self, now: Instant) {
        self.shared.nak_cycle(now)
    }

    pub fn timer_cycle(&self, now: Instant) {
        self.shared.timer_cycle(now)
    }

    /// Rejects a stream: it is closed, and its packets are dropped until
    ///  [Receiver::clear_rejected_streams] is called
    pub fn remove_stream(&self, gsi: Gsi) -> RumResult<()> {
        self.shared.check_running()?;
        let entry = self.shared.write_streams().remove(&gsi)
            .ok_or_else(|| RumError::BadParameter(format!("there is no receive stream {:?}", gsi)))?;
        entry.lock().close();
        lock(&self.shared.rejected).insert(gsi);
        info!(msg_key = 5315, "rejected receive stream {:?}", gsi);
        Ok(())
    }

    pub fn clear_rejected_streams(&self) -> RumResult<()> {
        self.shared.check_running()?;
        let mut rejected = lock(&self.shared.rejected);
        debug!("forgetting {} rejected streams", rejected.len());
        rejected.clear();
        Ok(())
    }

    /// Closes all streams riding on a connection that went down. Their queues see
    ///  [EventType::HeartbeatTimeout] if the peer's heartbeats stopped, [EventType::StreamBroke]
    ///  for any other reason.
    pub fn on_connection_down(&self, connection_id: ConnectionId, reason: ConnectionEventType) {
        let event_type = EventType::for_connection_down(reason);
        let removed = {
            let mut streams = self.shared.write_streams();
            let gsis = streams.iter()
                .filter(|(_, e)| e.connection.id() == connection_id)
                .map(|(gsi, _)| *gsi)
                .collect::<Vec<_>>();
            gsis.into_iter()
                .filter_map(|gsi| streams.remove(&gsi))
                .collect::<Vec<_>>()
        };

        for entry in removed {
            let mut stream = entry.lock();
            warn!(msg_key = 4272, "{:?} went down ({:?}) - receive stream {:?} of queue {:?} is broken", connection_id, reason, stream.gsi(), stream.queue_name());
            stream.close();
            self.shared.announcer.announce_stream_event(&entry.queue.events, StreamEvent::new(event_type)
                .with_gsi(stream.gsi())
                .with_queue_name(stream.queue_name())
                .with_connection(connection_id)
                .with_details(format!("connection went down: {:?}", reason)));
        }
    }

    pub fn stats(&self, gsi: Gsi) -> RumResult<RxStreamStats> {
        self.shared.stream(gsi)
            .map(|entry| entry.lock().stats())
            .ok_or_else(|| RumError::BadParameter(format!("there is no receive stream {:?}", gsi)))
    }

    /// Stops the NAK and timer tasks, then lets the message announcers deliver what they have
    pub async fn stop(&self, max_wait: Duration) -> bool {
        self.shared.is_stopped.store(true, Ordering::Release);
        let _ = self.stop.send(true);

        let deadline = Instant::now() + max_wait;
        let tasks = lock(&self.tasks).drain(..).collect::<Vec<_>>();
        let mut result = true;
        for task in tasks {
            if timeout(deadline.saturating_duration_since(Instant::now()), task).await.is_err() {
                result = false;
            }
        }

        self.shared.write_streams().clear();
        self.shared.write_queues().clear();
        let announcers = lock(&self.announcer_tasks).drain()
            .map(|(_, handle)| handle)
            .collect::<Vec<_>>();
        for task in announcers {
            if timeout(deadline.saturating_duration_since(Instant::now()), task).await.is_err() {
                result = false;
            }
        }

        if !result {
            warn!("receiver did not stop within {:?}", max_wait);
        }
        result
    }

    async fn message_announcer(mut receiver: mpsc::UnboundedReceiver<RxDelivery>, handler: DeliveryHandler) {
        while let Some(delivery) = receiver.recv().await {
            handler.deliver(delivery);
        }
        trace!("message announcer finished");
    }

    async fn nak_loop(shared: Arc<RxShared>, mut stop: watch::Receiver<bool>) {
        info!(msg_key = 5295, "NAK generator started");
        let cycle = shared.config.advanced.nack_gener_cycle;
        loop {
            select! {
                _ = stop.changed() => break,
                _ = sleep(cycle) => shared.nak_cycle(Instant::now()),
            }
        }
        info!(msg_key = 5296, "NAK generator stopped");
    }

    async fn timer_loop(shared: Arc<RxShared>, mut stop: watch::Receiver<bool>) {
        let cycle = shared.config.advanced.task_timer_cycle;
        loop {
            select! {
                _ = stop.changed() => break,
                _ = sleep(cycle) => shared.timer_cycle(Instant::now()),
            }
        }
        debug!("receiver timer task stopped");
    }
}

impl RxShared {
    fn read_streams(&self) -> RwLockReadGuard<'_, FxHashMap<Gsi, Arc<RxStreamEntry>>> {
        self.streams.read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_streams(&self) -> RwLockWriteGuard<'_, FxHashMap<Gsi, Arc<RxStreamEntry>>> {
        self.streams.write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_queues(&self) -> RwLockReadGuard<'_, FxHashMap<u64, Arc<RxQueue>>> {
        self.queues.read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_queues(&self) -> RwLockWriteGuard<'_, FxHashMap<u64, Arc<RxQueue>>> {
        self.queues.write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_running(&self) -> RumResult<()> {
        if self.is_stopped.load(Ordering::Acquire) {
            return Err(RumError::InstanceClosed);
        }
        Ok(())
    }

    fn stream(&self, gsi: Gsi) -> Option<Arc<RxStreamEntry>> {
        self.read_streams().get(&gsi).cloned()
    }

    fn all_streams(&self) -> Vec<Arc<RxStreamEntry>> {
        self.read_streams().values()
            .cloned()
            .collect()
    }

    fn on_spm(&self, connection: &Arc<Connection>, gsi: Gsi, spm: &SpmInfo, now: Instant) {
        if let Some(entry) = self.stream(gsi) {
            let mut out = RxOutput::default();
            entry.lock().on_spm(spm, now, &mut out);
            self.dispatch(&entry, out);
            return;
        }
        if lock(&self.rejected).contains(&gsi) {
            trace!("SPM for rejected stream {:?} - dropping", gsi);
            return;
        }

        let info = NewStreamInfo {
            gsi,
            queue_name: spm.queue_name.clone(),
            connection_id: connection.id(),
            reliability: spm.reliability(),
            msg_properties: spm.msg_properties,
        };
        let Some(queue) = self.find_queue(&info) else {
            trace!("no receive queue for stream {:?} of queue {:?}", gsi, spm.queue_name);
            return;
        };

        if spm.msg_properties && !queue.msg_properties {
            warn!(msg_key = 4316, "stream {:?} carries message properties, receive queue {:?} does not support them - rejecting", gsi, spm.queue_name);
            lock(&self.rejected).insert(gsi);
            self.announcer.announce_stream_event(&queue.events, StreamEvent::new(EventType::NewSourceFailed)
                .with_gsi(gsi)
                .with_connection(connection.id())
                .with_details("stream has message properties, queue does not support them"));
            return;
        }

        let queue_name = spm.queue_name.clone()
            .or_else(|| queue.name().map(str::to_string))
            .unwrap_or_default();
        let setup = RxStreamSetup {
            gsi,
            queue_name: queue_name.clone(),
            connection_id: connection.id(),
            queue_reliability: queue.reliability,
            ordered: queue.ordered,
            delivery: queue.delivery_kind,
            msg_properties: spm.msg_properties,
            join_backtrack: queue.join_backtrack,
            peer_order: connection.peer_order(),
            local_order: connection.local_order(),
            local_nla: connection.local_addr()
                .map(|a| a.ip())
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            max_gap: self.pool.max_buffers().min(u32::MAX as usize).prechecked_cast(),
            checksum: self.config.advanced.checksum_enabled,
        };

        let mut out = RxOutput::default();
        out.events.push(StreamEvent::new(EventType::NewSource)
            .with_gsi(gsi)
            .with_queue_name(&queue_name)
            .with_connection(connection.id()));
        let stream = RxStream::new(setup, spm, &self.config.advanced, now, &mut out);
        let entry = Arc::new(RxStreamEntry {
            queue,
            connection: connection.clone(),
            stream: Mutex::new(stream),
        });

        let existing = match self.write_streams().entry(gsi) {
            Entry::Vacant(vacant) => {
                vacant.insert(entry.clone());
                None
            }
            Entry::Occupied(occupied) => Some(occupied.get().clone()),
        };

        match existing {
            None => {
                info!(msg_key = 5316, "new receive stream {:?} for queue {:?} on {:?}", gsi, queue_name, connection.id());
                self.dispatch(&entry, out);
            }
            Some(existing) => {
                debug!("receive stream {:?} was created concurrently - applying the SPM to it", gsi);
                let mut out = RxOutput::default();
                existing.lock().on_spm(spm, now, &mut out);
                self.dispatch(&existing, out);
            }
        }
    }

    fn find_queue(&self, info: &NewStreamInfo) -> Option<Arc<RxQueue>> {
        let queues = self.read_queues();
        let by_name = queues.values()
            .find(|q| q.name().is_some() && q.name() == info.queue_name.as_deref());
        if let Some(queue) = by_name {
            return Some(queue.clone());
        }

        let mut acceptors = queues.values()
            .filter(|q| matches!(q.selector, QueueSelector::Acceptor(_)))
            .cloned()
            .collect::<Vec<_>>();
        drop(queues);
        acceptors.sort_by_key(|q| q.id);

        acceptors.into_iter()
            .find(|q| match &q.selector {
                QueueSelector::Acceptor(acceptor) => acceptor.accept_stream(info),
                QueueSelector::Name(_) => false,
            })
    }

    /// Hands a stream's output on: deliveries to the queue, events to the announcer, packets
    ///  to the connection
    fn dispatch(&self, entry: &RxStreamEntry, out: RxOutput) {
        for delivery in out.deliveries {
            if entry.queue.deliveries.send(delivery).is_err() {
                debug!("receive queue is closed - dropping delivery");
            }
        }
        for event in out.events {
            self.announcer.announce_stream_event(&entry.queue.events, event);
        }
        for packet in out.packets {
            if !entry.connection.send_packet(packet) {
                trace!("{:?} does not accept packets - dropping NAK", entry.connection.id());
            }
        }
    }

    /// Updates the memory alert, announcing a change to every queue
    fn check_memory(&self) {
        let change = lock(&self.memory).update(self.pool.utilization_percent());
        if let Some(event_type) = change {
            let queues = self.read_queues().values()
                .cloned()
                .collect::<Vec<_>>();
            for queue in queues {
                self.announcer.announce_stream_event(&queue.events, StreamEvent::new(event_type)
                    .with_details(format!("receive memory at {}%", self.pool.utilization_percent())));
            }
        }
    }

    fn in_crisis(&self) -> bool {
        lock(&self.memory).in_crisis()
    }

    fn nak_cycle(&self, now: Instant) {
        let in_crisis = self.in_crisis();
        let mut budget = self.config.advanced.max_nacks_per_cycle;
        for entry in self.all_streams() {
            let mut out = RxOutput::default();
            entry.lock().nak_cycle(now, in_crisis, &mut budget, &mut out);
            self.dispatch(&entry, out);
        }
    }

    fn timer_cycle(&self, now: Instant) {
        self.check_memory();
        let in_crisis = self.in_crisis();

        for entry in self.all_streams() {
            let mut out = RxOutput::default();
            let is_closed = {
                let mut stream = entry.lock();
                if in_crisis {
                    stream.shed_oldest_hole(now, &mut out);
                }
                stream.timer_cycle(now, &mut out)
            };
            if is_closed {
                let gsi = entry.lock().gsi();
                self.write_streams().remove(&gsi);
                debug!("removed closed receive stream {:?}", gsi);
            }
            self.dispatch(&entry, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::byte_order::ByteOrder;
    use crate::codec::message_record::ser_record;
    use crate::codec::options::{PacketOption, StreamControl};
    use crate::codec::packet_header::{CommonHeader, DataBody, HeaderOptions, PacketBody, SpmBody};
    use crate::connection::connection::HeartbeatParams;
    use crate::events::{ConnectionInfo, MockConnectionListener, MockStreamEventHandler};
    use crate::seq::Sqn;
    use bytes::Bytes;
    use rstest::rstest;
    use std::net::SocketAddr;
    use std::sync::{OnceLock, Weak};
    use tokio::runtime::Builder;

    const GSI_RAW: u64 = 0x55_0003;

    fn gsi() -> Gsi {
        Gsi::from_raw(GSI_RAW)
    }

    fn test_connection(id: u64) -> (Arc<Connection>, mpsc::UnboundedReceiver<Bytes>) {
        let info = ConnectionInfo {
            connection_id: ConnectionId(id),
            remote_addr: SocketAddr::from(([127, 0, 0, 1], 35353)),
            local_addr: Some(SocketAddr::from(([127, 0, 0, 1], 40000))),
            remote_instance_id: Some(0x55),
            is_inbound: true,
            connect_message: None,
        };
        let heartbeat = HeartbeatParams { timeout: None, interval: None, one_way: false };
        Connection::established(info, ByteOrder::Little, ByteOrder::Little, heartbeat, Arc::new(MockConnectionListener::new()), Instant::now())
    }

    fn config(modify: impl FnOnce(&mut RumConfig)) -> Arc<RumConfig> {
        let mut config = RumConfig::default_ipv4();
        config.packet_size = 1000;
        config.advanced.nack_timeout_bof = Duration::ZERO;
        modify(&mut config);
        Arc::new(config)
    }

    fn header(packet_type: PacketType) -> CommonHeader {
        CommonHeader {
            source_port: 35353,
            dest_port: 40000,
            packet_type,
            options: HeaderOptions::empty(),
            checksum: 0,
            gsi: gsi(),
            tsdu_length: 0,
        }
    }

    fn spm(spm_sqn: u32, lead: u32, queue_name: &str, options: Vec<PacketOption>) -> StreamPacket {
        let mut options = options;
        options.push(PacketOption::QueueName(queue_name.to_string()));
        StreamPacket {
            header: header(PacketType::Spm),
            body: PacketBody::Spm(SpmBody {
                spm_sqn: Sqn::from_raw(spm_sqn),
                trail: Sqn::ZERO,
                lead: Sqn::from_raw(lead),
                nla: IpAddr::V4(Ipv4Addr::LOCALHOST),
            }),
            options,
        }
    }

    fn odata(sqn: u32, packet_type: PacketType) -> StreamPacket {
        StreamPacket {
            header: header(packet_type),
            body: PacketBody::Data(DataBody { data_sqn: Sqn::from_raw(sqn), trail: Sqn::ZERO }),
            options: vec![PacketOption::MsgToPacket { first_msg_sqn: sqn as u64 }],
        }
    }

    fn record(message: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        ser_record(&mut buf, ByteOrder::Little, None, message);
        buf
    }

    fn events() -> Arc<dyn StreamEventHandler> {
        let mut handler = MockStreamEventHandler::new();
        handler.expect_on_event().return_const(());
        Arc::new(handler)
    }

    fn recording_events() -> (Arc<dyn StreamEventHandler>, Arc<Mutex<Vec<EventType>>>) {
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let mut handler = MockStreamEventHandler::new();
        let r = recorded.clone();
        handler.expect_on_event().returning(move |e| r.lock().unwrap().push(e.event_type));
        (Arc::new(handler), recorded)
    }

    fn collecting_handler() -> (DeliveryHandler, Arc<Mutex<Vec<u64>>>) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let mut handler = MockMessageHandler::new();
        let c = collected.clone();
        handler.expect_on_message().returning(move |m| c.lock().unwrap().push(m.msg_sqn));
        (DeliveryHandler::Messages(Arc::new(handler)), collected)
    }

    fn silent_handler() -> DeliveryHandler {
        let mut handler = MockMessageHandler::new();
        handler.expect_on_message().never();
        DeliveryHandler::Messages(Arc::new(handler))
    }

    fn nak_sqns(wire: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Vec<u32>> {
        let mut result = Vec::new();
        while let Ok(packet) = wire.try_recv() {
            let (parsed, _) = StreamPacket::deser(&packet, ByteOrder::Little).unwrap();
            assert_eq!(parsed.header.packet_type, PacketType::Nak);
            result.push(parsed.nak_sqns().into_iter().map(|s| s.to_raw()).collect());
        }
        result
    }

    #[test]
    fn test_stream_delivers_in_order() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let announcer = Arc::new(EventAnnouncer::start());
            let receiver = Receiver::start(config(|_| {}), announcer.clone());
            let (connection, _wire) = test_connection(1);
            let (delivery, collected) = collecting_handler();
            let (recorder, recorded) = recording_events();
            receiver.create_queue(RxQueueParams::new("q", delivery, recorder)).unwrap();

            let now = Instant::now();
            receiver.on_packet(&connection, &spm(0, 0, "q", vec![]), &[], now);
            assert_eq!(receiver.num_streams(), 1);
            for sqn in [0, 2, 1] {
                receiver.on_packet(&connection, &odata(sqn, PacketType::Odata), &record(b"m"), now);
            }

            sleep(Duration::from_millis(1)).await;
            assert_eq!(*collected.lock().unwrap(), vec![0, 1, 2]);
            assert!(announcer.stop(Duration::from_secs(1)).await);
            assert_eq!(*recorded.lock().unwrap(), vec![EventType::NewSource, EventType::FirstMessage]);
            assert_eq!(receiver.stats(gsi()).unwrap().messages_delivered, 3);
        });
    }

    #[test]
    fn test_nak_task_requests_repair() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let receiver = Receiver::start(config(|_| {}), Arc::new(EventAnnouncer::start()));
            let (connection, mut wire) = test_connection(1);
            let (delivery, collected) = collecting_handler();
            receiver.create_queue(RxQueueParams::new("q", delivery, events())).unwrap();

            let now = Instant::now();
            receiver.on_packet(&connection, &spm(0, 0, "q", vec![]), &[], now);
            for sqn in [0, 1, 3, 4] {
                receiver.on_packet(&connection, &odata(sqn, PacketType::Odata), &record(b"m"), now);
            }

            sleep(Duration::from_millis(50)).await;
            assert_eq!(nak_sqns(&mut wire), vec![vec![2]]);

            let ncf = StreamPacket::nak_or_ncf(PacketType::Ncf, 35353, 40000, gsi(), &[Sqn::from_raw(2)], IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
            receiver.on_packet(&connection, &ncf, &[], Instant::now());
            receiver.on_packet(&connection, &odata(2, PacketType::Rdata), &record(b"m"), Instant::now());

            sleep(Duration::from_millis(1)).await;
            assert_eq!(*collected.lock().unwrap(), vec![0, 1, 2, 3, 4]);
            assert!(nak_sqns(&mut wire).is_empty());
            assert!(receiver.stop(Duration::from_secs(1)).await);
        });
    }

    #[test]
    fn test_no_queue_for_stream() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let receiver = Receiver::start(config(|_| {}), Arc::new(EventAnnouncer::start()));
            let (connection, _wire) = test_connection(1);
            receiver.create_queue(RxQueueParams::new("q", silent_handler(), events())).unwrap();

            receiver.on_packet(&connection, &spm(0, 0, "other", vec![]), &[], Instant::now());
            receiver.on_packet(&connection, &odata(0, PacketType::Odata), &record(b"m"), Instant::now());
            assert_eq!(receiver.num_streams(), 0);
            sleep(Duration::from_millis(1)).await;
        });
    }

    #[test]
    fn test_properties_stream_rejected_by_plain_queue() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let announcer = Arc::new(EventAnnouncer::start());
            let receiver = Receiver::start(config(|_| {}), announcer.clone());
            let (connection, _wire) = test_connection(1);
            let (recorder, recorded) = recording_events();
            let plain = receiver.create_queue(RxQueueParams::new("q", silent_handler(), recorder)).unwrap();

            let with_props = spm(0, 0, "q", vec![PacketOption::MsgProperties]);
            receiver.on_packet(&connection, &with_props, &[], Instant::now());
            assert_eq!(receiver.num_streams(), 0);

            receiver.close_queue(plain).unwrap();
            let mut params = RxQueueParams::new("q", silent_handler(), events());
            params.msg_properties = true;
            receiver.create_queue(params).unwrap();

            receiver.on_packet(&connection, &spm(1, 0, "q", vec![PacketOption::MsgProperties]), &[], Instant::now());
            assert_eq!(receiver.num_streams(), 0, "stream stays rejected");

            receiver.clear_rejected_streams().unwrap();
            receiver.on_packet(&connection, &spm(2, 0, "q", vec![PacketOption::MsgProperties]), &[], Instant::now());
            assert_eq!(receiver.num_streams(), 1);

            assert!(announcer.stop(Duration::from_secs(1)).await);
            assert_eq!(*recorded.lock().unwrap(), vec![EventType::NewSourceFailed]);
        });
    }

    #[rstest]
    #[case::accepted(true, 1)]
    #[case::declined(false, 0)]
    fn test_acceptor(#[case] accept: bool, #[case] expected_streams: usize) {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let receiver = Receiver::start(config(|_| {}), Arc::new(EventAnnouncer::start()));
            let (connection, _wire) = test_connection(1);

            let mut acceptor = MockStreamAcceptor::new();
            acceptor.expect_accept_stream()
                .withf(|info| info.gsi == gsi() && info.queue_name.as_deref() == Some("anything"))
                .times(1)
                .return_const(accept);
            receiver.create_queue(RxQueueParams::with_acceptor(Arc::new(acceptor), silent_handler(), events())).unwrap();

            receiver.on_packet(&connection, &spm(0, 0, "anything", vec![]), &[], Instant::now());
            assert_eq!(receiver.num_streams(), expected_streams);
        });
    }

    /// Accepts every stream, feeding the stream's SPM to the receiver once more from inside
    ///  the callback, like a second SPM arriving while the first one is being processed
    struct ReentrantAcceptor {
        receiver: OnceLock<Weak<Receiver>>,
        connection: Arc<Connection>,
        is_reentered: AtomicBool,
    }

    impl StreamAcceptor for ReentrantAcceptor {
        fn accept_stream(&self, _stream: &NewStreamInfo) -> bool {
            if !self.is_reentered.swap(true, Ordering::AcqRel) {
                if let Some(receiver) = self.receiver.get().and_then(Weak::upgrade) {
                    receiver.on_packet(&self.connection, &spm(0, 0, "q", vec![]), &[], Instant::now());
                }
            }
            true
        }
    }

    #[test]
    fn test_racing_spms_announce_one_new_source() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let announcer = Arc::new(EventAnnouncer::start());
            let receiver = Arc::new(Receiver::start(config(|_| {}), announcer.clone()));
            let (connection, _wire) = test_connection(1);

            let acceptor = Arc::new(ReentrantAcceptor {
                receiver: OnceLock::new(),
                connection: connection.clone(),
                is_reentered: AtomicBool::new(false),
            });
            let _ = acceptor.receiver.set(Arc::downgrade(&receiver));
            let (recorder, recorded) = recording_events();
            receiver.create_queue(RxQueueParams::with_acceptor(acceptor, silent_handler(), recorder)).unwrap();

            receiver.on_packet(&connection, &spm(0, 0, "q", vec![]), &[], Instant::now());
            assert_eq!(receiver.num_streams(), 1);

            assert!(announcer.stop(Duration::from_secs(1)).await);
            assert_eq!(*recorded.lock().unwrap(), vec![EventType::NewSource]);
        });
    }

    #[test]
    fn test_remove_stream() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let receiver = Receiver::start(config(|_| {}), Arc::new(EventAnnouncer::start()));
            let (connection, _wire) = test_connection(1);
            receiver.create_queue(RxQueueParams::new("q", silent_handler(), events())).unwrap();
            receiver.on_packet(&connection, &spm(0, 0, "q", vec![]), &[], Instant::now());

            receiver.remove_stream(gsi()).unwrap();
            assert!(matches!(receiver.remove_stream(gsi()), Err(RumError::BadParameter(_))));
            receiver.on_packet(&connection, &spm(1, 0, "q", vec![]), &[], Instant::now());
            receiver.on_packet(&connection, &odata(0, PacketType::Odata), &record(b"m"), Instant::now());
            assert_eq!(receiver.num_streams(), 0);
            sleep(Duration::from_millis(1)).await;
        });
    }

    #[test]
    fn test_duplicate_queue_name() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let receiver = Receiver::start(config(|_| {}), Arc::new(EventAnnouncer::start()));
            receiver.create_queue(RxQueueParams::new("q", silent_handler(), events())).unwrap();
            assert!(matches!(receiver.create_queue(RxQueueParams::new("q", silent_handler(), events())), Err(RumError::BadParameter(_))));
            assert!(matches!(receiver.create_queue(RxQueueParams::new("", silent_handler(), events())), Err(RumError::BadParameter(_))));
        });
    }

    #[rstest]
    #[case::broke(ConnectionEventType::ConnectionBroke, EventType::StreamBroke)]
    #[case::closed(ConnectionEventType::ConnectionClosed, EventType::StreamBroke)]
    #[case::heartbeat_timeout(ConnectionEventType::ConnectionHeartbeatTimeout, EventType::HeartbeatTimeout)]
    fn test_connection_down_breaks_streams(#[case] reason: ConnectionEventType, #[case] expected: EventType) {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let announcer = Arc::new(EventAnnouncer::start());
            let receiver = Receiver::start(config(|_| {}), announcer.clone());
            let (connection, _wire) = test_connection(1);
            let (recorder, recorded) = recording_events();
            receiver.create_queue(RxQueueParams::new("q", silent_handler(), recorder)).unwrap();
            receiver.on_packet(&connection, &spm(0, 0, "q", vec![]), &[], Instant::now());

            receiver.on_connection_down(ConnectionId(2), reason);
            assert_eq!(receiver.num_streams(), 1);
            receiver.on_connection_down(ConnectionId(1), reason);
            assert_eq!(receiver.num_streams(), 0);

            assert!(announcer.stop(Duration::from_secs(1)).await);
            assert_eq!(*recorded.lock().unwrap(), vec![EventType::NewSource, expected]);
        });
    }

    #[test]
    fn test_closed_transmitter_removes_stream() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let announcer = Arc::new(EventAnnouncer::start());
            let receiver = Receiver::start(config(|_| {}), announcer.clone());
            let (connection, _wire) = test_connection(1);
            let (recorder, recorded) = recording_events();
            receiver.create_queue(RxQueueParams::new("q", silent_handler(), recorder)).unwrap();
            receiver.on_packet(&connection, &spm(0, 0, "q", vec![]), &[], Instant::now());

            let control = StreamControl {
                reliability: Reliability::Reliable,
                is_active: false,
                keep_history: true,
                close_linger_millis: 20,
            };
            receiver.on_packet(&connection, &spm(1, 0, "q", vec![PacketOption::StreamControl(control)]), &[], Instant::now());
            sleep(Duration::from_millis(30)).await;
            assert_eq!(receiver.num_streams(), 0);

            assert!(announcer.stop(Duration::from_secs(1)).await);
            assert_eq!(*recorded.lock().unwrap(), vec![EventType::NewSource, EventType::ClosedTransmitter]);
        });
    }

    #[test]
    fn test_memory_alert_hysteresis() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let config = config(|c| {
                // 10 buffers for the receiver
                c.max_memory_bytes = 20_000;
                c.advanced.memory_alert_pct_hi = 50;
                c.advanced.memory_alert_pct_lo = 20;
            });
            let announcer = Arc::new(EventAnnouncer::start());
            let receiver = Receiver::start(config, announcer.clone());
            assert_eq!(receiver.pool().max_buffers(), 10);
            let (connection, _wire) = test_connection(1);
            let (delivery, collected) = collecting_handler();
            let (recorder, recorded) = recording_events();
            receiver.create_queue(RxQueueParams::new("q", delivery, recorder)).unwrap();

            let now = Instant::now();
            receiver.on_packet(&connection, &spm(0, 0, "q", vec![]), &[], now);
            // sqn 0 never arrives, everything behind it is buffered
            for sqn in 1..=6 {
                receiver.on_packet(&connection, &odata(sqn, PacketType::Odata), &record(b"m"), now);
            }
            assert_eq!(receiver.pool().in_use(), 6);

            receiver.timer_cycle(now);
            assert_eq!(receiver.pool().in_use(), 0);
            receiver.timer_cycle(now);

            sleep(Duration::from_millis(1)).await;
            assert_eq!(*collected.lock().unwrap(), vec![1, 2, 3, 4, 5, 6]);
            assert!(receiver.stop(Duration::from_secs(1)).await);
            assert!(announcer.stop(Duration::from_secs(1)).await);

            let recorded = recorded.lock().unwrap();
            let alerts = recorded.iter()
                .filter(|&&t| t == EventType::MemoryAlertOn || t == EventType::MemoryAlertOff)
                .copied()
                .collect::<Vec<_>>();
            assert_eq!(alerts, vec![EventType::MemoryAlertOn, EventType::MemoryAlertOff]);
            assert!(recorded.contains(&EventType::ReceiveQueueTrimmed));
        });
    }

    #[test]
    fn test_stopped() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let receiver = Receiver::start(config(|_| {}), Arc::new(EventAnnouncer::start()));
            let handle = receiver.create_queue(RxQueueParams::new("q", silent_handler(), events())).unwrap();
            assert!(receiver.stop(Duration::from_secs(1)).await);
            assert!(matches!(receiver.close_queue(handle), Err(RumError::InstanceClosed)));
            assert!(matches!(receiver.create_queue(RxQueueParams::new("r", silent_handler(), events())), Err(RumError::InstanceClosed)));
        });
    }
}
