//! The transmitter engine: transmit streams (queues), the per-round scheduling of data,
//!  repairs and SPMs across them, and backpressure towards submitting applications.
//!
//! A single round task drives all streams of an instance. Each round gives every stream a
//!  budget of packets; the stream spends it on NCFs, RDATA (bounded by `rdata_send_percent`)
//!  and new ODATA, in that order. Packets are handed to the stream's connection, whose fire-out
//!  task writes them to the socket.

pub mod spm_schedule;
pub mod token_bucket;
pub mod tx_stream;

use crate::buffers::buffer_pool::BufferPool;
use crate::codec::message_record::{ser_properties, MessageProperty};
use crate::codec::options::{Reliability, MAX_QUEUE_NAME_LEN};
use crate::codec::packet_header::Gsi;
use crate::config::RumConfig;
use crate::connection::connection::Connection;
use crate::error::{RumError, RumResult};
use crate::events::{ConnectionEventType, ConnectionId, EventAnnouncer, EventType, StreamEvent, StreamEventHandler};
use crate::seq::Sqn;
use crate::transmitter::token_bucket::TokenBucket;
use crate::transmitter::tx_stream::{RoundBudget, TrimParams, TxStream, TxStreamSetup, TxStreamStats};
use rustc_hash::FxHashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::select;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, trace, warn};

pub struct TxQueueParams {
    pub queue_name: String,
    pub reliability: Reliability,
    pub is_late_join: bool,
    pub msg_properties: bool,
    pub app_batching: bool,
    /// how long closing waits for repairs to drain, also announced to receivers
    pub close_linger: Duration,
    pub events: Arc<dyn StreamEventHandler>,
}

impl TxQueueParams {
    pub fn new(queue_name: impl Into<String>, events: Arc<dyn StreamEventHandler>) -> TxQueueParams {
        TxQueueParams {
            queue_name: queue_name.into(),
            reliability: Reliability::Reliable,
            is_late_join: false,
            msg_properties: false,
            app_batching: false,
            close_linger: Duration::from_millis(1000),
            events,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue_name.is_empty() {
            anyhow::bail!("queue name must not be empty");
        }
        if self.queue_name.len() > MAX_QUEUE_NAME_LEN {
            anyhow::bail!("queue name has {} bytes, maximum is {}", self.queue_name.len(), MAX_QUEUE_NAME_LEN);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub properties: Vec<MessageProperty>,
    /// send the message (and everything collected before it) without waiting for more
    pub dont_batch: bool,
}

/// Identifies a transmit stream. The serial number keeps handles of closed streams invalid
///  when their 16 bit stream id is reused.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct TxStreamHandle {
    pub gsi: Gsi,
    serial: u64,
}

struct TxStreamEntry {
    serial: u64,
    connection: Arc<Connection>,
    events: Arc<dyn StreamEventHandler>,
    close_linger: Duration,
    stream: Mutex<TxStream>,
}

impl TxStreamEntry {
    fn lock(&self) -> MutexGuard<'_, TxStream> {
        self.stream.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct RoundOutcome {
    pub packets_sent: usize,
    pub has_pending: bool,
}

struct TxShared {
    config: Arc<RumConfig>,
    instance_id: u32,
    pool: Arc<BufferPool>,
    announcer: Arc<EventAnnouncer>,
    streams: RwLock<FxHashMap<Gsi, Arc<TxStreamEntry>>>,
    next_stream_id: AtomicU16,
    next_serial: AtomicU64,
    /// packets built but not sent yet, across all streams
    pending_packets: AtomicUsize,
    /// signalled when pending packets were sent
    space: Notify,
    /// signalled when there is something to send
    work: Notify,
    stop: Notify,
    is_stopped: AtomicBool,
    bucket: Mutex<Option<TokenBucket>>,
}

pub struct Transmitter {
    shared: Arc<TxShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Transmitter {
    fn drop(&mut self) {
        if let Some(handle) = self.lock_handle().take() {
            handle.abort();
        }
    }
}

impl Transmitter {
    pub fn start(config: Arc<RumConfig>, instance_id: u32, announcer: Arc<EventAnnouncer>) -> Transmitter {
        let pool = BufferPool::new("transmitter", config.packet_size, config.buffers_per_engine(), 1024);
        let bucket = TokenBucket::new(config.rate_limit, config.trans_rate_limit_kbps, RumConfig::MIN_RATE_LIMIT_KBPS, config.packet_size, Instant::now());

        let shared = Arc::new(TxShared {
            config,
            instance_id,
            pool,
            announcer,
            streams: Default::default(),
            next_stream_id: AtomicU16::new(0),
            next_serial: AtomicU64::new(1),
            pending_packets: AtomicUsize::new(0),
            space: Notify::new(),
            work: Notify::new(),
            stop: Notify::new(),
            is_stopped: AtomicBool::new(false),
            bucket: Mutex::new(bucket),
        });

        let handle = tokio::spawn(Self::do_loop(shared.clone()));
        Transmitter {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.shared.pool
    }

    pub fn num_streams(&self) -> usize {
        self.shared.read_streams().len()
    }

    pub fn pending_packets(&self) -> usize {
        self.shared.pending_packets.load(Ordering::Acquire)
    }

    pub fn create_stream(&self, params: TxQueueParams, connection: Arc<Connection>) -> RumResult<TxStreamHandle> {
        self.shared.check_running()?;
        params.validate()
            .map_err(|e| RumError::BadParameter(e.to_string()))?;
        if !connection.is_active() {
            return Err(RumError::ConnectionInvalid);
        }

        let config = &self.shared.config;
        let mut streams = self.shared.write_streams();
        let max_streams = config.advanced.max_streams_per_transmitter;
        if streams.len() >= max_streams {
            warn!(msg_key = 4260, "transmitter has {} streams - cannot create stream for queue {:?}", streams.len(), params.queue_name);
            return Err(RumError::TooManyStreams(max_streams));
        }

        let gsi = loop {
            let candidate = Gsi::new(self.shared.instance_id, self.shared.next_stream_id.fetch_add(1, Ordering::Relaxed));
            if !streams.contains_key(&candidate) {
                break candidate;
            }
        };

        let info = connection.info();
        let local_addr = info.local_addr;
        let setup = TxStreamSetup {
            gsi,
            queue_name: params.queue_name,
            reliability: params.reliability,
            is_late_join: params.is_late_join,
            msg_properties: params.msg_properties,
            app_batching: params.app_batching,
            order: connection.local_order(),
            source_port: local_addr.map(|a| a.port()).unwrap_or(0),
            dest_port: info.remote_addr.port(),
            source_nla: local_addr.map(|a| a.ip()).unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            group_nla: info.remote_addr.ip(),
            packet_size: config.packet_size,
            checksum: config.advanced.checksum_enabled,
        };

        info!(msg_key = 5301, "creating transmit stream {:?} for queue {:?} on {:?}", gsi, setup.queue_name, connection.id());
        let serial = self.shared.next_serial.fetch_add(1, Ordering::Relaxed);
        streams.insert(gsi, Arc::new(TxStreamEntry {
            serial,
            connection,
            events: params.events,
            close_linger: params.close_linger,
            stream: Mutex::new(TxStream::new(setup, &config.advanced, Instant::now())),
        }));
        drop(streams);

        self.shared.work.notify_one();
        Ok(TxStreamHandle { gsi, serial })
    }

    /// Submits a message, returning its message sequence number. When the pending packets
    ///  exceed their ceiling, this waits for them to drain or fails with
    ///  [RumError::MemoryAlert], depending on `submit_blocking`.
    pub async fn submit(&self, handle: TxStreamHandle, message: &[u8], options: SubmitOptions) -> RumResult<u64> {
        let entry = self.shared.entry(handle)?;

        let property_block = {
            let stream = entry.lock();
            if stream.is_closing() {
                return Err(RumError::QueueClosed);
            }
            if !stream.has_msg_properties() && !options.properties.is_empty() {
                return Err(RumError::BadMessageProperty(format!("queue {:?} was created without message properties", stream.queue_name())));
            }
            if stream.has_msg_properties() {
                for prop in &options.properties {
                    prop.validate()
                        .map_err(|e| RumError::BadMessageProperty(e.to_string()))?;
                }
                let mut block = Vec::new();
                ser_properties(&options.properties, &mut block, entry.connection.local_order());
                Some(block)
            }
            else {
                None
            }
        };

        self.shared.wait_for_space().await?;

        let msg_sqn = {
            let mut stream = entry.lock();
            if stream.is_closing() {
                return Err(RumError::QueueClosed);
            }
            let before = stream.pending_packets();
            let msg_sqn = stream.submit(message, property_block.as_deref(), options.dont_batch, &self.shared.pool, Instant::now());
            self.shared.adjust_pending(before, stream.pending_packets());
            msg_sqn
        };
        trace!("{:?}: submitted message {} with {} bytes", handle.gsi, msg_sqn, message.len());

        self.shared.work.notify_one();
        Ok(msg_sqn)
    }

    /// Closes a stream: buffered messages are sent, the close is announced with an SPM, and
    ///  the stream is removed once its repairs are drained or its linger time expired.
    pub async fn close_stream(&self, handle: TxStreamHandle) -> RumResult<()> {
        let entry = self.shared.entry(handle)?;
        {
            let mut stream = entry.lock();
            if stream.is_closing() {
                return Err(RumError::QueueClosed);
            }
            let before = stream.pending_packets();
            stream.begin_close(entry.close_linger, &self.shared.pool);
            self.shared.adjust_pending(before, stream.pending_packets());
        }
        info!(msg_key = 5302, "closing transmit stream {:?}", handle.gsi);

        let deadline = Instant::now() + entry.close_linger;
        loop {
            self.shared.work.notify_one();
            if entry.lock().is_drained() || !entry.connection.is_active() {
                break;
            }
            if Instant::now() >= deadline {
                debug!("{:?}: linger time expired with repairs outstanding", handle.gsi);
                break;
            }
            sleep(self.shared.config.advanced.task_timer_cycle).await;
        }

        self.shared.remove_stream(handle.gsi);
        Ok(())
    }

    /// Handles a NAK from a receiver of one of our streams
    pub fn on_nak(&self, gsi: Gsi, sqns: &[Sqn], now: Instant) {
        let entry = match self.shared.read_streams().get(&gsi) {
            Some(entry) => entry.clone(),
            None => {
                debug!("NAK for unknown stream {:?} - ignoring", gsi);
                return;
            }
        };

        let outcome = entry.lock().on_nak(sqns);
        trace!("{:?}: NAK for {:?}: {:?}", gsi, sqns, outcome);
        if outcome.queued > 0 {
            if let Some(bucket) = self.shared.lock_bucket().as_mut() {
                bucket.on_repair_pressure(now);
            }
        }
        self.shared.work.notify_one();
    }

    pub fn fire_round(&self, now: Instant) -> RoundOutcome {
        self.shared.fire_round(now)
    }

    /// Removes all streams riding on a connection that went down. Their handlers see
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
            let stream = entry.lock();
            warn!(msg_key = 4271, "{:?} went down ({:?}) - transmit stream {:?} for queue {:?} is broken", connection_id, reason, stream.gsi(), stream.queue_name());
            self.shared.adjust_pending(stream.pending_packets(), 0);
            self.shared.announcer.announce_stream_event(&entry.events, StreamEvent::new(event_type)
                .with_gsi(stream.gsi())
                .with_queue_name(stream.queue_name())
                .with_connection(connection_id)
                .with_details(format!("connection went down: {:?}", reason)));
        }
    }

    pub fn stats(&self, handle: TxStreamHandle) -> RumResult<TxStreamStats> {
        Ok(self.shared.entry(handle)?.lock().stats())
    }

    /// Stops the round task. Streams are dropped without further sending.
    pub async fn stop(&self, max_wait: Duration) -> bool {
        self.shared.is_stopped.store(true, Ordering::Release);
        self.shared.space.notify_waiters();

        let handle = match self.lock_handle().take() {
            Some(handle) => handle,
            None => return true,
        };
        self.shared.stop.notify_one();

        let result = match timeout(max_wait, handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!("transmitter did not stop within {:?}", max_wait);
                false
            }
        };
        self.shared.write_streams().clear();
        self.shared.pending_packets.store(0, Ordering::Release);
        result
    }

    async fn do_loop(shared: Arc<TxShared>) {
        info!(msg_key = 5297, "transmitter started");
        let cycle = shared.config.advanced.task_timer_cycle;
        loop {
            select! {
                _ = shared.stop.notified() => break,
                _ = shared.work.notified() => {}
                _ = sleep(cycle) => {}
            }

            loop {
                let outcome = shared.fire_round(Instant::now());
                if outcome.packets_sent == 0 || !outcome.has_pending {
                    break;
                }
                tokio::task::yield_now().await;
            }
        }
        info!(msg_key = 5298, "transmitter stopped");
    }
}

impl TxShared {
    fn read_streams(&self) -> std::sync::RwLockReadGuard<'_, FxHashMap<Gsi, Arc<TxStreamEntry>>> {
        self.streams.read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_streams(&self) -> std::sync::RwLockWriteGuard<'_, FxHashMap<Gsi, Arc<TxStreamEntry>>> {
        self.streams.write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_bucket(&self) -> MutexGuard<'_, Option<TokenBucket>> {
        self.bucket.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_running(&self) -> RumResult<()> {
        if self.is_stopped.load(Ordering::Acquire) {
            return Err(RumError::InstanceClosed);
        }
        Ok(())
    }

    fn entry(&self, handle: TxStreamHandle) -> RumResult<Arc<TxStreamEntry>> {
        self.check_running()?;
        match self.read_streams().get(&handle.gsi) {
            Some(entry) if entry.serial == handle.serial => Ok(entry.clone()),
            _ => Err(RumError::QueueInvalid),
        }
    }

    fn remove_stream(&self, gsi: Gsi) {
        if let Some(entry) = self.write_streams().remove(&gsi) {
            let pending = entry.lock().pending_packets();
            self.adjust_pending(pending, 0);
            debug!("removed transmit stream {:?}", gsi);
        }
    }

    fn adjust_pending(&self, before: usize, after: usize) {
        if after > before {
            self.pending_packets.fetch_add(after - before, Ordering::AcqRel);
        }
        else if before > after {
            let _ = self.pending_packets.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(before - after)));
            self.space.notify_waiters();
        }
    }

    async fn wait_for_space(&self) -> RumResult<()> {
        let max_pending = self.config.max_pending_packets();
        loop {
            let notified = self.space.notified();
            self.check_running()?;
            if self.pending_packets.load(Ordering::Acquire) < max_pending {
                return Ok(());
            }
            if !self.config.advanced.submit_blocking {
                debug!("pending queue is full - rejecting submission");
                return Err(RumError::MemoryAlert);
            }
            trace!("pending queue is full - waiting");
            notified.await;
        }
    }

    fn fire_round(&self, now: Instant) -> RoundOutcome {
        let streams = self.read_streams().values()
            .cloned()
            .collect::<Vec<_>>();
        if streams.is_empty() {
            return RoundOutcome::default();
        }

        let advanced = &self.config.advanced;
        let is_cleaning = self.pool.utilization_percent() > advanced.cleaning_mark_percent;
        let budget = RoundBudget {
            packets: if is_cleaning { advanced.packets_per_round_when_cleaning } else { advanced.packets_per_round },
            rdata_send_percent: advanced.rdata_send_percent,
            cleaning: is_cleaning.then(|| TrimParams {
                keep: self.config.min_history_packets() / streams.len(),
                min_trim_size: advanced.min_trim_size,
            }),
        };
        if is_cleaning {
            trace!("transmit pool at {}% - cleaning", self.pool.utilization_percent());
        }

        let mut outcome = RoundOutcome::default();
        let mut bucket = self.lock_bucket();
        let mut out = Vec::new();
        for entry in streams {
            {
                let mut stream = entry.lock();
                let before = stream.pending_packets();
                stream.fire(now, budget, &mut *bucket, &self.pool, &mut out);
                self.adjust_pending(before, stream.pending_packets());
                outcome.has_pending |= stream.pending_packets() > 0;
            }

            outcome.packets_sent += out.len();
            for packet in out.drain(..) {
                if !entry.connection.send_packet(packet) {
                    trace!("{:?} does not accept packets - dropping", entry.connection.id());
                }
            }
        }
        outcome
    }
}
