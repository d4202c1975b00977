use crate::buffers::buffer_pool::{BufferPool, PooledBuf};
use crate::buffers::seq_window::SeqWindow;
use crate::codec::apply_checksum;
use crate::codec::byte_order::{patch_u16, patch_u32, ByteOrder};
use crate::codec::message_record::{record_len, ser_record};
use crate::codec::options::{FragmentInfo, PacketOption, Reliability, StreamControl};
use crate::codec::packet_header::{CommonHeader, DataBody, Gsi, HeaderOptions, PacketBody, PacketType, SpmBody, StreamPacket};
use crate::config::AdvancedConfig;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::seq::Sqn;
use crate::transmitter::spm_schedule::SpmSchedule;
use crate::transmitter::token_bucket::TokenBucket;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Everything that is fixed for the lifetime of a transmit stream
#[derive(Debug, Clone)]
pub struct TxStreamSetup {
    pub gsi: Gsi,
    pub queue_name: String,
    pub reliability: Reliability,
    pub is_late_join: bool,
    pub msg_properties: bool,
    /// the application delimits packets with `dont_batch`, there is no timer based flush
    pub app_batching: bool,
    pub order: ByteOrder,
    pub source_port: u16,
    pub dest_port: u16,
    pub source_nla: IpAddr,
    pub group_nla: IpAddr,
    pub packet_size: usize,
    pub checksum: bool,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct TxStreamStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub repair_packets: u64,
    pub repair_bytes: u64,
    pub naks_received: u64,
    pub txw_trail: u32,
    pub txw_lead: u32,
    pub history_packets: usize,
    pub pending_packets: usize,
}

/// Per-round limits the transmitter hands to each stream
#[derive(Debug, Clone, Copy)]
pub struct RoundBudget {
    pub packets: usize,
    pub rdata_send_percent: u32,
    /// `Some` while the transmit pool is above its cleaning mark
    pub cleaning: Option<TrimParams>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TrimParams {
    /// number of history packets this stream keeps
    pub keep: usize,
    pub min_trim_size: usize,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct NakOutcome {
    pub queued: usize,
    pub outside_window: usize,
}

struct Batch {
    payload: BytesMut,
    first_msg_sqn: u64,
    started: Instant,
    last_append: Instant,
}

/// The synchronous core of a transmit stream.
///
/// Submitted messages are packed into ODATA packets which wait in `pending` until the
///  transmitter's round gives them a slot. Sent packets of reliable streams go to `history`, a
///  window covering `[txw_trail, txw_lead)`, from which NAKed sequence numbers are replayed as
///  RDATA. Packets are serialized once when they are built; trail, type and checksum are
///  patched at send time.
pub struct TxStream {
    setup: TxStreamSetup,
    max_payload: usize,
    min_batching: Duration,
    max_batching: Duration,
    max_sqns_per_ncf: usize,

    batch: Option<Batch>,
    next_msg_sqn: u64,
    next_sqn: Sqn,
    pending: VecDeque<PooledBuf>,
    history: SeqWindow<PooledBuf>,
    repairs: VecDeque<Sqn>,
    ncfs: Vec<Sqn>,

    spm: SpmSchedule,
    next_spm_sqn: Sqn,
    close_linger: Option<Duration>,
    close_announced: bool,

    stats: TxStreamStats,
}

impl TxStream {
    pub fn new(setup: TxStreamSetup, config: &AdvancedConfig, now: Instant) -> TxStream {
        let max_payload = Self::max_payload(&setup);
        debug!("new transmit stream {:?} for queue {:?}: {:?}, max payload {} bytes", setup.gsi, setup.queue_name, setup.reliability, max_payload);

        TxStream {
            setup,
            max_payload,
            min_batching: config.min_batching,
            max_batching: config.max_batching,
            max_sqns_per_ncf: config.max_sqn_per_nack.max(1),
            batch: None,
            next_msg_sqn: 0,
            next_sqn: Sqn::ZERO,
            pending: VecDeque::new(),
            history: SeqWindow::new(Sqn::ZERO),
            repairs: VecDeque::new(),
            ncfs: Vec::new(),
            spm: SpmSchedule::new(config.inter_heartbeat_min, config.inter_heartbeat_max, config.inter_heartbeat_ambient, now),
            next_spm_sqn: Sqn::ZERO,
            close_linger: None,
            close_announced: false,
            stats: TxStreamStats::default(),
        }
    }

    /// payload bytes that fit into a data packet carrying every option a data packet can have
    fn max_payload(setup: &TxStreamSetup) -> usize {
        let template = StreamPacket {
            header: Self::header(setup, PacketType::Odata),
            body: PacketBody::Data(DataBody { data_sqn: Sqn::ZERO, trail: Sqn::ZERO }),
            options: vec![
                PacketOption::MsgToPacket { first_msg_sqn: 0 },
                PacketOption::Fragment(FragmentInfo { first_sqn: Sqn::ZERO, offset: 0, total_len: 0 }),
                PacketOption::Join { late_join_mark: Sqn::ZERO },
            ],
        };
        setup.packet_size
            .saturating_sub(template.serialized_len_without_payload())
            .max(1)
    }

    fn header(setup: &TxStreamSetup, packet_type: PacketType) -> CommonHeader {
        CommonHeader {
            source_port: setup.source_port,
            dest_port: setup.dest_port,
            packet_type,
            options: HeaderOptions::empty(),
            checksum: 0,
            gsi: setup.gsi,
            tsdu_length: 0,
        }
    }

    pub fn gsi(&self) -> Gsi {
        self.setup.gsi
    }

    pub fn queue_name(&self) -> &str {
        &self.setup.queue_name
    }

    pub fn reliability(&self) -> Reliability {
        self.setup.reliability
    }

    pub fn has_msg_properties(&self) -> bool {
        self.setup.msg_properties
    }

    pub fn txw_trail(&self) -> Sqn {
        self.history.base()
    }

    pub fn txw_lead(&self) -> Sqn {
        self.history.end()
    }

    pub fn pending_packets(&self) -> usize {
        self.pending.len()
    }

    pub fn history_packets(&self) -> usize {
        self.history.len()
    }

    pub fn is_closing(&self) -> bool {
        self.close_linger.is_some()
    }

    pub fn stats(&self) -> TxStreamStats {
        TxStreamStats {
            txw_trail: self.txw_trail().to_raw(),
            txw_lead: self.txw_lead().to_raw(),
            history_packets: self.history.len(),
            pending_packets: self.pending.len(),
            ..self.stats.clone()
        }
    }

    /// Adds a message to the stream, returning its message sequence number. Messages that do
    ///  not fit into a single packet are fragmented and always start a packet of their own.
    pub fn submit(&mut self, message: &[u8], property_block: Option<&[u8]>, dont_batch: bool, pool: &Arc<BufferPool>, now: Instant) -> u64 {
        let msg_sqn = self.next_msg_sqn;
        self.next_msg_sqn += 1;
        self.stats.messages_sent += 1;

        let len = record_len(property_block, message);
        if len > self.max_payload {
            self.flush_batch(pool);

            let mut record = BytesMut::with_capacity(len);
            ser_record(&mut record, self.setup.order, property_block, message);
            let first_sqn = self.next_sqn;
            trace!("{:?}: fragmenting message {} of {} bytes starting at {:?}", self.setup.gsi, msg_sqn, len, first_sqn);

            for (i, chunk) in record.chunks(self.max_payload).enumerate() {
                let fragment = FragmentInfo {
                    first_sqn,
                    offset: (i * self.max_payload).prechecked_cast(),
                    total_len: len.prechecked_cast(),
                };
                self.build_odata(chunk, msg_sqn, Some(fragment), pool);
            }
            return msg_sqn;
        }

        if self.batch.as_ref().is_some_and(|b| b.payload.len() + len > self.max_payload) {
            self.flush_batch(pool);
        }
        let max_payload = self.max_payload;
        let batch = self.batch.get_or_insert_with(|| Batch {
            payload: BytesMut::with_capacity(max_payload),
            first_msg_sqn: msg_sqn,
            started: now,
            last_append: now,
        });
        ser_record(&mut batch.payload, self.setup.order, property_block, message);
        batch.last_append = now;

        if dont_batch {
            self.flush_batch(pool);
        }
        msg_sqn
    }

    /// turns the messages collected so far into a packet
    pub fn flush_batch(&mut self, pool: &Arc<BufferPool>) {
        if let Some(batch) = self.batch.take() {
            self.build_odata(&batch.payload, batch.first_msg_sqn, None, pool);
        }
    }

    fn is_batch_due(&self, now: Instant) -> bool {
        if self.setup.app_batching {
            return false;
        }
        match &self.batch {
            Some(batch) => now >= batch.last_append + self.min_batching || now >= batch.started + self.max_batching,
            None => false,
        }
    }

    fn build_odata(&mut self, payload: &[u8], first_msg_sqn: u64, fragment: Option<FragmentInfo>, pool: &Arc<BufferPool>) {
        let sqn = self.next_sqn;
        self.next_sqn = sqn.next();

        let mut options = vec![PacketOption::MsgToPacket { first_msg_sqn }];
        if let Some(fragment) = fragment {
            options.push(PacketOption::Fragment(fragment));
        }
        if self.setup.is_late_join {
            options.push(PacketOption::Join { late_join_mark: self.txw_trail() });
        }

        let packet = StreamPacket {
            header: Self::header(&self.setup, PacketType::Odata),
            body: PacketBody::Data(DataBody { data_sqn: sqn, trail: self.txw_trail() }),
            options,
        };
        let mut buf = pool.get_from_pool();
        packet.ser(&mut *buf, self.setup.order, payload);
        trace!("{:?}: built ODATA {:?} with {} payload bytes", self.setup.gsi, sqn, payload.len());
        self.pending.push_back(buf);
    }

    /// copies a stored data packet for sending, patching in the current trail
    fn finalize_data(&self, stored: &[u8], packet_type: PacketType) -> Bytes {
        let mut packet = BytesMut::from(stored);
        packet[CommonHeader::OFFSET_TYPE] = packet_type.into();
        patch_u32(&mut packet, DataBody::OFFSET_TRAIL, self.setup.order, self.wire_trail().to_raw());
        self.finalize(packet)
    }

    fn finalize(&self, mut packet: BytesMut) -> Bytes {
        patch_u16(&mut packet, CommonHeader::OFFSET_CHECKSUM, self.setup.order, 0);
        if self.setup.checksum {
            apply_checksum(&mut packet, self.setup.order);
        }
        packet.freeze()
    }

    /// the trail announced on the wire: receivers of unreliable streams never ask for repairs
    fn wire_trail(&self) -> Sqn {
        if self.setup.reliability.is_reliable() {
            self.txw_trail()
        }
        else {
            self.txw_lead()
        }
    }

    pub fn spm_packet(&mut self) -> Bytes {
        let spm_sqn = self.next_spm_sqn;
        self.next_spm_sqn = spm_sqn.next();

        let mut options = Vec::new();
        if self.setup.is_late_join {
            options.push(PacketOption::Join { late_join_mark: self.txw_trail() });
        }
        options.push(PacketOption::StreamControl(StreamControl {
            reliability: self.setup.reliability,
            is_active: self.close_linger.is_none(),
            keep_history: self.setup.reliability == Reliability::Reliable,
            close_linger_millis: self.close_linger
                .map(|d| d.as_millis().min(u32::MAX as u128) as u32)
                .unwrap_or(0),
        }));
        if self.setup.msg_properties {
            options.push(PacketOption::MsgProperties);
        }
        options.push(PacketOption::QueueName(self.setup.queue_name.clone()));

        let packet = StreamPacket {
            header: Self::header(&self.setup, PacketType::Spm),
            body: PacketBody::Spm(SpmBody {
                spm_sqn,
                trail: self.wire_trail(),
                lead: self.txw_lead(),
                nla: self.setup.source_nla,
            }),
            options,
        };
        let mut buf = BytesMut::with_capacity(packet.serialized_len_without_payload());
        packet.ser(&mut buf, self.setup.order, &[]);

        if self.close_linger.is_some() {
            self.close_announced = true;
        }
        trace!("{:?}: SPM {:?} trail={:?} lead={:?}", self.setup.gsi, spm_sqn, self.wire_trail(), self.txw_lead());
        self.finalize(buf)
    }

    /// Registers a NAK. Sequence numbers inside `[txw_trail, txw_lead)` are confirmed with an
    ///  NCF and queued for repair, others are ignored and answered with an SPM so the receiver
    ///  learns the current window.
    pub fn on_nak(&mut self, sqns: &[Sqn]) -> NakOutcome {
        self.stats.naks_received += 1;
        let mut outcome = NakOutcome::default();

        if !self.setup.reliability.is_reliable() {
            debug!("{:?}: ignoring NAK on unreliable stream", self.setup.gsi);
            self.spm.force();
            return outcome;
        }

        for &sqn in sqns {
            if sqn.is_before(self.txw_trail()) || !sqn.is_before(self.txw_lead()) {
                debug!("{:?}: NAK for {:?} is outside the transmit window [{:?}, {:?}) - not repairing", self.setup.gsi, sqn, self.txw_trail(), self.txw_lead());
                outcome.outside_window += 1;
                continue;
            }
            if !self.ncfs.contains(&sqn) {
                self.ncfs.push(sqn);
            }
            if !self.repairs.contains(&sqn) {
                self.repairs.push_back(sqn);
                outcome.queued += 1;
            }
        }

        if outcome.outside_window > 0 {
            self.spm.force();
        }
        outcome
    }

    /// Drops the oldest history packets down to `params.keep`, leaving packets with a pending
    ///  repair in place. Returns the number of packets dropped.
    pub fn trim_history(&mut self, params: TrimParams) -> usize {
        if self.history.len() <= params.keep {
            return 0;
        }

        let keep: u32 = params.keep.prechecked_cast();
        let mut new_trail = self.txw_lead() - keep;
        for &sqn in &self.repairs {
            new_trail = new_trail.min(sqn);
        }

        let trim_size: usize = self.txw_trail().distance_to(new_trail).safe_cast();
        if trim_size == 0 || trim_size < params.min_trim_size {
            return 0;
        }
        let dropped = self.history.advance_to(new_trail).len();
        debug!("{:?}: trimmed {} history packets, trail is now {:?}", self.setup.gsi, dropped, self.txw_trail());
        dropped
    }

    /// One transmit round for this stream: SPM if due, NCFs, repairs, trimming, and new data
    ///  up to the round's budget. Packets for the wire are appended to `out`.
    pub fn fire(&mut self, now: Instant, budget: RoundBudget, bucket: &mut Option<TokenBucket>, pool: &Arc<BufferPool>, out: &mut Vec<Bytes>) {
        if self.is_batch_due(now) {
            self.flush_batch(pool);
        }

        // while closing, SPMs go out after the remaining data so the close announcement is last
        if !self.is_closing() && self.spm.poll(now) {
            let spm = self.spm_packet();
            out.push(spm);
        }

        for chunk in self.ncfs.chunks(self.max_sqns_per_ncf) {
            if let Some(ncf) = StreamPacket::nak_or_ncf(PacketType::Ncf, self.setup.source_port, self.setup.dest_port, self.setup.gsi, chunk, self.setup.source_nla, self.setup.group_nla) {
                let mut buf = BytesMut::new();
                ncf.ser(&mut buf, self.setup.order, &[]);
                out.push(self.finalize(buf));
            }
        }
        self.ncfs.clear();

        let mut remaining = budget.packets;
        let max_rdata = if budget.cleaning.is_some() {
            self.repairs.len()
        }
        else {
            let percent: usize = budget.rdata_send_percent.safe_cast();
            (budget.packets * percent / 100).max(1)
        };
        let mut num_rdata = 0;
        while num_rdata < max_rdata && remaining > 0 {
            let Some(sqn) = self.repairs.pop_front() else {
                break;
            };
            let Some(stored) = self.history.get(sqn) else {
                debug!("{:?}: {:?} left the history before it could be repaired", self.setup.gsi, sqn);
                continue;
            };
            let packet = self.finalize_data(stored, PacketType::Rdata);
            if let Some(bucket) = bucket.as_mut() {
                if !bucket.try_consume(packet.len(), now) {
                    self.repairs.push_front(sqn);
                    break;
                }
            }
            trace!("{:?}: RDATA {:?}", self.setup.gsi, sqn);
            self.stats.repair_packets += 1;
            self.stats.repair_bytes += packet.len() as u64;
            out.push(packet);
            num_rdata += 1;
            remaining -= 1;
        }

        if let Some(trim) = budget.cleaning {
            self.trim_history(trim);
        }

        while remaining > 0 {
            let Some(len) = self.pending.front().map(|p| p.len()) else {
                break;
            };
            if let Some(bucket) = bucket.as_mut() {
                if !bucket.try_consume(len, now) {
                    break;
                }
            }
            let Some(stored) = self.pending.pop_front() else {
                break;
            };

            let sqn = self.txw_lead();
            if self.setup.reliability.is_reliable() {
                let packet = self.finalize_data(&stored, PacketType::Odata);
                let _ = self.history.insert(sqn, stored);
                out.push(packet);
            }
            else {
                let _ = self.history.reset(sqn.next());
                out.push(self.finalize_data(&stored, PacketType::Odata));
            }

            self.stats.packets_sent += 1;
            self.stats.bytes_sent += len as u64;
            self.spm.on_data_sent(now);
            remaining -= 1;
        }

        if self.is_closing() && self.pending.is_empty() && self.spm.poll(now) {
            let spm = self.spm_packet();
            out.push(spm);
        }
    }

    /// Starts closing: collected messages are flushed, and the next SPM announces the close
    pub fn begin_close(&mut self, linger: Duration, pool: &Arc<BufferPool>) {
        self.flush_batch(pool);
        self.close_linger = Some(linger);
        self.close_announced = false;
        self.spm.force();
    }

    /// nothing left to send, and the close was announced
    pub fn is_drained(&self) -> bool {
        self.close_announced
            && self.batch.is_none()
            && self.pending.is_empty()
            && self.repairs.is_empty()
            && self.ncfs.is_empty()
    }
}
