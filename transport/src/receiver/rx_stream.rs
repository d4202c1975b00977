use crate::buffers::buffer_pool::{BufferPool, PooledBuf};
use crate::buffers::seq_window::SeqWindow;
use crate::codec::apply_checksum;
use crate::codec::byte_order::ByteOrder;
use crate::codec::message_record::{parse_records, MessageProperty};
use crate::codec::options::{FragmentInfo, PacketOption, Reliability, StreamControl};
use crate::codec::packet_header::{Gsi, PacketBody, PacketType, StreamPacket};
use crate::config::AdvancedConfig;
use crate::events::{ConnectionId, EventType, StreamEvent};
use crate::receiver::nak::{AdaptiveTimeout, NakAction, NakRecord, NakState, NakTimeouts};
use crate::receiver::reassembly::{FragmentOutcome, Reassembler};
use crate::seq::Sqn;
use bytes::{Bytes, BytesMut};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// How a receive queue hands data to the application
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeliveryKind {
    /// one callback per message, with its properties
    Messages,
    /// one callback per data packet, the payload is passed on unparsed
    Packets,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RxMessage {
    pub gsi: Gsi,
    pub msg_sqn: u64,
    pub properties: Vec<MessageProperty>,
    pub data: Bytes,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RxPacket {
    pub gsi: Gsi,
    pub sqn: Sqn,
    pub first_msg_sqn: u64,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RxDelivery {
    Message(RxMessage),
    Packet(RxPacket),
}

/// What processing a packet or timer produced: data for the application, events, and NAK
///  packets to send back to the transmitter
#[derive(Debug, Default)]
pub struct RxOutput {
    pub deliveries: Vec<RxDelivery>,
    pub events: Vec<StreamEvent>,
    pub packets: Vec<Bytes>,
}

/// The SPM fields a receiver acts on
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SpmInfo {
    pub spm_sqn: Sqn,
    pub trail: Sqn,
    pub lead: Sqn,
    pub nla: IpAddr,
    pub source_port: u16,
    pub dest_port: u16,
    pub control: Option<StreamControl>,
    pub late_join_mark: Option<Sqn>,
    pub queue_name: Option<String>,
    pub msg_properties: bool,
}

impl SpmInfo {
    pub fn from_packet(packet: &StreamPacket) -> Option<SpmInfo> {
        let PacketBody::Spm(spm) = &packet.body else {
            return None;
        };
        Some(SpmInfo {
            spm_sqn: spm.spm_sqn,
            trail: spm.trail,
            lead: spm.lead,
            nla: spm.nla,
            source_port: packet.header.source_port,
            dest_port: packet.header.dest_port,
            control: packet.option(|o| match o {
                PacketOption::StreamControl(control) => Some(*control),
                _ => None,
            }),
            late_join_mark: packet.option(|o| match o {
                PacketOption::Join { late_join_mark } => Some(*late_join_mark),
                _ => None,
            }),
            queue_name: packet.option(|o| match o {
                PacketOption::QueueName(name) => Some(name.clone()),
                _ => None,
            }),
            msg_properties: packet.options.contains(&PacketOption::MsgProperties),
        })
    }

    pub fn reliability(&self) -> Reliability {
        self.control
            .map(|c| c.reliability)
            .unwrap_or(Reliability::Reliable)
    }
}

/// The header fields of an ODATA or RDATA packet
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DataInfo {
    pub sqn: Sqn,
    pub trail: Sqn,
    pub is_repair: bool,
    pub first_msg_sqn: u64,
    pub fragment: Option<FragmentInfo>,
}

impl DataInfo {
    pub fn from_packet(packet: &StreamPacket) -> Option<DataInfo> {
        let data = packet.data_body()?;
        Some(DataInfo {
            sqn: data.data_sqn,
            trail: data.trail,
            is_repair: packet.header.packet_type == PacketType::Rdata,
            first_msg_sqn: packet.option(|o| match o {
                PacketOption::MsgToPacket { first_msg_sqn } => Some(*first_msg_sqn),
                _ => None,
            }).unwrap_or(0),
            fragment: packet.option(|o| match o {
                PacketOption::Fragment(info) => Some(*info),
                _ => None,
            }),
        })
    }
}

/// Everything that is fixed for the lifetime of a receive stream
#[derive(Debug, Clone)]
pub struct RxStreamSetup {
    pub gsi: Gsi,
    pub queue_name: String,
    pub connection_id: ConnectionId,
    pub queue_reliability: Reliability,
    pub ordered: bool,
    pub delivery: DeliveryKind,
    pub msg_properties: bool,
    /// how many packets before the transmitter's lead a late joining receiver asks for
    pub join_backtrack: u32,
    pub peer_order: ByteOrder,
    pub local_order: ByteOrder,
    pub local_nla: IpAddr,
    /// the largest gap that is tracked for repair, beyond it data is given up as lost
    pub max_gap: u32,
    pub checksum: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RxState {
    /// created, waiting for the first SPM to place the window
    Handshake,
    Active,
    /// the transmitter announced its close, the stream lingers for repairs
    Suspended,
    Closed,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct RxStreamStats {
    pub packets_received: u64,
    pub duplicates: u64,
    pub naks_sent: u64,
    pub messages_delivered: u64,
    pub lost_packets: u64,
    pub rxw_trail: u32,
    pub rxw_lead: u32,
}

#[derive(Debug)]
struct ReceivedPacket {
    payload: PooledBuf,
    first_msg_sqn: u64,
    fragment: Option<FragmentInfo>,
}

#[derive(Debug)]
enum Slot {
    Missing(NakRecord),
    Received(ReceivedPacket),
    /// handed to the application out of order, kept to recognize duplicates
    Delivered,
    Lost,
}

/// The receive side of one stream. Every sequence number between the window's base and
///  `lead` has a slot, so holes are always backed by a NAK record until they are repaired or
///  given up.
pub struct RxStream {
    setup: RxStreamSetup,
    state: RxState,
    stream_reliability: Reliability,
    window: SeqWindow<Slot>,
    /// one past the highest sequence number known to exist
    lead: Sqn,
    /// the transmitter's announced trail, nothing before it can be repaired
    rxw_trail: Sqn,
    last_spm_sqn: Option<Sqn>,
    source_nla: IpAddr,
    nak_source_port: u16,
    nak_dest_port: u16,
    timeouts: NakTimeouts,
    max_sqn_per_nack: usize,
    reassembler: Reassembler,
    close_at: Option<Instant>,
    has_delivered: bool,
    stats: RxStreamStats,
}

impl RxStream {
    /// Creates a stream from the first SPM seen for it, placing the window according to the
    ///  join policy
    pub fn new(setup: RxStreamSetup, spm: &SpmInfo, config: &AdvancedConfig, now: Instant, out: &mut RxOutput) -> RxStream {
        let mut result = RxStream {
            state: RxState::Handshake,
            stream_reliability: spm.reliability(),
            window: SeqWindow::new(spm.lead),
            lead: spm.lead,
            rxw_trail: spm.trail,
            last_spm_sqn: None,
            source_nla: spm.nla,
            nak_source_port: spm.dest_port,
            nak_dest_port: spm.source_port,
            timeouts: NakTimeouts {
                back_off: config.nack_timeout_bof,
                ncf: AdaptiveTimeout::new(config.nack_timeout_ncf),
                data: AdaptiveTimeout::new(config.nack_timeout_data),
                ncf_retries: config.nack_retries_ncf,
                data_retries: config.nack_retries_data,
            },
            max_sqn_per_nack: config.max_sqn_per_nack.max(1),
            reassembler: Reassembler::new(config.max_fragment_bytes, config.fragment_timeout),
            close_at: None,
            has_delivered: false,
            stats: Default::default(),
            setup,
        };
        if result.setup.queue_reliability != result.stream_reliability {
            info!("{:?}: queue {:?} is {:?}, its transmitter is {:?}", result.setup.gsi, result.setup.queue_name, result.setup.queue_reliability, result.stream_reliability);
            out.events.push(result.event(EventType::Reliability)
                .with_details(format!("queue is {:?}, stream is {:?}", result.setup.queue_reliability, result.stream_reliability)));
        }
        result.on_spm(spm, now, out);
        result
    }

    pub fn gsi(&self) -> Gsi {
        self.setup.gsi
    }

    pub fn queue_name(&self) -> &str {
        &self.setup.queue_name
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.setup.connection_id
    }

    pub fn state(&self) -> RxState {
        self.state
    }

    pub fn rxw_trail(&self) -> Sqn {
        self.rxw_trail
    }

    pub fn rxw_lead(&self) -> Sqn {
        self.lead
    }

    /// the next sequence number to be delivered in order
    pub fn next_to_deliver(&self) -> Sqn {
        self.window.base()
    }

    pub fn is_reliable(&self) -> bool {
        self.setup.queue_reliability.is_reliable() && self.stream_reliability.is_reliable()
    }

    pub fn num_missing(&self) -> usize {
        self.window.iter()
            .filter(|(_, slot)| matches!(slot, Slot::Missing(_)))
            .count()
    }

    pub fn stats(&self) -> RxStreamStats {
        RxStreamStats {
            rxw_trail: self.rxw_trail.to_raw(),
            rxw_lead: self.lead.to_raw(),
            ..self.stats.clone()
        }
    }

    fn event(&self, event_type: EventType) -> StreamEvent {
        StreamEvent::new(event_type)
            .with_gsi(self.setup.gsi)
            .with_queue_name(&self.setup.queue_name)
            .with_connection(self.setup.connection_id)
    }

    fn loss_event_type(&self) -> EventType {
        if self.is_reliable() {
            EventType::MessageLoss
        }
        else {
            EventType::PacketLoss
        }
    }

    fn report_loss(&mut self, lost: u32, details: &str, out: &mut RxOutput) {
        if lost == 0 {
            return;
        }
        self.stats.lost_packets += u64::from(lost);
        warn!(msg_key = 4310, "{:?}: {} packets lost ({})", self.setup.gsi, lost, details);
        out.events.push(self.event(self.loss_event_type())
            .with_lost(lost)
            .with_details(details));
    }

    pub fn on_spm(&mut self, spm: &SpmInfo, now: Instant, out: &mut RxOutput) {
        if let Some(last) = self.last_spm_sqn {
            if spm.spm_sqn.is_before_or_eq(last) {
                trace!("{:?}: ignoring stale SPM {:?}", self.setup.gsi, spm.spm_sqn);
                return;
            }
        }
        self.last_spm_sqn = Some(spm.spm_sqn);

        match self.state {
            RxState::Closed => return,
            RxState::Handshake => self.join(spm, now, out),
            RxState::Active | RxState::Suspended => {
                if let Some(control) = &spm.control {
                    self.apply_control(control, now, out);
                }
            }
        }
        if self.state == RxState::Handshake {
            return;
        }
        if let Some(control) = &spm.control {
            if !control.is_active {
                self.suspend(Duration::from_millis(control.close_linger_millis.into()), now);
            }
        }

        self.advance_trail(spm.trail, now, out);
        if self.lead.is_before(spm.lead) {
            self.open_gap(spm.lead, now, out);
        }
        self.deliver(now, out);
    }

    fn join(&mut self, spm: &SpmInfo, now: Instant, out: &mut RxOutput) {
        let mut start = spm.lead;
        if self.is_reliable() && self.setup.join_backtrack > 0 {
            if let Some(mark) = spm.late_join_mark {
                start = spm.lead - self.setup.join_backtrack.min(mark.distance_to(spm.lead));
                if start.is_before(spm.trail) {
                    warn!(msg_key = 4315, "{:?}: late join from {:?} is no longer covered by the transmitter's history starting at {:?}", self.setup.gsi, start, spm.trail);
                    out.events.push(self.event(EventType::LateJoinFailure)
                        .with_lost(start.distance_to(spm.trail))
                        .with_details(format!("history starts at {}", spm.trail)));
                    start = spm.trail;
                }
            }
        }

        info!(msg_key = 5311, "{:?}: joining stream of queue {:?} at {:?}, transmitter at [{:?}, {:?})", self.setup.gsi, self.setup.queue_name, start, spm.trail, spm.lead);
        self.window.reset(start);
        self.lead = start;
        self.rxw_trail = spm.trail;
        self.state = RxState::Active;
    }

    fn apply_control(&mut self, control: &StreamControl, now: Instant, out: &mut RxOutput) {
        if control.reliability == self.stream_reliability {
            return;
        }
        info!("{:?}: transmitter changed reliability from {:?} to {:?}", self.setup.gsi, self.stream_reliability, control.reliability);
        self.stream_reliability = control.reliability;
        out.events.push(self.event(EventType::ReliabilityChanged)
            .with_details(format!("{:?}", control.reliability)));

        if !self.is_reliable() {
            let lost = self.give_up_holes(|_| true);
            self.report_loss(lost, "stream became unreliable", out);
            self.deliver(now, out);
        }
    }

    fn suspend(&mut self, linger: Duration, now: Instant) {
        if self.state != RxState::Active {
            return;
        }
        info!(msg_key = 5312, "{:?}: transmitter is closing, lingering for {:?}", self.setup.gsi, linger);
        self.state = RxState::Suspended;
        self.close_at = Some(now + linger);
    }

    /// marks holes as lost, returning their number
    fn give_up_holes(&mut self, filter: impl Fn(Sqn) -> bool) -> u32 {
        let mut lost = 0;
        for (sqn, slot) in self.window.iter_mut() {
            if matches!(slot, Slot::Missing(_)) && filter(sqn) {
                *slot = Slot::Lost;
                lost += 1;
            }
        }
        lost
    }

    fn advance_trail(&mut self, trail: Sqn, now: Instant, out: &mut RxOutput) {
        if !self.rxw_trail.is_before(trail) {
            return;
        }
        self.rxw_trail = trail;
        if !self.window.base().is_before(trail) {
            return;
        }

        let lost = self.skip_to(trail, now, out);
        if self.is_reliable() {
            self.report_loss(lost, "repair data is no longer available", out);
        }
        else {
            self.report_loss(lost, "packets missed", out);
        }
    }

    /// Gives up everything before `new_base` that was not received, delivering what was.
    ///  Returns the number of lost sequence numbers.
    fn skip_to(&mut self, new_base: Sqn, now: Instant, out: &mut RxOutput) -> u32 {
        let mut lost = self.give_up_holes(|sqn| sqn.is_before(new_base));
        if self.lead.is_before(new_base) {
            lost += self.lead.distance_to(new_base);
            self.lead = new_base;
        }
        self.deliver(now, out);
        if self.window.base().is_before(new_base) {
            let dropped = self.window.advance_to(new_base);
            trace!("{:?}: dropped {} slots skipping to {:?}", self.setup.gsi, dropped.len(), new_base);
        }
        lost
    }

    /// Extends the window to `until` (exclusive), tracking every new sequence number as a hole
    fn open_gap(&mut self, until: Sqn, now: Instant, out: &mut RxOutput) {
        let gap = self.lead.distance_to(until);
        if gap > self.setup.max_gap {
            debug!("{:?}: gap of {} packets exceeds the limit of {}", self.setup.gsi, gap, self.setup.max_gap);
            let lost = self.skip_to(until - self.setup.max_gap, now, out);
            self.report_loss(lost, "gap too large to repair", out);
        }

        let is_reliable = self.is_reliable();
        let mut lost = 0;
        for sqn in self.lead.to(until) {
            let slot = if is_reliable {
                Slot::Missing(NakRecord::new(now, self.timeouts.back_off))
            }
            else {
                lost += 1;
                Slot::Lost
            };
            let _ = self.window.insert(sqn, slot);
        }
        self.lead = self.lead.max(until);
        self.report_loss(lost, "packets missed", out);
    }

    pub fn on_data(&mut self, data: &DataInfo, payload: &[u8], pool: &Arc<BufferPool>, now: Instant, out: &mut RxOutput) {
        if !matches!(self.state, RxState::Active | RxState::Suspended) {
            trace!("{:?}: dropping data in state {:?}", self.setup.gsi, self.state);
            return;
        }
        self.stats.packets_received += 1;
        self.advance_trail(data.trail, now, out);

        let sqn = data.sqn;
        if sqn.is_before(self.window.base()) {
            trace!("{:?}: duplicate {:?} below the window", self.setup.gsi, sqn);
            self.stats.duplicates += 1;
            return;
        }

        if sqn.is_before(self.lead) {
            match self.window.get_mut(sqn) {
                Some(Slot::Missing(record)) => {
                    if let Some(rtt) = record.on_repaired(now) {
                        if let Some(adjusted) = self.timeouts.data.add_sample(rtt) {
                            info!(msg_key = 5278, "{:?}: NAK data timeout adjusted to {:?}", self.setup.gsi, adjusted);
                        }
                    }
                }
                _ => {
                    trace!("{:?}: duplicate {:?}", self.setup.gsi, sqn);
                    self.stats.duplicates += 1;
                    return;
                }
            }
        }
        else {
            self.open_gap(sqn, now, out);
            self.lead = sqn + 1;
        }

        let Some(mut buf) = pool.try_get_from_pool() else {
            debug!("{:?}: receive pool exhausted - dropping {:?}", self.setup.gsi, sqn);
            if !self.window.contains(sqn) {
                let slot = if self.is_reliable() {
                    Slot::Missing(NakRecord::new(now, self.timeouts.back_off))
                }
                else {
                    Slot::Lost
                };
                let _ = self.window.insert(sqn, slot);
            }
            return;
        };
        buf.extend_from_slice(payload);
        let received = ReceivedPacket {
            payload: buf,
            first_msg_sqn: data.first_msg_sqn,
            fragment: data.fragment,
        };

        let slot = if self.setup.ordered {
            Slot::Received(received)
        }
        else {
            self.deliver_packet(sqn, received, now, out);
            Slot::Delivered
        };
        let _ = self.window.insert(sqn, slot);
        self.deliver(now, out);
    }

    /// Pops everything from the front of the window that needs no more waiting
    fn deliver(&mut self, now: Instant, out: &mut RxOutput) {
        while !self.window.is_empty() {
            if matches!(self.window.front(), Some(Slot::Missing(_))) {
                break;
            }
            if let Some((sqn, Some(Slot::Received(received)))) = self.window.pop_front() {
                self.deliver_packet(sqn, received, now, out);
            }
        }
    }

    fn deliver_packet(&mut self, sqn: Sqn, received: ReceivedPacket, now: Instant, out: &mut RxOutput) {
        let gsi = self.setup.gsi;
        let before = out.deliveries.len();

        match self.setup.delivery {
            DeliveryKind::Packets => {
                out.deliveries.push(RxDelivery::Packet(RxPacket {
                    gsi,
                    sqn,
                    first_msg_sqn: received.first_msg_sqn,
                    payload: Bytes::copy_from_slice(&received.payload),
                }));
            }
            DeliveryKind::Messages => match received.fragment {
                Some(fragment) => {
                    match self.reassembler.add(fragment, received.first_msg_sqn, &received.payload, now) {
                        FragmentOutcome::Incomplete => {}
                        FragmentOutcome::Complete(record, msg_sqn) => self.deliver_records(&record, msg_sqn, out),
                        FragmentOutcome::Discarded(reason) => self.report_loss(1, reason, out),
                    }
                }
                None => self.deliver_records(&received.payload, received.first_msg_sqn, out),
            },
        }

        if out.deliveries.len() > before && !self.has_delivered {
            self.has_delivered = true;
            out.events.push(self.event(EventType::FirstMessage));
        }
    }

    fn deliver_records(&mut self, payload: &[u8], first_msg_sqn: u64, out: &mut RxOutput) {
        let records = match parse_records(payload, self.setup.peer_order, self.setup.msg_properties) {
            Ok(records) => records,
            Err(e) => {
                warn!(msg_key = 4312, "{:?}: malformed message records - dropping packet: {}", self.setup.gsi, e);
                out.events.push(self.event(EventType::StreamError).with_details(e.to_string()));
                return;
            }
        };

        for (msg_sqn, record) in (first_msg_sqn..).zip(records) {
            out.deliveries.push(RxDelivery::Message(RxMessage {
                gsi: self.setup.gsi,
                msg_sqn,
                properties: record.properties,
                data: Bytes::copy_from_slice(record.message),
            }));
            self.stats.messages_delivered += 1;
        }
    }

    /// Confirmation from the transmitter that repairs are on their way
    pub fn on_ncf(&mut self, sqns: &[Sqn], now: Instant) {
        for &sqn in sqns {
            let Some(Slot::Missing(record)) = self.window.get_mut(sqn) else {
                continue;
            };
            if let Some(rtt) = record.on_ncf(now, &self.timeouts) {
                if let Some(adjusted) = self.timeouts.ncf.add_sample(rtt) {
                    info!(msg_key = 5277, "{:?}: NAK NCF timeout adjusted to {:?}", self.setup.gsi, adjusted);
                }
            }
        }
    }

    /// Runs the NAK timers of all holes. Holes due for a NAK are batched into NAK packets, at
    ///  most `budget` sequence numbers in total; the budget is reduced by what was sent. While
    ///  `in_crisis`, timers stand still and nothing is sent.
    pub fn nak_cycle(&mut self, now: Instant, in_crisis: bool, budget: &mut usize, out: &mut RxOutput) {
        if !self.is_reliable() || in_crisis || !matches!(self.state, RxState::Active | RxState::Suspended) {
            return;
        }

        let mut to_nak = Vec::new();
        let mut dead = Vec::new();
        for (sqn, slot) in self.window.iter_mut() {
            let Slot::Missing(record) = slot else {
                continue;
            };
            if record.state() == NakState::BackOff && to_nak.len() >= *budget {
                continue;
            }
            match record.on_timer(now, &self.timeouts) {
                NakAction::SendNak => to_nak.push(sqn),
                NakAction::GiveUp => dead.push(sqn),
                NakAction::None => {}
            }
        }

        if !dead.is_empty() {
            for &sqn in &dead {
                if let Some(slot) = self.window.get_mut(sqn) {
                    *slot = Slot::Lost;
                }
            }
            self.report_loss(dead.len() as u32, "NAK retries exhausted", out);
            self.deliver(now, out);
        }

        if to_nak.is_empty() {
            return;
        }
        trace!("{:?}: NAK for {:?}", self.setup.gsi, to_nak);
        *budget = budget.saturating_sub(to_nak.len());
        self.stats.naks_sent += to_nak.len() as u64;
        for chunk in to_nak.chunks(self.max_sqn_per_nack) {
            if let Some(nak) = StreamPacket::nak_or_ncf(PacketType::Nak, self.nak_source_port, self.nak_dest_port, self.setup.gsi, chunk, self.source_nla, self.setup.local_nla) {
                let mut buf = BytesMut::new();
                nak.ser(&mut buf, self.setup.local_order, &[]);
                if self.setup.checksum {
                    apply_checksum(&mut buf, self.setup.local_order);
                }
                out.packets.push(buf.freeze());
            }
        }
    }

    /// Gives up the oldest hole so buffered data behind it can be delivered and freed. Returns
    ///  `false` if there was no hole.
    pub fn shed_oldest_hole(&mut self, now: Instant, out: &mut RxOutput) -> bool {
        let oldest = self.window.iter()
            .find(|(_, slot)| matches!(slot, Slot::Missing(_)))
            .map(|(sqn, _)| sqn);
        let Some(oldest) = oldest else {
            return false;
        };

        if let Some(slot) = self.window.get_mut(oldest) {
            *slot = Slot::Lost;
        }
        self.stats.lost_packets += 1;
        warn!(msg_key = 4184, "{:?}: gave up on packet {:?} of queue {:?} to free receive memory", self.setup.gsi, oldest, self.setup.queue_name);
        out.events.push(self.event(EventType::ReceiveQueueTrimmed)
            .with_lost(1)
            .with_details("dropped in memory crisis"));
        self.deliver(now, out);
        true
    }

    /// Housekeeping: expires incomplete fragmented records and finishes a lingering close.
    ///  Returns `true` once the stream is closed.
    pub fn timer_cycle(&mut self, now: Instant, out: &mut RxOutput) -> bool {
        let expired = self.reassembler.expire(now);
        if !expired.is_empty() {
            self.report_loss(expired.len() as u32, "fragment reassembly timed out", out);
        }

        if self.state == RxState::Suspended && self.close_at.is_some_and(|t| now >= t) {
            info!(msg_key = 5313, "{:?}: transmitter of queue {:?} closed", self.setup.gsi, self.setup.queue_name);
            self.close();
            out.events.push(self.event(EventType::ClosedTransmitter));
        }
        self.state == RxState::Closed
    }

    /// Drops all buffered data
    pub fn close(&mut self) {
        if self.state == RxState::Closed {
            return;
        }
        let lost = self.window.iter()
            .filter(|(_, slot)| matches!(slot, Slot::Missing(_)))
            .count();
        if lost > 0 {
            debug!("{:?}: closing with {} holes", self.setup.gsi, lost);
        }
        self.window.reset(self.lead);
        self.reassembler.clear();
        self.state = RxState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::message_record::ser_record;
    use rstest::rstest;
    use std::net::Ipv4Addr;
    use tokio::runtime::Builder;

    fn sqn(raw: u32) -> Sqn {
        Sqn::from_raw(raw)
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn setup(modify: impl FnOnce(&mut RxStreamSetup)) -> RxStreamSetup {
        let mut result = RxStreamSetup {
            gsi: Gsi::new(7, 1),
            queue_name: "q".to_string(),
            connection_id: ConnectionId(1),
            queue_reliability: Reliability::Reliable,
            ordered: true,
            delivery: DeliveryKind::Messages,
            msg_properties: false,
            join_backtrack: 0,
            peer_order: ByteOrder::Little,
            local_order: ByteOrder::Little,
            local_nla: IpAddr::V4(Ipv4Addr::LOCALHOST),
            max_gap: 1000,
            checksum: false,
        };
        modify(&mut result);
        result
    }

    fn config() -> AdvancedConfig {
        AdvancedConfig {
            nack_timeout_bof: Duration::ZERO,
            nack_timeout_ncf: ms(200),
            nack_timeout_data: ms(500),
            nack_retries_ncf: 3,
            nack_retries_data: 3,
            ..AdvancedConfig::default()
        }
    }

    fn spm(spm_sqn: u32, trail: u32, lead: u32) -> SpmInfo {
        SpmInfo {
            spm_sqn: sqn(spm_sqn),
            trail: sqn(trail),
            lead: sqn(lead),
            nla: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            source_port: 35353,
            dest_port: 40000,
            control: None,
            late_join_mark: None,
            queue_name: Some("q".to_string()),
            msg_properties: false,
        }
    }

    fn data(raw: u32, trail: u32) -> DataInfo {
        DataInfo {
            sqn: sqn(raw),
            trail: sqn(trail),
            is_repair: false,
            first_msg_sqn: raw as u64,
            fragment: None,
        }
    }

    fn payload(message: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        ser_record(&mut buf, ByteOrder::Little, None, message);
        buf
    }

    fn pool() -> Arc<BufferPool> {
        BufferPool::new("test", 1500, 100, 100)
    }

    fn delivered(out: &mut RxOutput) -> Vec<u64> {
        out.deliveries.drain(..)
            .map(|d| match d {
                RxDelivery::Message(m) => m.msg_sqn,
                RxDelivery::Packet(p) => p.sqn.to_raw() as u64,
            })
            .collect()
    }

    fn nak_sqns(out: &mut RxOutput) -> Vec<Vec<u32>> {
        out.packets.drain(..)
            .map(|p| {
                let (packet, _) = StreamPacket::deser(&p, ByteOrder::Little).unwrap();
                assert_eq!(packet.header.packet_type, PacketType::Nak);
                packet.nak_sqns().into_iter().map(|s| s.to_raw()).collect()
            })
            .collect()
    }

    fn event_types(out: &mut RxOutput) -> Vec<(EventType, u32)> {
        out.events.drain(..)
            .map(|e| (e.event_type, e.lost))
            .collect()
    }

    #[test]
    fn test_gap_recovery() {
        let now = Instant::now();
        let pool = pool();
        let mut out = RxOutput::default();
        let mut stream = RxStream::new(setup(|_| {}), &spm(0, 1, 1), &config(), now, &mut out);
        assert_eq!(stream.state(), RxState::Active);

        for i in (1..=10).filter(|&i| i != 3) {
            stream.on_data(&data(i, 1), &payload(&[i as u8]), &pool, now, &mut out);
        }
        assert_eq!(delivered(&mut out), vec![1, 2]);
        assert_eq!(stream.num_missing(), 1);
        assert_eq!(event_types(&mut out), vec![(EventType::FirstMessage, 0)]);

        let mut budget = 100;
        stream.nak_cycle(now, false, &mut budget, &mut out);
        assert_eq!(nak_sqns(&mut out), vec![vec![3]]);
        assert_eq!(budget, 99);

        stream.nak_cycle(now + ms(32), false, &mut budget, &mut out);
        assert!(out.packets.is_empty());

        let repair = DataInfo { is_repair: true, ..data(3, 1) };
        stream.on_data(&repair, &payload(&[3]), &pool, now + ms(40), &mut out);
        assert_eq!(delivered(&mut out), (3..=10).collect::<Vec<_>>());
        assert_eq!(stream.next_to_deliver(), sqn(11));
        assert_eq!(pool.in_use(), 0);

        let stats = stream.stats();
        assert_eq!(stats.messages_delivered, 10);
        assert_eq!(stats.naks_sent, 1);
        assert_eq!(stats.lost_packets, 0);
    }

    #[test]
    fn test_gap_recovery_latency() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let config = AdvancedConfig {
                nack_timeout_bof: ms(50),
                nack_timeout_ncf: ms(200),
                ..config()
            };
            let pool = pool();
            let mut out = RxOutput::default();
            let gap_detected = Instant::now();
            let mut stream = RxStream::new(setup(|_| {}), &spm(0, 1, 1), &config, gap_detected, &mut out);
            for i in (1..=10).filter(|&i| i != 3) {
                stream.on_data(&data(i, 1), &payload(&[i as u8]), &pool, gap_detected, &mut out);
            }
            assert_eq!(delivered(&mut out), vec![1, 2]);

            let mut nak_sent = None;
            for _ in 0..=10 {
                let mut budget = 100;
                stream.nak_cycle(Instant::now(), false, &mut budget, &mut out);
                if !out.packets.is_empty() {
                    nak_sent = Some(Instant::now());
                    break;
                }
                tokio::time::advance(ms(5)).await;
            }
            let nak_sent = nak_sent.expect("no NAK within the back-off interval");
            assert!(nak_sent <= gap_detected + ms(50));
            assert_eq!(nak_sqns(&mut out), vec![vec![3]]);

            // waiting for the NCF: no second NAK
            for _ in 0..4 {
                tokio::time::advance(ms(25)).await;
                let mut budget = 100;
                stream.nak_cycle(Instant::now(), false, &mut budget, &mut out);
                assert!(out.packets.is_empty());
            }

            let repaired = Instant::now();
            assert!(repaired < gap_detected + ms(50) + ms(200));
            let repair = DataInfo { is_repair: true, ..data(3, 1) };
            stream.on_data(&repair, &payload(&[3]), &pool, repaired, &mut out);
            assert_eq!(delivered(&mut out), (3..=10).collect::<Vec<_>>());
            assert_eq!(stream.num_missing(), 0);
            assert_eq!(stream.stats().naks_sent, 1);
        });
    }

    #[test]
    fn test_loss_after_ncf_retries() {
        let now = Instant::now();
        let pool = pool();
        let mut out = RxOutput::default();
        let mut stream = RxStream::new(setup(|_| {}), &spm(0, 4, 4), &config(), now, &mut out);
        stream.on_data(&data(4, 4), &payload(b"4"), &pool, now, &mut out);
        stream.on_data(&data(6, 4), &payload(b"6"), &pool, now, &mut out);
        assert_eq!(delivered(&mut out), vec![4]);
        out.events.clear();

        let mut naks = 0;
        let mut t = now;
        while stream.next_to_deliver() != sqn(7) {
            let mut budget = 100;
            stream.nak_cycle(t, false, &mut budget, &mut out);
            naks += nak_sqns(&mut out).len();
            t += ms(32);
            assert!(t < now + ms(60_000));
        }
        assert_eq!(naks, 3);
        assert_eq!(event_types(&mut out), vec![(EventType::MessageLoss, 1)]);
        assert_eq!(delivered(&mut out), vec![6]);
        assert_eq!(stream.stats().lost_packets, 1);
    }

    #[test]
    fn test_duplicates() {
        let now = Instant::now();
        let pool = pool();
        let mut out = RxOutput::default();
        let mut stream = RxStream::new(setup(|_| {}), &spm(0, 0, 0), &config(), now, &mut out);

        stream.on_data(&data(0, 0), &payload(b"a"), &pool, now, &mut out);
        stream.on_data(&data(2, 0), &payload(b"c"), &pool, now, &mut out);
        stream.on_data(&data(0, 0), &payload(b"a"), &pool, now, &mut out);
        stream.on_data(&data(2, 0), &payload(b"c"), &pool, now, &mut out);
        assert_eq!(delivered(&mut out), vec![0]);
        assert_eq!(stream.rxw_lead(), sqn(3));

        stream.on_data(&data(1, 0), &payload(b"b"), &pool, now, &mut out);
        stream.on_data(&data(1, 0), &payload(b"b"), &pool, now, &mut out);
        assert_eq!(delivered(&mut out), vec![1, 2]);
        assert_eq!(stream.stats().duplicates, 3);
        assert_eq!(stream.rxw_lead(), sqn(3));
    }

    #[test]
    fn test_unreliable_skips_gaps() {
        let now = Instant::now();
        let pool = pool();
        let mut out = RxOutput::default();
        let mut stream = RxStream::new(setup(|s| s.queue_reliability = Reliability::Unreliable), &spm(0, 0, 0), &config(), now, &mut out);

        stream.on_data(&data(0, 0), &payload(b"a"), &pool, now, &mut out);
        stream.on_data(&data(3, 3), &payload(b"d"), &pool, now, &mut out);
        assert_eq!(delivered(&mut out), vec![0, 3]);
        assert_eq!(event_types(&mut out), vec![(EventType::Reliability, 0), (EventType::FirstMessage, 0), (EventType::PacketLoss, 2)]);

        let mut budget = 100;
        stream.nak_cycle(now + ms(1000), false, &mut budget, &mut out);
        assert!(out.packets.is_empty());
    }

    #[test]
    fn test_trail_advance_gives_up_holes() {
        let now = Instant::now();
        let pool = pool();
        let mut out = RxOutput::default();
        let mut stream = RxStream::new(setup(|_| {}), &spm(0, 0, 0), &config(), now, &mut out);

        stream.on_data(&data(0, 0), &payload(b"a"), &pool, now, &mut out);
        stream.on_data(&data(3, 0), &payload(b"d"), &pool, now, &mut out);
        assert_eq!(delivered(&mut out), vec![0]);
        out.events.clear();

        stream.on_data(&data(4, 3), &payload(b"e"), &pool, now, &mut out);
        assert_eq!(delivered(&mut out), vec![3, 4]);
        assert_eq!(event_types(&mut out), vec![(EventType::MessageLoss, 2)]);
        assert_eq!(stream.rxw_trail(), sqn(3));
    }

    #[test]
    fn test_spm_lead_creates_tail_naks() {
        let now = Instant::now();
        let mut out = RxOutput::default();
        let mut stream = RxStream::new(setup(|_| {}), &spm(0, 0, 0), &config(), now, &mut out);

        stream.on_spm(&spm(1, 0, 3), now, &mut out);
        assert_eq!(stream.num_missing(), 3);

        stream.on_spm(&spm(1, 0, 10), now, &mut out);
        assert_eq!(stream.num_missing(), 3, "stale SPM must be ignored");

        let mut budget = 100;
        stream.nak_cycle(now, false, &mut budget, &mut out);
        assert_eq!(nak_sqns(&mut out), vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_nak_batching() {
        let now = Instant::now();
        let mut config = config();
        config.max_sqn_per_nack = 2;
        let mut out = RxOutput::default();
        let mut stream = RxStream::new(setup(|_| {}), &spm(0, 0, 0), &config, now, &mut out);
        stream.on_spm(&spm(1, 0, 7), now, &mut out);

        let mut budget = 5;
        stream.nak_cycle(now, false, &mut budget, &mut out);
        assert_eq!(nak_sqns(&mut out), vec![vec![0, 1], vec![2, 3], vec![4]]);
        assert_eq!(budget, 0);

        let mut budget = 5;
        stream.nak_cycle(now + ms(1), false, &mut budget, &mut out);
        assert_eq!(nak_sqns(&mut out), vec![vec![5, 6]]);
    }

    #[test]
    fn test_ncf_defers_renak() {
        let now = Instant::now();
        let mut out = RxOutput::default();
        let mut stream = RxStream::new(setup(|_| {}), &spm(0, 0, 0), &config(), now, &mut out);
        stream.on_spm(&spm(1, 0, 1), now, &mut out);

        let mut budget = 100;
        stream.nak_cycle(now, false, &mut budget, &mut out);
        assert_eq!(nak_sqns(&mut out).len(), 1);
        stream.on_ncf(&[sqn(0)], now + ms(10));

        for t in [300, 400, 509] {
            stream.nak_cycle(now + ms(t), false, &mut budget, &mut out);
            assert!(out.packets.is_empty(), "at {}", t);
        }
        stream.nak_cycle(now + ms(510), false, &mut budget, &mut out);
        stream.nak_cycle(now + ms(511), false, &mut budget, &mut out);
        assert_eq!(nak_sqns(&mut out), vec![vec![0]]);
    }

    #[test]
    fn test_no_naks_in_crisis() {
        let now = Instant::now();
        let mut out = RxOutput::default();
        let mut stream = RxStream::new(setup(|_| {}), &spm(0, 0, 0), &config(), now, &mut out);
        stream.on_spm(&spm(1, 0, 2), now, &mut out);

        let mut budget = 100;
        stream.nak_cycle(now, true, &mut budget, &mut out);
        assert!(out.packets.is_empty());
        assert_eq!(budget, 100);

        assert!(stream.shed_oldest_hole(now, &mut out));
        assert_eq!(stream.num_missing(), 1);
        assert_eq!(event_types(&mut out), vec![(EventType::ReceiveQueueTrimmed, 1)]);
        assert_eq!(stream.stats().lost_packets, 1);
    }

    #[rstest]
    #[case::within_history(Some(60), 30, 70, false)]
    #[case::clipped_to_mark(Some(60), 45, 60, false)]
    #[case::history_trimmed(Some(40), 80, 50, true)]
    #[case::no_late_join_offered(None, 30, 100, false)]
    #[case::no_backtrack(Some(60), 0, 100, false)]
    fn test_late_join(#[case] mark: Option<u32>, #[case] backtrack: u32, #[case] expected_start: u32, #[case] expected_failure: bool) {
        let now = Instant::now();
        let mut out = RxOutput::default();
        let mut announced = spm(0, 50, 100);
        announced.late_join_mark = mark.map(sqn);

        let stream = RxStream::new(setup(|s| s.join_backtrack = backtrack), &announced, &config(), now, &mut out);
        assert_eq!(stream.next_to_deliver(), sqn(expected_start));
        assert_eq!(stream.rxw_lead(), sqn(100));
        assert_eq!(stream.num_missing(), (100 - expected_start) as usize);
        let failures = out.events.iter()
            .filter(|e| e.event_type == EventType::LateJoinFailure)
            .count();
        assert_eq!(failures, expected_failure as usize);
    }

    #[test]
    fn test_unordered_delivery() {
        let now = Instant::now();
        let pool = pool();
        let mut out = RxOutput::default();
        let mut stream = RxStream::new(setup(|s| s.ordered = false), &spm(0, 0, 0), &config(), now, &mut out);

        stream.on_data(&data(2, 0), &payload(b"c"), &pool, now, &mut out);
        stream.on_data(&data(0, 0), &payload(b"a"), &pool, now, &mut out);
        assert_eq!(delivered(&mut out), vec![2, 0]);
        assert_eq!(stream.next_to_deliver(), sqn(1));
        assert_eq!(pool.in_use(), 0);

        stream.on_data(&data(2, 0), &payload(b"c"), &pool, now, &mut out);
        assert!(delivered(&mut out).is_empty());
        stream.on_data(&data(1, 0), &payload(b"b"), &pool, now, &mut out);
        assert_eq!(delivered(&mut out), vec![1]);
        assert_eq!(stream.next_to_deliver(), sqn(3));
    }

    #[test]
    fn test_packet_delivery() {
        let now = Instant::now();
        let pool = pool();
        let mut out = RxOutput::default();
        let mut stream = RxStream::new(setup(|s| s.delivery = DeliveryKind::Packets), &spm(0, 0, 0), &config(), now, &mut out);

        stream.on_data(&data(0, 0), b"raw bytes", &pool, now, &mut out);
        assert_eq!(out.deliveries, vec![RxDelivery::Packet(RxPacket {
            gsi: Gsi::new(7, 1),
            sqn: sqn(0),
            first_msg_sqn: 0,
            payload: Bytes::from_static(b"raw bytes"),
        })]);
    }

    #[test]
    fn test_fragmented_message() {
        let now = Instant::now();
        let pool = pool();
        let mut out = RxOutput::default();
        let mut stream = RxStream::new(setup(|_| {}), &spm(0, 0, 0), &config(), now, &mut out);

        let message = (0..100u8).collect::<Vec<_>>();
        let record = payload(&message);
        for (i, chunk) in record.chunks(40).enumerate() {
            let fragment = FragmentInfo { first_sqn: sqn(0), offset: (i * 40) as u32, total_len: record.len() as u32 };
            let info = DataInfo { fragment: Some(fragment), first_msg_sqn: 9, ..data(i as u32, 0) };
            stream.on_data(&info, chunk, &pool, now, &mut out);
        }

        assert_eq!(out.deliveries, vec![RxDelivery::Message(RxMessage {
            gsi: Gsi::new(7, 1),
            msg_sqn: 9,
            properties: vec![],
            data: Bytes::from(message),
        })]);
    }

    #[test]
    fn test_fragment_timeout() {
        let now = Instant::now();
        let pool = pool();
        let mut config = config();
        config.fragment_timeout = ms(100);
        let mut out = RxOutput::default();
        let mut stream = RxStream::new(setup(|_| {}), &spm(0, 0, 0), &config, now, &mut out);

        let fragment = FragmentInfo { first_sqn: sqn(0), offset: 0, total_len: 100 };
        stream.on_data(&DataInfo { fragment: Some(fragment), ..data(0, 0) }, &[0; 40], &pool, now, &mut out);
        assert!(!stream.timer_cycle(now + ms(99), &mut out));
        assert!(out.events.is_empty());

        stream.timer_cycle(now + ms(100), &mut out);
        assert_eq!(event_types(&mut out), vec![(EventType::MessageLoss, 1)]);
    }

    #[test]
    fn test_close_announcement() {
        let now = Instant::now();
        let mut out = RxOutput::default();
        let mut stream = RxStream::new(setup(|_| {}), &spm(0, 0, 0), &config(), now, &mut out);

        let mut closing = spm(1, 0, 0);
        closing.control = Some(StreamControl {
            reliability: Reliability::Reliable,
            is_active: false,
            keep_history: true,
            close_linger_millis: 100,
        });
        stream.on_spm(&closing, now, &mut out);
        assert_eq!(stream.state(), RxState::Suspended);

        assert!(!stream.timer_cycle(now + ms(99), &mut out));
        assert!(stream.timer_cycle(now + ms(100), &mut out));
        assert_eq!(event_types(&mut out), vec![(EventType::ClosedTransmitter, 0)]);
    }

    #[test]
    fn test_reliability_change() {
        let now = Instant::now();
        let mut out = RxOutput::default();
        let mut stream = RxStream::new(setup(|_| {}), &spm(0, 0, 0), &config(), now, &mut out);
        stream.on_spm(&spm(1, 0, 2), now, &mut out);

        let mut changed = spm(2, 0, 2);
        changed.control = Some(StreamControl {
            reliability: Reliability::Unreliable,
            is_active: true,
            keep_history: false,
            close_linger_millis: 0,
        });
        stream.on_spm(&changed, now, &mut out);
        assert!(!stream.is_reliable());
        assert_eq!(stream.num_missing(), 0);
        assert_eq!(event_types(&mut out), vec![(EventType::ReliabilityChanged, 0), (EventType::PacketLoss, 2)]);
    }

    #[test]
    fn test_pool_exhausted_keeps_hole() {
        let now = Instant::now();
        let pool = BufferPool::new("test", 1500, 1, 1);
        let mut out = RxOutput::default();
        let mut stream = RxStream::new(setup(|_| {}), &spm(0, 0, 0), &config(), now, &mut out);

        stream.on_data(&data(1, 0), &payload(b"b"), &pool, now, &mut out);
        stream.on_data(&data(2, 0), &payload(b"c"), &pool, now, &mut out);
        assert_eq!(stream.num_missing(), 2);
        assert_eq!(stream.rxw_lead(), sqn(3));
    }
}
