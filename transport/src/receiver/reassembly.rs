use crate::codec::options::FragmentInfo;
use crate::safe_converter::SafeCast;
use crate::seq::Sqn;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FragmentOutcome {
    Incomplete,
    /// the reassembled message record, and the message sequence number of its first fragment
    Complete(Bytes, u64),
    /// the fragmented record can never be delivered, the reason is for logging
    Discarded(&'static str),
}

#[derive(Debug)]
struct PartialRecord {
    buf: BytesMut,
    received: usize,
    msg_sqn: u64,
    started: Instant,
}

/// Collects the fragments of message records that were too big for a single packet. Fragments
///  are placed by their byte offset, so they can arrive in any order.
#[derive(Debug)]
pub struct Reassembler {
    max_bytes: usize,
    timeout: Duration,
    partial: FxHashMap<Sqn, PartialRecord>,
}

impl Reassembler {
    pub fn new(max_bytes: usize, timeout: Duration) -> Reassembler {
        Reassembler {
            max_bytes,
            timeout,
            partial: Default::default(),
        }
    }

    pub fn num_partial(&self) -> usize {
        self.partial.len()
    }

    /// bytes held for records that are not complete yet
    pub fn held_bytes(&self) -> usize {
        self.partial.values()
            .map(|p| p.buf.len())
            .sum()
    }

    pub fn add(&mut self, info: FragmentInfo, msg_sqn: u64, chunk: &[u8], now: Instant) -> FragmentOutcome {
        let total_len: usize = info.total_len.safe_cast();
        let offset: usize = info.offset.safe_cast();

        if total_len > self.max_bytes {
            debug!("fragmented record {:?} has {} bytes, limit is {} - discarding", info.first_sqn, total_len, self.max_bytes);
            self.partial.remove(&info.first_sqn);
            return FragmentOutcome::Discarded("record exceeds the fragment size limit");
        }
        if offset + chunk.len() > total_len {
            debug!("fragment of {:?} at offset {} with {} bytes exceeds the record length {}", info.first_sqn, offset, chunk.len(), total_len);
            self.partial.remove(&info.first_sqn);
            return FragmentOutcome::Discarded("fragment exceeds the record length");
        }

        let partial = self.partial.entry(info.first_sqn)
            .or_insert_with(|| {
                trace!("starting reassembly of {:?} with {} bytes", info.first_sqn, total_len);
                PartialRecord {
                    buf: BytesMut::zeroed(total_len),
                    received: 0,
                    msg_sqn,
                    started: now,
                }
            });
        if partial.buf.len() != total_len {
            self.partial.remove(&info.first_sqn);
            return FragmentOutcome::Discarded("fragments disagree on the record length");
        }

        partial.buf[offset..offset + chunk.len()].copy_from_slice(chunk);
        partial.received += chunk.len();
        partial.msg_sqn = partial.msg_sqn.min(msg_sqn);

        if partial.received < total_len {
            return FragmentOutcome::Incomplete;
        }
        match self.partial.remove(&info.first_sqn) {
            Some(done) => FragmentOutcome::Complete(done.buf.freeze(), done.msg_sqn),
            None => FragmentOutcome::Incomplete,
        }
    }

    /// Drops records whose first fragment arrived more than the timeout ago, returning the
    ///  first sequence numbers of the dropped records
    pub fn expire(&mut self, now: Instant) -> Vec<Sqn> {
        let timeout = self.timeout;
        let expired = self.partial.iter()
            .filter(|(_, p)| now.saturating_duration_since(p.started) >= timeout)
            .map(|(&sqn, _)| sqn)
            .collect::<Vec<_>>();
        for sqn in &expired {
            debug!("reassembly of {:?} timed out", sqn);
            self.partial.remove(sqn);
        }
        expired
    }

    pub fn clear(&mut self) {
        self.partial.clear();
    }
}
