use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NakState {
    /// waiting for the randomized back-off to expire before sending a NAK
    BackOff,
    /// NAK sent, waiting for the transmitter's NCF
    WaitNcf,
    /// NCF received, waiting for the repair data
    WaitData,
}

/// What the NAK generator should do with a record after a timer check
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NakAction {
    None,
    SendNak,
    /// retries are exhausted, the sequence number is lost
    GiveUp,
}

/// Repair state for one missing sequence number
#[derive(Debug, Clone)]
pub struct NakRecord {
    state: NakState,
    deadline: Instant,
    /// when the current NAK went out, for round trip samples
    nak_sent: Option<Instant>,
    ncf_retries: u32,
    data_retries: u32,
}

impl NakRecord {
    pub fn new(now: Instant, back_off: Duration) -> NakRecord {
        let jitter = if back_off.is_zero() {
            Duration::ZERO
        }
        else {
            rand::thread_rng().gen_range(Duration::ZERO..=back_off)
        };
        NakRecord {
            state: NakState::BackOff,
            deadline: now + jitter,
            nak_sent: None,
            ncf_retries: 0,
            data_retries: 0,
        }
    }

    pub fn state(&self) -> NakState {
        self.state
    }

    /// Advances the record's timers. `SendNak` moves the record to [NakState::WaitNcf], the
    ///  caller is expected to actually send the NAK in this cycle.
    pub fn on_timer(&mut self, now: Instant, timeouts: &NakTimeouts) -> NakAction {
        if now < self.deadline {
            return NakAction::None;
        }
        match self.state {
            NakState::BackOff => {
                self.state = NakState::WaitNcf;
                self.deadline = now + timeouts.ncf.current();
                self.nak_sent = Some(now);
                NakAction::SendNak
            }
            NakState::WaitNcf => {
                self.ncf_retries += 1;
                if self.ncf_retries >= timeouts.ncf_retries {
                    return NakAction::GiveUp;
                }
                self.retry(now)
            }
            NakState::WaitData => {
                self.data_retries += 1;
                if self.data_retries >= timeouts.data_retries {
                    return NakAction::GiveUp;
                }
                self.retry(now)
            }
        }
    }

    /// back to back-off with an expired timer, so the next cycle sends the NAK again
    fn retry(&mut self, now: Instant) -> NakAction {
        self.state = NakState::BackOff;
        self.deadline = now;
        NakAction::None
    }

    /// Returns the NAK-to-NCF round trip if this is the first confirmation of the record
    pub fn on_ncf(&mut self, now: Instant, timeouts: &NakTimeouts) -> Option<Duration> {
        if self.state == NakState::WaitData {
            return None;
        }
        self.state = NakState::WaitData;
        self.deadline = now + timeouts.data.current();
        self.first_sample(now)
    }

    /// the NAK-to-data round trip if the repair came in answer to the first NAK
    pub fn on_repaired(&mut self, now: Instant) -> Option<Duration> {
        self.first_sample(now)
    }

    fn first_sample(&self, now: Instant) -> Option<Duration> {
        if self.ncf_retries + self.data_retries > 0 {
            return None;
        }
        self.nak_sent.map(|sent| now.saturating_duration_since(sent))
    }
}

/// A NAK timeout that adapts to observed round trips: every 500 samples it moves towards
///  three times the average, bounded by a quarter and four times the configured value.
#[derive(Debug, Clone)]
pub struct AdaptiveTimeout {
    configured: Duration,
    current: Duration,
    sum: Duration,
    count: u32,
}

impl AdaptiveTimeout {
    const SAMPLES_PER_ADJUSTMENT: u32 = 500;

    pub fn new(configured: Duration) -> AdaptiveTimeout {
        AdaptiveTimeout {
            configured,
            current: configured,
            sum: Duration::ZERO,
            count: 0,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the new timeout if the sample triggered an adjustment
    pub fn add_sample(&mut self, sample: Duration) -> Option<Duration> {
        self.sum += sample;
        self.count += 1;
        if self.count <= Self::SAMPLES_PER_ADJUSTMENT {
            return None;
        }

        let target = self.sum / self.count * 3;
        let blended = (target * 15 + self.current * 85) / 100;
        self.current = blended.clamp(self.configured / 4, self.configured * 4);
        self.sum = Duration::ZERO;
        self.count = 0;
        Some(self.current)
    }
}

/// The NAK timing parameters of a receive stream
#[derive(Debug, Clone)]
pub struct NakTimeouts {
    pub back_off: Duration,
    pub ncf: AdaptiveTimeout,
    pub data: AdaptiveTimeout,
    pub ncf_retries: u32,
    pub data_retries: u32,
}
