use anyhow::bail;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

/// Verbosity of an instance's per-packet diagnostics. This gates the instance's own verbose
///  logging on top of whatever the process-wide `tracing` subscriber lets through.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum LogLevel {
    None,
    Status,
    Fatal,
    Error,
    Warn,
    Info,
    Verbose,
    Trace,
    Xtrace,
}

/// An instance's current log level, shared by its engines and changeable at runtime
#[derive(Debug)]
pub struct LogLevelCell(AtomicU8);

impl LogLevelCell {
    pub fn new(level: LogLevel) -> LogLevelCell {
        LogLevelCell(AtomicU8::new(level.into()))
    }

    pub fn get(&self) -> LogLevel {
        LogLevel::try_from(self.0.load(Ordering::Relaxed))
            .unwrap_or(LogLevel::Info)
    }

    pub fn set(&self, level: LogLevel) {
        self.0.store(level.into(), Ordering::Relaxed);
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level <= self.get()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RateLimit {
    Disabled,
    /// the configured rate is a fixed ceiling
    Static,
    /// the rate backs off under NAK pressure and recovers towards the configured ceiling
    Dynamic,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Direction {
    TxRx,
    TxOnly,
    RxOnly,
}

impl Direction {
    pub fn can_transmit(self) -> bool {
        self != Direction::RxOnly
    }

    pub fn can_receive(self) -> bool {
        self != Direction::TxOnly
    }
}

/// Basic configuration of an instance
#[derive(Debug, Clone)]
pub struct RumConfig {
    /// optional name, used in log output
    pub instance_name: Option<String>,

    /// Address to listen on for inbound connections. The address family of this address is
    ///  the instance's address family.
    pub listen_addr: IpAddr,
    /// 0 means an ephemeral port
    pub server_port: u16,
    /// local address for outbound connections, unspecified if `None`
    pub tx_interface: Option<IpAddr>,

    pub log_level: LogLevel,

    pub rate_limit: RateLimit,
    pub trans_rate_limit_kbps: u32,

    /// maximum size of a stream packet including all headers
    pub packet_size: usize,

    pub direction: Direction,

    /// memory budget for packet buffers, shared evenly between transmitter and receiver
    pub max_memory_bytes: usize,
    /// transmit history that is retained regardless of memory pressure
    pub min_history_bytes: usize,

    pub socket_receive_buffer_bytes: u32,
    pub socket_send_buffer_bytes: u32,

    pub advanced: AdvancedConfig,
}

impl RumConfig {
    pub const DEFAULT_SERVER_PORT: u16 = 35353;
    pub const MIN_RATE_LIMIT_KBPS: u32 = 8;
    pub const MIN_PACKET_SIZE: usize = 300;
    pub const MAX_PACKET_SIZE: usize = 65000;

    pub fn default_ipv4() -> RumConfig {
        RumConfig {
            instance_name: None,
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            server_port: Self::DEFAULT_SERVER_PORT,
            tx_interface: None,
            log_level: LogLevel::Info,
            rate_limit: RateLimit::Disabled,
            trans_rate_limit_kbps: 100_000,
            packet_size: 8000,
            direction: Direction::TxRx,
            max_memory_bytes: 200 * 1024 * 1024,
            min_history_bytes: 0,
            socket_receive_buffer_bytes: 1024 * 1024,
            socket_send_buffer_bytes: 64 * 1024,
            advanced: AdvancedConfig::default(),
        }
    }

    pub fn default_ipv6() -> RumConfig {
        RumConfig {
            listen_addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            ..Self::default_ipv4()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(Self::MIN_PACKET_SIZE..=Self::MAX_PACKET_SIZE).contains(&self.packet_size) {
            bail!("packet size {} is outside the range {}..={}", self.packet_size, Self::MIN_PACKET_SIZE, Self::MAX_PACKET_SIZE);
        }
        if self.rate_limit != RateLimit::Disabled && self.trans_rate_limit_kbps < Self::MIN_RATE_LIMIT_KBPS {
            bail!("rate limit of {} kbps is below the minimum of {} kbps", self.trans_rate_limit_kbps, Self::MIN_RATE_LIMIT_KBPS);
        }
        if self.max_memory_bytes < 16 * self.packet_size {
            bail!("memory budget of {} bytes is too small for packets of {} bytes", self.max_memory_bytes, self.packet_size);
        }
        if self.min_history_bytes > self.max_memory_bytes / 2 {
            bail!("minimal history of {} bytes exceeds the transmitter's half of the memory budget", self.min_history_bytes);
        }
        if let (Some(tx), listen) = (self.tx_interface, self.listen_addr) {
            if tx.is_ipv4() != listen.is_ipv4() {
                bail!("transmit interface {} and listen address {} have different address families", tx, listen);
            }
        }

        self.advanced.validate()
    }

    /// number of packet buffers available to each of transmitter and receiver
    pub fn buffers_per_engine(&self) -> usize {
        (self.max_memory_bytes / 2 / self.packet_size).max(1)
    }

    pub fn min_history_packets(&self) -> usize {
        self.min_history_bytes / self.packet_size
    }

    /// ceiling for packets waiting to be sent, across all streams of the transmitter
    pub fn max_pending_packets(&self) -> usize {
        let bytes = self.advanced.max_pending_queue_bytes
            .unwrap_or(self.max_memory_bytes / 4);
        (bytes / self.packet_size).max(1)
    }

    pub fn display_name(&self) -> String {
        self.instance_name.clone()
            .unwrap_or_else(|| "rum".to_string())
    }
}

/// Tuning parameters. The defaults work for most deployments.
#[derive(Debug, Clone)]
pub struct AdvancedConfig {
    pub max_streams_per_transmitter: usize,

    pub packets_per_round: usize,
    pub packets_per_round_when_cleaning: usize,
    /// share of a send round's packet budget that may go to repair data
    pub rdata_send_percent: u32,

    /// a partially filled packet is sent after this delay
    pub min_batching: Duration,
    /// upper bound for the batching delay under load
    pub max_batching: Duration,

    /// history utilization above which the transmitter trims its history
    pub cleaning_mark_percent: u32,
    /// trimming starts only when this many packets can be released
    pub min_trim_size: usize,

    /// default for connections that do not request one, `None` to disable heartbeat timeouts
    pub heartbeat_timeout: Option<Duration>,

    pub inter_heartbeat_ambient: Duration,
    pub inter_heartbeat_min: Duration,
    pub inter_heartbeat_max: Duration,

    /// receiver memory alert thresholds, disabled if `memory_alert_pct_hi` is 0
    pub memory_alert_pct_hi: u32,
    pub memory_alert_pct_lo: u32,

    pub nack_gener_cycle: Duration,
    pub task_timer_cycle: Duration,
    pub nack_timeout_bof: Duration,
    pub nack_timeout_ncf: Duration,
    pub nack_timeout_data: Duration,
    pub nack_retries_ncf: u32,
    pub nack_retries_data: u32,
    pub max_nacks_per_cycle: usize,
    pub max_sqn_per_nack: usize,

    /// `None` derives the pending queue ceiling from the memory budget
    pub max_pending_queue_bytes: Option<usize>,
    /// submissions wait for room in the pending queue instead of failing with a memory alert
    pub submit_blocking: bool,

    pub receiver_connection_establish_timeout: Duration,
    pub fragment_timeout: Duration,
    pub max_fragment_bytes: usize,

    pub checksum_enabled: bool,

    /// bound for each engine to quiesce during `stop`
    pub stop_timeout: Duration,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        AdvancedConfig {
            max_streams_per_transmitter: 1024,
            packets_per_round: 10,
            packets_per_round_when_cleaning: 5,
            rdata_send_percent: 90,
            min_batching: Duration::from_micros(100),
            max_batching: Duration::from_micros(1000),
            cleaning_mark_percent: 80,
            min_trim_size: 0,
            heartbeat_timeout: None,
            inter_heartbeat_ambient: Duration::from_millis(5000),
            inter_heartbeat_min: Duration::from_millis(500),
            inter_heartbeat_max: Duration::from_millis(5000),
            memory_alert_pct_hi: 0,
            memory_alert_pct_lo: 0,
            nack_gener_cycle: Duration::from_millis(32),
            task_timer_cycle: Duration::from_millis(2),
            nack_timeout_bof: Duration::ZERO,
            nack_timeout_ncf: Duration::from_millis(200),
            nack_timeout_data: Duration::from_millis(500),
            nack_retries_ncf: 256,
            nack_retries_data: 512,
            max_nacks_per_cycle: 512,
            max_sqn_per_nack: 63,
            max_pending_queue_bytes: None,
            submit_blocking: true,
            receiver_connection_establish_timeout: Duration::from_millis(10_000),
            fragment_timeout: Duration::from_millis(10_000),
            max_fragment_bytes: 16 * 1024 * 1024,
            checksum_enabled: false,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl AdvancedConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_streams_per_transmitter == 0 {
            bail!("MaxStreamsPerTransmitter must be positive");
        }
        if self.max_streams_per_transmitter > u16::MAX as usize + 1 {
            bail!("MaxStreamsPerTransmitter {} exceeds the stream id space", self.max_streams_per_transmitter);
        }
        if self.packets_per_round == 0 || self.packets_per_round_when_cleaning == 0 {
            bail!("packets per round must be positive");
        }
        if self.rdata_send_percent > 100 {
            bail!("RdataSendPercent {} is not a percentage", self.rdata_send_percent);
        }
        if self.cleaning_mark_percent == 0 || self.cleaning_mark_percent > 100 {
            bail!("CleaningMarkPercent {} must be in 1..=100", self.cleaning_mark_percent);
        }
        if self.min_batching > self.max_batching {
            bail!("MinBatchingMicro must not exceed MaxBatchingMicro");
        }
        if self.inter_heartbeat_min.is_zero() || self.inter_heartbeat_min > self.inter_heartbeat_max {
            bail!("InterHeartbeatMinMilli must be positive and not exceed InterHeartbeatMaxMilli");
        }
        if self.inter_heartbeat_ambient.is_zero() {
            bail!("InterHeartbeatAmbientMilli must be positive");
        }
        if self.memory_alert_pct_hi > 100 {
            bail!("MemoryAlertPctHi {} is not a percentage", self.memory_alert_pct_hi);
        }
        if self.memory_alert_pct_hi > 0 && self.memory_alert_pct_lo >= self.memory_alert_pct_hi {
            bail!("MemoryAlertPctLo {} must be below MemoryAlertPctHi {}", self.memory_alert_pct_lo, self.memory_alert_pct_hi);
        }
        if self.nack_gener_cycle.is_zero() || self.task_timer_cycle.is_zero() {
            bail!("NAK generation and timer cycles must be positive");
        }
        if self.nack_timeout_ncf.is_zero() || self.nack_timeout_data.is_zero() {
            bail!("NAK timeouts must be positive");
        }
        if self.max_nacks_per_cycle == 0 {
            bail!("MaxNacksPerCycle must be positive");
        }
        if self.max_sqn_per_nack == 0 || self.max_sqn_per_nack > 63 {
            bail!("MaxSqnPerNack {} must be in 1..=63", self.max_sqn_per_nack);
        }
        if self.max_fragment_bytes == 0 {
            bail!("MaxFragmentBytes must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults_are_valid() {
        RumConfig::default_ipv4().validate().unwrap();
        RumConfig::default_ipv6().validate().unwrap();
    }

    #[rstest]
    #[case::packet_too_small(|c: &mut RumConfig| c.packet_size = 299)]
    #[case::packet_too_big(|c: &mut RumConfig| c.packet_size = 65001)]
    #[case::rate_too_low(|c: &mut RumConfig| { c.rate_limit = RateLimit::Static; c.trans_rate_limit_kbps = 7; })]
    #[case::memory_too_small(|c: &mut RumConfig| c.max_memory_bytes = 1000)]
    #[case::history_too_big(|c: &mut RumConfig| c.min_history_bytes = c.max_memory_bytes)]
    #[case::mixed_families(|c: &mut RumConfig| c.tx_interface = Some(IpAddr::V6(Ipv6Addr::LOCALHOST)))]
    #[case::no_streams(|c: &mut RumConfig| c.advanced.max_streams_per_transmitter = 0)]
    #[case::rdata_percent(|c: &mut RumConfig| c.advanced.rdata_send_percent = 101)]
    #[case::batching(|c: &mut RumConfig| c.advanced.min_batching = Duration::from_millis(2))]
    #[case::heartbeat_order(|c: &mut RumConfig| c.advanced.inter_heartbeat_min = Duration::from_secs(6))]
    #[case::alert_lo_above_hi(|c: &mut RumConfig| { c.advanced.memory_alert_pct_hi = 50; c.advanced.memory_alert_pct_lo = 60; })]
    #[case::sqn_per_nack(|c: &mut RumConfig| c.advanced.max_sqn_per_nack = 64)]
    fn test_validate_rejects(#[case] modify: fn(&mut RumConfig)) {
        let mut config = RumConfig::default_ipv4();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::rate_disabled_ignores_value(|c: &mut RumConfig| c.trans_rate_limit_kbps = 1)]
    #[case::alert_enabled(|c: &mut RumConfig| { c.advanced.memory_alert_pct_hi = 80; c.advanced.memory_alert_pct_lo = 60; })]
    #[case::ephemeral_port(|c: &mut RumConfig| c.server_port = 0)]
    fn test_validate_accepts(#[case] modify: fn(&mut RumConfig)) {
        let mut config = RumConfig::default_ipv4();
        modify(&mut config);
        config.validate().unwrap();
    }

    #[test]
    fn test_derived_values() {
        let mut config = RumConfig::default_ipv4();
        config.max_memory_bytes = 800_000;
        config.packet_size = 1000;
        assert_eq!(config.buffers_per_engine(), 400);
        assert_eq!(config.max_pending_packets(), 200);

        config.advanced.max_pending_queue_bytes = Some(10_000);
        assert_eq!(config.max_pending_packets(), 10);
    }

    #[rstest]
    #[case::tx_rx(Direction::TxRx, true, true)]
    #[case::tx_only(Direction::TxOnly, true, false)]
    #[case::rx_only(Direction::RxOnly, false, true)]
    fn test_direction(#[case] direction: Direction, #[case] tx: bool, #[case] rx: bool) {
        assert_eq!(direction.can_transmit(), tx);
        assert_eq!(direction.can_receive(), rx);
    }

    #[rstest]
    #[case::none(LogLevel::None, LogLevel::Error, false)]
    #[case::same(LogLevel::Info, LogLevel::Info, true)]
    #[case::less_verbose(LogLevel::Info, LogLevel::Warn, true)]
    #[case::more_verbose(LogLevel::Info, LogLevel::Trace, false)]
    #[case::xtrace(LogLevel::Xtrace, LogLevel::Trace, true)]
    fn test_log_level_cell(#[case] current: LogLevel, #[case] level: LogLevel, #[case] expected: bool) {
        let cell = LogLevelCell::new(LogLevel::Info);
        cell.set(current);
        assert_eq!(cell.get(), current);
        assert_eq!(cell.enabled(level), expected);
    }
}
