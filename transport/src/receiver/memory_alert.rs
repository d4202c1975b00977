use crate::events::EventType;
use tracing::{info, warn};

/// Tracks receive memory utilization with hysteresis: the crisis starts when utilization
///  reaches the high mark and ends only when it drops to the low mark. A high mark of 0
///  disables the alert.
#[derive(Debug)]
pub struct MemoryAlert {
    pct_hi: u32,
    pct_lo: u32,
    in_crisis: bool,
}

impl MemoryAlert {
    pub fn new(pct_hi: u32, pct_lo: u32) -> MemoryAlert {
        MemoryAlert {
            pct_hi,
            pct_lo,
            in_crisis: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.pct_hi > 0
    }

    pub fn in_crisis(&self) -> bool {
        self.in_crisis
    }

    /// Returns the event to announce if the state changed
    pub fn update(&mut self, utilization_percent: u32) -> Option<EventType> {
        if !self.is_enabled() {
            return None;
        }

        if !self.in_crisis && utilization_percent >= self.pct_hi {
            warn!(msg_key = 4321, "receive memory at {}% - entering memory crisis", utilization_percent);
            self.in_crisis = true;
            return Some(EventType::MemoryAlertOn);
        }
        if self.in_crisis && utilization_percent <= self.pct_lo {
            info!(msg_key = 5321, "receive memory at {}% - memory crisis is over", utilization_percent);
            self.in_crisis = false;
            return Some(EventType::MemoryAlertOff);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hysteresis() {
        let mut alert = MemoryAlert::new(80, 50);
        let events = [10, 79, 80, 95, 70, 51, 50, 60, 79, 10]
            .into_iter()
            .filter_map(|pct| alert.update(pct))
            .collect::<Vec<_>>();
        assert_eq!(events, vec![EventType::MemoryAlertOn, EventType::MemoryAlertOff]);
        assert!(!alert.in_crisis());
    }

    #[test]
    fn test_disabled() {
        let mut alert = MemoryAlert::new(0, 0);
        assert!(!alert.is_enabled());
        assert_eq!(alert.update(100), None);
        assert!(!alert.in_crisis());
    }
}
