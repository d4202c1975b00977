use std::time::Duration;
use tokio::time::Instant;

/// When to send SPMs for a transmit stream. While data flows, SPMs go out at the ambient
///  interval. After the last data packet, heartbeat SPMs start at the minimum interval and back
///  off exponentially to the maximum interval.
#[derive(Debug, Clone)]
pub struct SpmSchedule {
    min_interval: Duration,
    max_interval: Duration,
    ambient_interval: Duration,
    heartbeat_interval: Duration,
    next_heartbeat: Option<Instant>,
    next_ambient: Instant,
    is_forced: bool,
}

impl SpmSchedule {
    pub fn new(min_interval: Duration, max_interval: Duration, ambient_interval: Duration, now: Instant) -> SpmSchedule {
        SpmSchedule {
            min_interval,
            max_interval,
            ambient_interval,
            heartbeat_interval: min_interval,
            next_heartbeat: None,
            next_ambient: now + ambient_interval,
            // the first packet of every stream is an SPM
            is_forced: true,
        }
    }

    /// requests an SPM at the next opportunity
    pub fn force(&mut self) {
        self.is_forced = true;
    }

    pub fn on_data_sent(&mut self, now: Instant) {
        self.heartbeat_interval = self.min_interval;
        self.next_heartbeat = Some(now + self.min_interval);
    }

    /// Returns `true` if an SPM is due, rescheduling the next one on the assumption that it is
    ///  sent right away
    #[must_use]
    pub fn poll(&mut self, now: Instant) -> bool {
        let heartbeat_due = self.next_heartbeat.is_some_and(|t| now >= t);
        if !(self.is_forced || heartbeat_due || now >= self.next_ambient) {
            return false;
        }

        self.is_forced = false;
        self.next_ambient = now + self.ambient_interval;
        if self.next_heartbeat.is_some() {
            self.heartbeat_interval = (self.heartbeat_interval * 2).min(self.max_interval);
            self.next_heartbeat = Some(now + self.heartbeat_interval);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn schedule(now: Instant) -> SpmSchedule {
        SpmSchedule::new(ms(500), ms(5000), ms(5000), now)
    }

    #[test]
    fn test_first_spm_is_immediate() {
        let now = Instant::now();
        let mut schedule = schedule(now);
        assert!(schedule.poll(now));
        assert!(!schedule.poll(now));
        assert!(!schedule.poll(now + ms(4999)));
        assert!(schedule.poll(now + ms(5000)));
    }

    #[rstest]
    #[case::first(vec![], 500)]
    #[case::second(vec![500], 1500)]
    #[case::third(vec![500, 1500], 3500)]
    #[case::capped(vec![500, 1500, 3500], 7500)]
    #[case::stays_capped(vec![500, 1500, 3500, 7500], 11500)]
    fn test_heartbeat_backoff(#[case] previous: Vec<u64>, #[case] expected_next: u64) {
        let now = Instant::now();
        let mut schedule = SpmSchedule::new(ms(500), ms(4000), ms(60_000), now);
        assert!(schedule.poll(now));
        schedule.on_data_sent(now);

        for p in previous {
            assert!(schedule.poll(now + ms(p)));
        }
        assert!(!schedule.poll(now + ms(expected_next - 1)));
        assert!(schedule.poll(now + ms(expected_next)));
    }

    #[test]
    fn test_data_resets_backoff() {
        let now = Instant::now();
        let mut schedule = schedule(now);
        assert!(schedule.poll(now));
        schedule.on_data_sent(now);
        assert!(schedule.poll(now + ms(500)));
        assert!(!schedule.poll(now + ms(1000)));

        schedule.on_data_sent(now + ms(1000));
        assert!(!schedule.poll(now + ms(1499)));
        assert!(schedule.poll(now + ms(1500)));
    }

    #[test]
    fn test_ambient_while_sending() {
        let now = Instant::now();
        let mut schedule = schedule(now);
        assert!(schedule.poll(now));

        let mut spms = 0;
        for t in (0..12_000).step_by(100) {
            schedule.on_data_sent(now + ms(t));
            if schedule.poll(now + ms(t)) {
                spms += 1;
            }
        }
        assert_eq!(spms, 2);
    }

    #[test]
    fn test_force() {
        let now = Instant::now();
        let mut schedule = schedule(now);
        assert!(schedule.poll(now));
        schedule.force();
        assert!(schedule.poll(now + ms(1)));
        assert!(!schedule.poll(now + ms(2)));
    }
}
