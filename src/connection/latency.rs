use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// weight of the previous average when blending in a new round trip sample
const RTT_HISTORY_WEIGHT: f64 = 0.7;

/// Ping / pong bookkeeping of a connection: round trip time measurement and the timeout deadline
///  that every matching pong pushes out.
pub struct LatencyTracker {
    ping_interval: Duration,
    connection_timeout: Duration,

    ping_number: u8,
    last_ping_sent: Option<Instant>,
    next_ping: Instant,
    timeout_deadline: Instant,
    average_rtt: Option<Duration>,
}

impl LatencyTracker {
    pub fn new(now: Instant, ping_interval: Duration, connection_timeout: Duration) -> LatencyTracker {
        LatencyTracker {
            ping_interval,
            connection_timeout,
            ping_number: 0,
            last_ping_sent: None,
            next_ping: now,
            timeout_deadline: now + connection_timeout,
            average_rtt: None,
        }
    }

    /// restarts timeout and ping schedule, e.g. when the connection is established
    pub fn restart(&mut self, now: Instant) {
        self.next_ping = now;
        self.timeout_deadline = now + self.connection_timeout;
        self.last_ping_sent = None;
    }

    pub fn is_ping_due(&self, now: Instant) -> bool {
        now >= self.next_ping
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        now >= self.timeout_deadline
    }

    /// returns the number to send with the ping
    pub fn send_ping(&mut self, now: Instant) -> u8 {
        self.ping_number = self.ping_number.wrapping_add(1);
        self.last_ping_sent = Some(now);
        self.next_ping = now + self.ping_interval;
        trace!("sending ping #{}", self.ping_number);
        self.ping_number
    }

    /// Returns the new average round trip time, or `None` if the pong does not answer the last
    ///  ping
    pub fn received_pong(&mut self, now: Instant, pong_number: u8) -> Option<Duration> {
        let Some(ping_sent) = self.last_ping_sent else {
            debug!("received pong #{} without a pending ping - ignoring", pong_number);
            return None;
        };
        if pong_number != self.ping_number {
            debug!("received pong #{}, but last ping was #{} - ignoring", pong_number, self.ping_number);
            return None;
        }

        self.last_ping_sent = None;
        self.timeout_deadline = now + self.connection_timeout;

        let rtt = now.saturating_duration_since(ping_sent);
        let average = match self.average_rtt {
            None => rtt,
            Some(prev) => prev.mul_f64(RTT_HISTORY_WEIGHT) + rtt.mul_f64(1.0 - RTT_HISTORY_WEIGHT),
        };
        trace!("round trip sample {:?}, average is now {:?}", rtt, average);
        self.average_rtt = Some(average);
        Some(average)
    }

    pub fn average_rtt(&self) -> Option<Duration> {
        self.average_rtt
    }

    pub fn timeout_deadline(&self) -> Instant {
        self.timeout_deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const PING_INTERVAL: Duration = Duration::from_secs(4);
    const TIMEOUT: Duration = Duration::from_secs(25);

    #[test]
    fn test_first_sample_is_adopted() {
        let start = Instant::now();
        let mut tracker = LatencyTracker::new(start, PING_INTERVAL, TIMEOUT);
        assert!(tracker.is_ping_due(start));

        let nr = tracker.send_ping(start);
        assert!(!tracker.is_ping_due(start + Duration::from_secs(1)));
        assert!(tracker.is_ping_due(start + PING_INTERVAL));

        let avg = tracker.received_pong(start + Duration::from_millis(80), nr);
        assert_eq!(avg, Some(Duration::from_millis(80)));
        assert_eq!(tracker.timeout_deadline(), start + Duration::from_millis(80) + TIMEOUT);
    }

    #[test]
    fn test_blend() {
        let start = Instant::now();
        let mut tracker = LatencyTracker::new(start, PING_INTERVAL, TIMEOUT);

        let nr = tracker.send_ping(start);
        tracker.received_pong(start + Duration::from_millis(100), nr);
        let nr = tracker.send_ping(start + PING_INTERVAL);
        let avg = tracker.received_pong(start + PING_INTERVAL + Duration::from_millis(200), nr).unwrap();

        // 0.7 * 100 + 0.3 * 200
        assert!((avg.as_secs_f64() - 0.130).abs() < 1e-6);
    }

    #[rstest]
    #[case::slower(Duration::from_millis(10), Duration::from_millis(300))]
    #[case::faster(Duration::from_millis(500), Duration::from_millis(20))]
    fn test_rtt_convergence(#[case] initial: Duration, #[case] steady: Duration) {
        let mut now = Instant::now();
        let mut tracker = LatencyTracker::new(now, PING_INTERVAL, TIMEOUT);

        let nr = tracker.send_ping(now);
        tracker.received_pong(now + initial, nr);

        let mut avg = Duration::ZERO;
        for _ in 0..30 {
            now += PING_INTERVAL;
            let nr = tracker.send_ping(now);
            avg = tracker.received_pong(now + steady, nr).unwrap();
        }
        // 0.7^30 is about 2e-5
        assert!((avg.as_secs_f64() - steady.as_secs_f64()).abs() < 1e-4);
    }

    #[test]
    fn test_mismatched_pong() {
        let start = Instant::now();
        let mut tracker = LatencyTracker::new(start, PING_INTERVAL, TIMEOUT);
        let deadline = tracker.timeout_deadline();

        let nr = tracker.send_ping(start);
        assert_eq!(tracker.received_pong(start + Duration::from_millis(10), nr.wrapping_add(1)), None);
        assert_eq!(tracker.average_rtt(), None);
        assert_eq!(tracker.timeout_deadline(), deadline);

        // the right pong still counts afterwards
        assert!(tracker.received_pong(start + Duration::from_millis(20), nr).is_some());
    }

    #[test]
    fn test_duplicate_pong() {
        let start = Instant::now();
        let mut tracker = LatencyTracker::new(start, PING_INTERVAL, TIMEOUT);
        let nr = tracker.send_ping(start);
        assert!(tracker.received_pong(start + Duration::from_millis(10), nr).is_some());
        assert!(tracker.received_pong(start + Duration::from_millis(500), nr).is_none());
        assert_eq!(tracker.average_rtt(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_ping_number_wraps() {
        let start = Instant::now();
        let mut tracker = LatencyTracker::new(start, PING_INTERVAL, TIMEOUT);
        let numbers = (0..257)
            .map(|_| tracker.send_ping(start))
            .collect::<Vec<_>>();
        assert_eq!(numbers[0], 1);
        assert_eq!(numbers[254], 255);
        assert_eq!(numbers[255], 0);
        assert_eq!(numbers[256], 1);
    }

    #[test]
    fn test_timeout() {
        let start = Instant::now();
        let tracker = LatencyTracker::new(start, PING_INTERVAL, TIMEOUT);
        assert!(!tracker.is_timed_out(start + TIMEOUT - Duration::from_millis(1)));
        assert!(tracker.is_timed_out(start + TIMEOUT));
    }
}
