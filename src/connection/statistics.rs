use crate::channel::SendKind;

/// Traffic counters of a single connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatistics {
    pub sent_datagrams: u64,
    pub sent_bytes: u64,
    pub received_datagrams: u64,
    pub received_bytes: u64,

    /// user messages sent for the first time, fragments counting individually
    pub sent_messages: u64,
    pub received_messages: u64,
    pub resent_messages_delay: u64,
    pub resent_messages_gap: u64,
    /// user messages discarded because an unreliable send window was full
    pub dropped_messages: u64,
}

impl ConnectionStatistics {
    pub fn on_datagram_sent(&mut self, num_bytes: usize) {
        self.sent_datagrams += 1;
        self.sent_bytes += num_bytes as u64;
    }

    pub fn on_datagram_received(&mut self, num_bytes: usize) {
        self.received_datagrams += 1;
        self.received_bytes += num_bytes as u64;
    }

    pub fn on_message_sent(&mut self, kind: SendKind) {
        match kind {
            SendKind::First => self.sent_messages += 1,
            SendKind::DelayResend => self.resent_messages_delay += 1,
            SendKind::GapResend => self.resent_messages_gap += 1,
        }
    }

    pub fn total_resent(&self) -> u64 {
        self.resent_messages_delay + self.resent_messages_gap
    }
}
