use crate::channel::{OutgoingRecord, SendKind, SenderChannel};
use crate::message::{OutgoingMessage, SendResult};
use crate::safe_converter::SafeCast;
use crate::sequence::{next_sequence_number, prev_sequence_number, relative_sequence_number, sequence_distance, NUM_SEQUENCE_NUMBERS};
use bit_set::BitSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

struct StoredMessage {
    message: Arc<OutgoingMessage>,
    num_sent: u32,
    last_sent: Instant,
}

/// Sender side of the reliable lanes. Every sent message is stored until it is acknowledged, and
///  resent if no ack arrives within the resend delay.
///
/// Stored messages live in an arena of `window_size` slots indexed by `sequence_number %
///  window_size`. Since the window size divides the sequence number ring, the sequence numbers
///  in flight never share a slot.
pub struct ReliableSenderChannel {
    window_size: u16,
    /// oldest sequence number that was not acknowledged yet
    window_start: u16,
    /// next sequence number to assign
    send_start: u16,
    stored: Vec<Option<StoredMessage>>,
    /// sequence numbers that were acknowledged ahead of `window_start`
    early_acks: BitSet,
    queue: VecDeque<Arc<OutgoingMessage>>,
    resend_delay: Duration,
}

impl ReliableSenderChannel {
    pub fn new(window_size: u16, resend_delay: Duration) -> ReliableSenderChannel {
        ReliableSenderChannel {
            window_size,
            window_start: 0,
            send_start: 0,
            stored: (0..window_size).map(|_| None).collect(),
            early_acks: BitSet::with_capacity(NUM_SEQUENCE_NUMBERS.safe_cast()),
            queue: VecDeque::new(),
            resend_delay,
        }
    }

    fn slot(&self, sequence_number: u16) -> usize {
        (sequence_number % self.window_size).safe_cast()
    }

    fn num_in_flight(&self) -> u16 {
        sequence_distance(self.window_start, self.send_start)
    }

    fn resend(&mut self, now: Instant, sequence_number: u16, kind: SendKind, out: &mut Vec<OutgoingRecord>) {
        let slot = self.slot(sequence_number);
        if let Some(stored) = &mut self.stored[slot] {
            stored.num_sent += 1;
            stored.last_sent = now;
            out.push(OutgoingRecord {
                message: stored.message.clone(),
                sequence_number,
                kind,
            });
        }
    }

    fn on_time_ack(&mut self) {
        let slot = self.slot(self.window_start);
        self.stored[slot] = None;
        self.window_start = next_sequence_number(self.window_start);

        while self.early_acks.remove(self.window_start.safe_cast()) {
            trace!("advancing send window past early ack #{}", self.window_start);
            self.window_start = next_sequence_number(self.window_start);
        }
    }

    fn early_ack(&mut self, now: Instant, sequence_number: u16, out: &mut Vec<OutgoingRecord>) {
        if !self.early_acks.insert(sequence_number.safe_cast()) {
            trace!("duplicate early ack for #{}", sequence_number);
            return;
        }
        let slot = self.slot(sequence_number);
        self.stored[slot] = None;

        // An ack for a later message means that the messages before it were probably lost, and
        //  waiting for the resend delay to expire adds latency for nothing. Messages that were
        //  resent before are left to the timer.
        let mut nr = prev_sequence_number(sequence_number);
        while relative_sequence_number(nr, self.window_start) >= 0 {
            if !self.early_acks.contains(nr.safe_cast()) {
                let sent_once = self.stored[self.slot(nr)]
                    .as_ref()
                    .map(|s| s.num_sent == 1)
                    .unwrap_or(false);
                if sent_once {
                    trace!("gap in acks: resending #{}", nr);
                    self.resend(now, nr, SendKind::GapResend, out);
                }
            }
            nr = prev_sequence_number(nr);
        }
    }
}

impl SenderChannel for ReliableSenderChannel {
    fn enqueue(&mut self, message: Arc<OutgoingMessage>) -> SendResult {
        self.queue.push_back(message);
        let allowed: usize = self.allowed_sends().safe_cast();
        if self.queue.len() > allowed {
            SendResult::Queued
        }
        else {
            SendResult::Sent
        }
    }

    fn send_queued_messages(&mut self, now: Instant, out: &mut Vec<OutgoingRecord>) {
        let mut nr = self.window_start;
        while nr != self.send_start {
            let is_due = self.stored[self.slot(nr)]
                .as_ref()
                .map(|s| now.saturating_duration_since(s.last_sent) >= self.resend_delay)
                .unwrap_or(false);
            if is_due {
                trace!("no ack for #{} within {:?}: resending", nr, self.resend_delay);
                self.resend(now, nr, SendKind::DelayResend, out);
            }
            nr = next_sequence_number(nr);
        }

        while self.allowed_sends() > 0 {
            let Some(message) = self.queue.pop_front() else {
                break;
            };

            let sequence_number = self.send_start;
            let slot = self.slot(sequence_number);
            self.stored[slot] = Some(StoredMessage {
                message: message.clone(),
                num_sent: 1,
                last_sent: now,
            });
            out.push(OutgoingRecord {
                message,
                sequence_number,
                kind: SendKind::First,
            });
            self.send_start = next_sequence_number(self.send_start);
        }
    }

    fn receive_acknowledge(&mut self, now: Instant, sequence_number: u16, out: &mut Vec<OutgoingRecord>) {
        let relate = relative_sequence_number(sequence_number, self.window_start);
        if relate < 0 {
            trace!("late or duplicate ack for #{}", sequence_number);
            return;
        }
        if relate >= self.num_in_flight() as i32 {
            debug!("ack for #{} which was never sent - ignoring", sequence_number);
            return;
        }

        if relate == 0 {
            self.on_time_ack();
        }
        else {
            self.early_ack(now, sequence_number, out);
        }
    }

    fn allowed_sends(&self) -> u16 {
        self.window_size - self.num_in_flight()
    }

    fn reset(&mut self) {
        self.window_start = 0;
        self.send_start = 0;
        self.stored.iter_mut().for_each(|s| *s = None);
        self.early_acks.clear();
        self.queue.clear();
    }

    fn set_resend_delay(&mut self, resend_delay: Duration) {
        self.resend_delay = resend_delay;
    }

    fn queued_len(&self) -> usize {
        self.queue.len()
    }
}
