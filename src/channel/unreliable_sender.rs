use crate::channel::{OutgoingRecord, SendKind, SenderChannel};
use crate::message::{OutgoingMessage, SendResult};
use crate::sequence::{next_sequence_number, relative_sequence_number, sequence_distance};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Sender side of `Unreliable` and `UnreliableSequenced` lanes. Messages are sent once and never
///  stored, but the number of unacknowledged messages is still bounded by the window: acks
///  provide flow control even though lost messages are not resent.
///
/// A message that is not acknowledged within the resend delay is given up on, i.e. it leaves the
///  window as if it had been acknowledged. Otherwise a burst of lost messages or acks would fill
///  the window for good.
pub struct UnreliableSenderChannel {
    window_size: u16,
    /// oldest sequence number that was not acknowledged yet
    window_start: u16,
    /// next sequence number to assign
    send_start: u16,
    /// send time of each message in flight, starting at `window_start`
    sent_at: VecDeque<Instant>,
    resend_delay: Duration,
    queue: VecDeque<Arc<OutgoingMessage>>,
}

impl UnreliableSenderChannel {
    pub fn new(window_size: u16, resend_delay: Duration) -> UnreliableSenderChannel {
        UnreliableSenderChannel {
            window_size,
            window_start: 0,
            send_start: 0,
            sent_at: VecDeque::new(),
            resend_delay,
            queue: VecDeque::new(),
        }
    }

    /// moves the window past messages that were not acknowledged in time
    fn give_up_on_overdue(&mut self, now: Instant) {
        let mut num_overdue = 0;
        while let Some(&sent_at) = self.sent_at.front() {
            if now.saturating_duration_since(sent_at) < self.resend_delay {
                break;
            }
            self.sent_at.pop_front();
            self.window_start = next_sequence_number(self.window_start);
            num_overdue += 1;
        }
        if num_overdue > 0 {
            trace!("no ack for {} unreliable messages within {:?} - giving up on them", num_overdue, self.resend_delay);
        }
    }

    fn num_in_flight(&self) -> u16 {
        sequence_distance(self.window_start, self.send_start)
    }
}

impl SenderChannel for UnreliableSenderChannel {
    fn enqueue(&mut self, message: Arc<OutgoingMessage>) -> SendResult {
        if self.queue.len() + 1 > self.allowed_sends() as usize {
            trace!("unreliable send window is full: dropping message");
            return SendResult::Dropped;
        }
        self.queue.push_back(message);
        SendResult::Sent
    }

    fn send_queued_messages(&mut self, now: Instant, out: &mut Vec<OutgoingRecord>) {
        self.give_up_on_overdue(now);

        while self.allowed_sends() > 0 {
            let Some(message) = self.queue.pop_front() else {
                break;
            };

            out.push(OutgoingRecord {
                message,
                sequence_number: self.send_start,
                kind: SendKind::First,
            });
            self.sent_at.push_back(now);
            self.send_start = next_sequence_number(self.send_start);
        }
    }

    fn receive_acknowledge(&mut self, _now: Instant, sequence_number: u16, _out: &mut Vec<OutgoingRecord>) {
        let relate = relative_sequence_number(sequence_number, self.window_start);
        if relate < 0 {
            trace!("late or duplicate ack for #{}", sequence_number);
            return;
        }
        if relate >= self.num_in_flight() as i32 {
            trace!("ack for #{} which was never sent - ignoring", sequence_number);
            return;
        }

        // everything before the acked message is either lost or its ack is, and there is no
        //  point in waiting for it
        self.sent_at.drain(..=relate as usize);
        self.window_start = next_sequence_number(sequence_number);
    }

    fn allowed_sends(&self) -> u16 {
        self.window_size - self.num_in_flight()
    }

    fn reset(&mut self) {
        self.window_start = 0;
        self.send_start = 0;
        self.sent_at.clear();
        self.queue.clear();
    }

    fn set_resend_delay(&mut self, resend_delay: Duration) {
        self.resend_delay = resend_delay;
    }

    fn queued_len(&self) -> usize {
        self.queue.len()
    }
}

impl UnreliableSenderChannel {
    #[cfg(test)]
    fn window(&self) -> (u16, u16) {
        (self.window_start, self.send_start)
    }
}
