use crate::channel::{ReceiveOutput, ReceiverChannel};
use crate::message::IncomingMessage;
use crate::safe_converter::SafeCast;
use crate::sequence::{add_to_sequence_number, next_sequence_number, relative_sequence_number, NUM_SEQUENCE_NUMBERS};
use bit_set::BitSet;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arrival {
    /// the next expected message
    OnTime,
    /// inside the window, but after the next expected message
    Early { relate: i32 },
    /// before the window: the message was received before
    Late,
    /// after the window: the sender can not have sent it yet, so it is bogus or from a previous
    ///  incarnation of the connection
    TooEarly,
}

/// The receive window shared by the reliable receiver channels: every message from `window_start`
///  (inclusive) to `window_start + window_size` (exclusive) can be accepted.
struct ReceiveWindow {
    window_size: u16,
    window_start: u16,
    /// sequence numbers received ahead of `window_start`
    early_received: BitSet,
}

impl ReceiveWindow {
    fn new(window_size: u16) -> ReceiveWindow {
        ReceiveWindow {
            window_size,
            window_start: 0,
            early_received: BitSet::with_capacity(NUM_SEQUENCE_NUMBERS.safe_cast()),
        }
    }

    fn classify(&self, sequence_number: u16) -> Arrival {
        let relate = relative_sequence_number(sequence_number, self.window_start);
        if relate == 0 {
            Arrival::OnTime
        }
        else if relate < 0 {
            Arrival::Late
        }
        else if relate >= self.window_size as i32 {
            Arrival::TooEarly
        }
        else {
            Arrival::Early { relate }
        }
    }

    fn slot(&self, sequence_number: u16) -> usize {
        (sequence_number % self.window_size).safe_cast()
    }

    /// returns false if the message was received as an early message before
    fn mark_early(&mut self, sequence_number: u16) -> bool {
        self.early_received.insert(sequence_number.safe_cast())
    }

    /// moves the window forward by one, returning true if the new window start was already
    ///  received early
    fn advance(&mut self) -> bool {
        self.window_start = next_sequence_number(self.window_start);
        self.early_received.remove(self.window_start.safe_cast())
    }

    fn reset(&mut self) {
        self.window_start = 0;
        self.early_received.clear();
    }
}

fn log_dropped(arrival: Arrival, message: &IncomingMessage) {
    match arrival {
        Arrival::Late => trace!("dropping late or duplicate message #{} on {}", message.sequence_number(), message.lane()),
        Arrival::TooEarly => trace!("dropping message #{} on {}: too far ahead of the receive window", message.sequence_number(), message.lane()),
        _ => trace!("dropping duplicate early message #{} on {}", message.sequence_number(), message.lane()),
    }
}

/// Releases every message exactly once, in the order it arrives
pub struct ReliableUnorderedReceiverChannel {
    window: ReceiveWindow,
}

impl ReliableUnorderedReceiverChannel {
    pub fn new(window_size: u16) -> ReliableUnorderedReceiverChannel {
        ReliableUnorderedReceiverChannel {
            window: ReceiveWindow::new(window_size),
        }
    }
}

impl ReceiverChannel for ReliableUnorderedReceiverChannel {
    fn receive(&mut self, message: IncomingMessage, out: &mut ReceiveOutput) {
        let sequence_number = message.sequence_number();
        //NB: duplicates are acked as well since the original ack may have been lost
        out.acks.push(sequence_number);

        match self.window.classify(sequence_number) {
            Arrival::OnTime => {
                out.released.push(message);
                while self.window.advance() {}
            }
            arrival @ Arrival::Early { .. } => {
                if self.window.mark_early(sequence_number) {
                    out.released.push(message);
                }
                else {
                    log_dropped(arrival, &message);
                }
            }
            arrival => log_dropped(arrival, &message),
        }
    }

    fn reset(&mut self) {
        self.window.reset();
    }
}

/// Withholds messages that arrive early until all their predecessors were released
pub struct ReliableOrderedReceiverChannel {
    window: ReceiveWindow,
    withheld: Vec<Option<IncomingMessage>>,
}

impl ReliableOrderedReceiverChannel {
    pub fn new(window_size: u16) -> ReliableOrderedReceiverChannel {
        ReliableOrderedReceiverChannel {
            window: ReceiveWindow::new(window_size),
            withheld: (0..window_size).map(|_| None).collect(),
        }
    }

    #[cfg(test)]
    fn num_withheld(&self) -> usize {
        self.withheld.iter().filter(|m| m.is_some()).count()
    }
}

impl ReceiverChannel for ReliableOrderedReceiverChannel {
    fn receive(&mut self, message: IncomingMessage, out: &mut ReceiveOutput) {
        let sequence_number = message.sequence_number();
        out.acks.push(sequence_number);

        match self.window.classify(sequence_number) {
            Arrival::OnTime => {
                out.released.push(message);
                while self.window.advance() {
                    let slot = self.window.slot(self.window.window_start);
                    if let Some(withheld) = self.withheld[slot].take() {
                        trace!("releasing withheld message #{}", withheld.sequence_number());
                        out.released.push(withheld);
                    }
                }
            }
            Arrival::Early { relate } => {
                if self.window.mark_early(sequence_number) {
                    trace!("withholding message #{} on {}: {} ahead of the next expected message", sequence_number, message.lane(), relate);
                    let slot = self.window.slot(sequence_number);
                    self.withheld[slot] = Some(message);
                }
                else {
                    log_dropped(Arrival::Early { relate }, &message);
                }
            }
            arrival => log_dropped(arrival, &message),
        }
    }

    fn reset(&mut self) {
        self.window.reset();
        self.withheld.iter_mut().for_each(|m| *m = None);
    }
}

/// Releases a message only if it is newer than everything released before. Messages that are
///  skipped over are never released, but the sender keeps resending them until they are acked.
pub struct ReliableSequencedReceiverChannel {
    window: ReceiveWindow,
}

impl ReliableSequencedReceiverChannel {
    pub fn new(window_size: u16) -> ReliableSequencedReceiverChannel {
        ReliableSequencedReceiverChannel {
            window: ReceiveWindow::new(window_size),
        }
    }
}

impl ReceiverChannel for ReliableSequencedReceiverChannel {
    fn receive(&mut self, message: IncomingMessage, out: &mut ReceiveOutput) {
        let sequence_number = message.sequence_number();
        out.acks.push(sequence_number);

        match self.window.classify(sequence_number) {
            Arrival::OnTime => {
                self.window.advance();
                out.released.push(message);
            }
            Arrival::Early { relate } => {
                trace!("skipping {} sequence numbers on {}", relate, message.lane());
                self.window.window_start = add_to_sequence_number(self.window.window_start, relate);
                self.window.advance();
                out.released.push(message);
            }
            arrival => log_dropped(arrival, &message),
        }
    }

    fn reset(&mut self) {
        self.window.reset();
    }
}
