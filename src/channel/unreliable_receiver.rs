use crate::channel::{ReceiveOutput, ReceiverChannel};
use crate::message::IncomingMessage;
use crate::sequence::relative_sequence_number;
use tracing::trace;

/// Releases every message as it arrives. Messages are still acked because the sender's window
///  advances on acks.
pub struct UnreliableReceiverChannel;

impl ReceiverChannel for UnreliableReceiverChannel {
    fn receive(&mut self, message: IncomingMessage, out: &mut ReceiveOutput) {
        out.acks.push(message.sequence_number());
        out.released.push(message);
    }

    fn reset(&mut self) {
    }
}

/// Releases a message only if it is newer than every message released before, dropping late
///  arrivals instead of buffering them.
pub struct UnreliableSequencedReceiverChannel {
    last_received: Option<u16>,
}

impl UnreliableSequencedReceiverChannel {
    pub fn new() -> UnreliableSequencedReceiverChannel {
        UnreliableSequencedReceiverChannel {
            last_received: None,
        }
    }
}

impl Default for UnreliableSequencedReceiverChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiverChannel for UnreliableSequencedReceiverChannel {
    fn receive(&mut self, message: IncomingMessage, out: &mut ReceiveOutput) {
        let sequence_number = message.sequence_number();
        out.acks.push(sequence_number);

        if let Some(last_received) = self.last_received {
            if relative_sequence_number(sequence_number, last_received) <= 0 {
                trace!("dropping late message #{} on {} - already received #{}", sequence_number, message.lane(), last_received);
                return;
            }
        }

        self.last_received = Some(sequence_number);
        out.released.push(message);
    }

    fn reset(&mut self) {
        self.last_received = None;
    }
}
