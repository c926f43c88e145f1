//! Bit level serialization of primitive values. Every message payload is a [BitBuffer].

pub mod bit_buffer;
pub mod bit_ops;
pub mod value;

pub use bit_buffer::BitBuffer;
pub use value::{NetValue, ValueKind};
