use crate::bits::bit_buffer::BitBuffer;
use anyhow::anyhow;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The closed set of primitive kinds that can be written to and read from a [BitBuffer]
///  without knowing the concrete type at compile time, e.g. for generic (de)serialization of
///  application payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ValueKind {
    Bool = 0,
    U8 = 1,
    I8 = 2,
    U16 = 3,
    I16 = 4,
    U32 = 5,
    I32 = 6,
    U64 = 7,
    I64 = 8,
    F32 = 9,
    F64 = 10,
    VarU32 = 11,
    VarI32 = 12,
    VarU64 = 13,
    VarI64 = 14,
    String = 15,
    Bytes = 16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetValue {
    Bool(bool),
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    VarU32(u32),
    VarI32(i32),
    VarU64(u64),
    VarI64(i64),
    String(String),
    Bytes(Vec<u8>),
}

impl NetValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            NetValue::Bool(_) => ValueKind::Bool,
            NetValue::U8(_) => ValueKind::U8,
            NetValue::I8(_) => ValueKind::I8,
            NetValue::U16(_) => ValueKind::U16,
            NetValue::I16(_) => ValueKind::I16,
            NetValue::U32(_) => ValueKind::U32,
            NetValue::I32(_) => ValueKind::I32,
            NetValue::U64(_) => ValueKind::U64,
            NetValue::I64(_) => ValueKind::I64,
            NetValue::F32(_) => ValueKind::F32,
            NetValue::F64(_) => ValueKind::F64,
            NetValue::VarU32(_) => ValueKind::VarU32,
            NetValue::VarI32(_) => ValueKind::VarI32,
            NetValue::VarU64(_) => ValueKind::VarU64,
            NetValue::VarI64(_) => ValueKind::VarI64,
            NetValue::String(_) => ValueKind::String,
            NetValue::Bytes(_) => ValueKind::Bytes,
        }
    }
}

impl BitBuffer {
    pub fn write_value(&mut self, value: &NetValue) {
        match value {
            NetValue::Bool(v) => self.write_bool(*v),
            NetValue::U8(v) => self.write_u8(*v),
            NetValue::I8(v) => self.write_i8(*v),
            NetValue::U16(v) => self.write_u16(*v),
            NetValue::I16(v) => self.write_i16(*v),
            NetValue::U32(v) => self.write_u32(*v),
            NetValue::I32(v) => self.write_i32(*v),
            NetValue::U64(v) => self.write_u64(*v),
            NetValue::I64(v) => self.write_i64(*v),
            NetValue::F32(v) => self.write_f32(*v),
            NetValue::F64(v) => self.write_f64(*v),
            NetValue::VarU32(v) => self.write_var_u32(*v),
            NetValue::VarI32(v) => self.write_var_i32(*v),
            NetValue::VarU64(v) => self.write_var_u64(*v),
            NetValue::VarI64(v) => self.write_var_i64(*v),
            NetValue::String(v) => self.write_string(v),
            NetValue::Bytes(v) => self.write_len_prefixed_bytes(v),
        }
    }

    pub fn read_value(&mut self, kind: ValueKind) -> anyhow::Result<NetValue> {
        Ok(match kind {
            ValueKind::Bool => NetValue::Bool(self.read_bool()?),
            ValueKind::U8 => NetValue::U8(self.read_u8()?),
            ValueKind::I8 => NetValue::I8(self.read_i8()?),
            ValueKind::U16 => NetValue::U16(self.read_u16()?),
            ValueKind::I16 => NetValue::I16(self.read_i16()?),
            ValueKind::U32 => NetValue::U32(self.read_u32()?),
            ValueKind::I32 => NetValue::I32(self.read_i32()?),
            ValueKind::U64 => NetValue::U64(self.read_u64()?),
            ValueKind::I64 => NetValue::I64(self.read_i64()?),
            ValueKind::F32 => NetValue::F32(self.read_f32()?),
            ValueKind::F64 => NetValue::F64(self.read_f64()?),
            ValueKind::VarU32 => NetValue::VarU32(self.read_var_u32()?),
            ValueKind::VarI32 => NetValue::VarI32(self.read_var_i32()?),
            ValueKind::VarU64 => NetValue::VarU64(self.read_var_u64()?),
            ValueKind::VarI64 => NetValue::VarI64(self.read_var_i64()?),
            ValueKind::String => NetValue::String(self.read_string()?),
            ValueKind::Bytes => NetValue::Bytes(self.read_len_prefixed_bytes()?),
        })
    }

    /// writes the value's kind (one byte) followed by the value itself
    pub fn write_tagged_value(&mut self, value: &NetValue) {
        self.write_u8(value.kind().into());
        self.write_value(value);
    }

    pub fn read_tagged_value(&mut self) -> anyhow::Result<NetValue> {
        let raw_kind = self.read_u8()?;
        let kind = ValueKind::try_from(raw_kind)
            .map_err(|_| anyhow!("unknown value kind {}", raw_kind))?;
        self.read_value(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_values() {
        let values = vec![
            NetValue::Bool(true),
            NetValue::I8(-3),
            NetValue::U16(65000),
            NetValue::I32(-70000),
            NetValue::U64(u64::MAX),
            NetValue::F32(0.5),
            NetValue::F64(-1.25),
            NetValue::VarI32(-1),
            NetValue::VarU64(300),
            NetValue::String("server #1".to_string()),
            NetValue::Bytes(vec![1, 2, 3]),
        ];

        let mut buf = BitBuffer::new();
        for v in &values {
            buf.write_tagged_value(v);
        }

        for v in &values {
            assert_eq!(&buf.read_tagged_value().unwrap(), v);
        }
        assert_eq!(buf.remaining_bits(), 0);
    }

    #[test]
    fn test_unknown_kind() {
        let mut buf = BitBuffer::from_bytes(&[200, 1]);
        assert!(buf.read_tagged_value().is_err());
    }

    #[test]
    fn test_read_value_overflow() {
        let mut buf = BitBuffer::from_bytes(&[1, 2]);
        assert!(buf.read_value(ValueKind::U32).is_err());
    }
}
