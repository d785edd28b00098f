//! Value conversions at the API boundary.
//!
//! Application values are encoded into wire-ready [`ParameterValue`]s before
//! they reach the statement machinery, and binary-protocol result fields are
//! decoded into [`Value`]s here; nothing else in the crate interprets value
//! bytes.

use crate::binding::ParameterValue;
use crate::error::{Error, Result};
use crate::protocol::codec::{
    read_lenenc_bytes, read_u8, read_u16, read_u32, read_u64,
};
use crate::protocol::server::{ColumnDefinition, Row};
use crate::protocol::types::ColumnType;

/// UNSIGNED column flag.
const UNSIGNED_FLAG: u16 = 0x20;

/// Character set number of binary (non-text) data.
const BINARY_CHARSET: u16 = 63;

/// Conversion of an application value into a wire-ready parameter value.
pub trait IntoValue {
    fn into_value(self) -> ParameterValue;
}

macro_rules! into_int {
    ($($t:ty),*) => {
        $(impl IntoValue for $t {
            fn into_value(self) -> ParameterValue {
                ParameterValue::Int(i64::from(self))
            }
        })*
    };
}

macro_rules! into_uint {
    ($($t:ty),*) => {
        $(impl IntoValue for $t {
            fn into_value(self) -> ParameterValue {
                ParameterValue::UInt(u64::from(self))
            }
        })*
    };
}

into_int!(i8, i16, i32, i64);
into_uint!(u8, u16, u32, u64);

impl IntoValue for f32 {
    fn into_value(self) -> ParameterValue {
        ParameterValue::Double(f64::from(self))
    }
}

impl IntoValue for f64 {
    fn into_value(self) -> ParameterValue {
        ParameterValue::Double(self)
    }
}

impl IntoValue for bool {
    fn into_value(self) -> ParameterValue {
        ParameterValue::Int(i64::from(self))
    }
}

impl IntoValue for &str {
    fn into_value(self) -> ParameterValue {
        ParameterValue::Text(self.to_string())
    }
}

impl IntoValue for String {
    fn into_value(self) -> ParameterValue {
        ParameterValue::Text(self)
    }
}

impl IntoValue for &[u8] {
    fn into_value(self) -> ParameterValue {
        ParameterValue::Bytes(self.to_vec())
    }
}

impl IntoValue for Vec<u8> {
    fn into_value(self) -> ParameterValue {
        ParameterValue::Bytes(self)
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> ParameterValue {
        match self {
            Some(value) => value.into_value(),
            None => ParameterValue::Null,
        }
    }
}

/// SQL type witness accepted by `bind_null`.
///
/// NULL travels in the bitmap regardless of type, so the witness only
/// documents the caller's intent and is validated, not transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MysqlType {
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Varchar,
    Text,
    Blob,
}

/// A decoded result field.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Text(v) => Some(v.as_bytes()),
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

/// Decode a binary-protocol result row against its column definitions.
pub fn decode_row(row: &Row, columns: &[ColumnDefinition]) -> Result<Vec<Value>> {
    let (header, rest) = read_u8(&row.payload)?;
    if header != 0x00 {
        return Err(Error::Protocol(format!(
            "binary row starts with 0x{header:02X}, expected 0x00"
        )));
    }
    // The NULL bitmap is offset by two bits.
    let bitmap_len = (columns.len() + 2).div_ceil(8);
    let (bitmap, mut rest) = crate::protocol::codec::read_bytes(rest, bitmap_len)?;
    let mut values = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit >> 3] & (1 << (bit & 7)) != 0 {
            values.push(Value::Null);
            continue;
        }
        let unsigned = column.flags & UNSIGNED_FLAG != 0;
        let column_type = ColumnType::from_u8(column.type_byte).ok_or_else(|| {
            Error::Protocol(format!("unknown column type 0x{:02X}", column.type_byte))
        })?;
        let value = match column_type {
            ColumnType::Null => Value::Null,
            ColumnType::Tiny => {
                let (v, r) = read_u8(rest)?;
                rest = r;
                if unsigned {
                    Value::UInt(u64::from(v))
                } else {
                    Value::Int(i64::from(v as i8))
                }
            }
            ColumnType::Short => {
                let (v, r) = read_u16(rest)?;
                rest = r;
                if unsigned {
                    Value::UInt(u64::from(v))
                } else {
                    Value::Int(i64::from(v as i16))
                }
            }
            ColumnType::Long => {
                let (v, r) = read_u32(rest)?;
                rest = r;
                if unsigned {
                    Value::UInt(u64::from(v))
                } else {
                    Value::Int(i64::from(v as i32))
                }
            }
            ColumnType::LongLong => {
                let (v, r) = read_u64(rest)?;
                rest = r;
                if unsigned {
                    Value::UInt(v)
                } else {
                    Value::Int(v as i64)
                }
            }
            ColumnType::Float => {
                let (v, r) = read_u32(rest)?;
                rest = r;
                Value::Double(f64::from(f32::from_bits(v)))
            }
            ColumnType::Double => {
                let (v, r) = read_u64(rest)?;
                rest = r;
                Value::Double(f64::from_bits(v))
            }
            ColumnType::Blob | ColumnType::VarString | ColumnType::String => {
                let (bytes, r) = read_lenenc_bytes(rest)?;
                rest = r;
                if column.charset == BINARY_CHARSET {
                    Value::Bytes(bytes.to_vec())
                } else {
                    Value::Text(crate::protocol::codec::decode_utf8(bytes)?.to_string())
                }
            }
        };
        values.push(value);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(type_byte: u8, flags: u16, charset: u16) -> ColumnDefinition {
        ColumnDefinition {
            schema: String::new(),
            table: String::new(),
            name: String::new(),
            charset,
            column_length: 0,
            type_byte,
            flags,
            decimals: 0,
        }
    }

    #[test]
    fn decodes_ints_and_nulls() {
        // Columns: BIGINT, INT NULL, TINYINT UNSIGNED.
        let columns = vec![
            column(0x08, 0, 63),
            column(0x03, 0, 63),
            column(0x01, UNSIGNED_FLAG, 63),
        ];
        let mut payload = vec![0x00];
        // Bitmap: column 1 is NULL, bit index 3.
        payload.push(0b0000_1000);
        payload.extend_from_slice(&(-7i64).to_le_bytes());
        payload.push(200);
        let row = Row { payload };
        let values = decode_row(&row, &columns).unwrap();
        assert_eq!(
            values,
            vec![Value::Int(-7), Value::Null, Value::UInt(200)]
        );
    }

    #[test]
    fn decodes_text_and_binary() {
        let columns = vec![column(0xFD, 0, 45), column(0xFC, 0, 63)];
        let mut payload = vec![0x00, 0x00];
        payload.push(5);
        payload.extend_from_slice(b"hello");
        payload.push(2);
        payload.extend_from_slice(&[0xDE, 0xAD]);
        let row = Row { payload };
        let values = decode_row(&row, &columns).unwrap();
        assert_eq!(values[0], Value::Text("hello".into()));
        assert_eq!(values[1], Value::Bytes(vec![0xDE, 0xAD]));
    }

    #[test]
    fn option_binds_null() {
        assert_eq!(None::<i32>.into_value(), ParameterValue::Null);
        assert_eq!(Some(5i32).into_value(), ParameterValue::Int(5));
        assert_eq!(true.into_value(), ParameterValue::Int(1));
    }
}
