//! Parameter bindings for one or more executions of a prepared statement.

use crate::error::{Error, Result};
use crate::protocol::codec::{write_lenenc_bytes, write_u64};
use crate::protocol::types::ColumnType;

/// An encoded, wire-ready parameter value.
///
/// Values are produced by the codec layer and are not interpreted by the
/// statement machinery. Resource-backed values (strings, blobs) are released
/// when the owning [`Binding`] is consumed or cleared.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    /// SQL NULL, transferred via the NULL bitmap
    Null,
    /// Signed 64-bit integer
    Int(i64),
    /// Unsigned 64-bit integer
    UInt(u64),
    /// 64-bit float
    Double(f64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
}

impl ParameterValue {
    /// Binary-protocol field type for the COM_STMT_EXECUTE type block.
    pub fn column_type(&self) -> ColumnType {
        match self {
            ParameterValue::Null => ColumnType::Null,
            ParameterValue::Int(_) | ParameterValue::UInt(_) => ColumnType::LongLong,
            ParameterValue::Double(_) => ColumnType::Double,
            ParameterValue::Text(_) => ColumnType::VarString,
            ParameterValue::Bytes(_) => ColumnType::Blob,
        }
    }

    /// Whether the unsigned flag must be set in the type block.
    pub fn is_unsigned(&self) -> bool {
        matches!(self, ParameterValue::UInt(_))
    }

    /// Whether this value is represented in the NULL bitmap only.
    pub fn is_null(&self) -> bool {
        matches!(self, ParameterValue::Null)
    }

    /// Append the binary-protocol encoding of this value.
    ///
    /// NULL writes nothing; it is carried by the bitmap.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            ParameterValue::Null => {}
            ParameterValue::Int(v) => write_u64(buf, *v as u64),
            ParameterValue::UInt(v) => write_u64(buf, *v),
            ParameterValue::Double(v) => buf.extend_from_slice(&v.to_le_bytes()),
            ParameterValue::Text(s) => write_lenenc_bytes(buf, s.as_bytes()),
            ParameterValue::Bytes(b) => write_lenenc_bytes(buf, b),
        }
    }
}

/// One complete set of parameter values for one execution of a statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    values: Vec<Option<ParameterValue>>,
}

impl Binding {
    /// Create an empty binding with `param_count` unfilled positions.
    pub fn new(param_count: usize) -> Self {
        Self {
            values: vec![None; param_count],
        }
    }

    /// Number of parameter positions.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the binding has no positions at all.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Set the value at `index`, replacing any previous value.
    pub fn add(&mut self, index: usize, value: ParameterValue) -> Result<()> {
        match self.values.get_mut(index) {
            Some(slot) => {
                *slot = Some(value);
                Ok(())
            }
            None => Err(Error::InvalidUsage(format!(
                "parameter index {} out of range (statement has {} parameters)",
                index,
                self.values.len()
            ))),
        }
    }

    /// Lowest parameter index without a value, if any.
    pub fn find_unbind(&self) -> Option<usize> {
        self.values.iter().position(Option::is_none)
    }

    /// Release all values.
    pub fn clear(&mut self) {
        for slot in &mut self.values {
            *slot = None;
        }
    }

    /// Encode the COM_STMT_EXECUTE parameter block: NULL bitmap, new-params
    /// flag, type block, and value bytes.
    ///
    /// The binding must be complete; unfilled positions are encoded as NULL
    /// to keep this infallible at the wire layer (completeness is validated
    /// when the row is finalized).
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        if self.values.is_empty() {
            return;
        }

        let bitmap_len = self.values.len().div_ceil(8);
        let bitmap_start = buf.len();
        buf.resize(bitmap_start + bitmap_len, 0);
        for (i, value) in self.values.iter().enumerate() {
            let is_null = value.as_ref().is_none_or(ParameterValue::is_null);
            if is_null {
                buf[bitmap_start + i / 8] |= 1 << (i % 8);
            }
        }

        // new-params-bound flag: always resend types
        buf.push(1);

        for value in self.values.iter().flatten() {
            buf.push(value.column_type() as u8);
            buf.push(if value.is_unsigned() { 0x80 } else { 0x00 });
        }
        for value in self.values.iter().flatten() {
            value.encode_into(buf);
        }
    }
}

/// Ordered sequence of [`Binding`] rows for batch execution.
///
/// Rows are owned here until consumed by the execution flow or cleared on
/// cancellation or failure.
#[derive(Debug)]
pub struct Bindings {
    rows: Vec<Binding>,
    param_count: usize,
    current_open: bool,
}

impl Bindings {
    /// Create an empty collection for statements with `param_count` parameters.
    pub fn new(param_count: usize) -> Self {
        Self {
            rows: Vec::new(),
            param_count,
            current_open: false,
        }
    }

    /// Number of finalized or in-progress rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no row was ever started.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The row currently being filled, creating it on first use.
    pub fn current(&mut self) -> &mut Binding {
        if !self.current_open {
            self.rows.push(Binding::new(self.param_count));
            self.current_open = true;
        }
        let last = self.rows.len() - 1;
        &mut self.rows[last]
    }

    /// Finalize the current row, validating that every position is filled.
    ///
    /// A no-op when no row is open.
    pub fn validated_finish(&mut self) -> Result<()> {
        if !self.current_open {
            return Ok(());
        }
        if let Some(row) = self.rows.last()
            && let Some(index) = row.find_unbind()
        {
            return Err(Error::BindingIncomplete { index });
        }
        self.current_open = false;
        Ok(())
    }

    /// Release every buffered value and drop all rows.
    pub fn clear(&mut self) {
        for row in &mut self.rows {
            row.clear();
        }
        self.rows.clear();
        self.current_open = false;
    }

    /// Consume the finalized rows.
    pub fn take_rows(&mut self) -> Vec<Binding> {
        self.current_open = false;
        std::mem::take(&mut self.rows)
    }
}
