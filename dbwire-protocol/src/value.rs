//! Column types, values and the binary row codec.
//!
//! Row payload layout: for every column, a 4-byte little-endian field
//! length followed by the field bytes. A length of `0xFFFF_FFFF` encodes
//! NULL and carries no bytes.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Field length marking a NULL value.
pub const NULL_FIELD: u32 = u32::MAX;

/// Declared type of a result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Sint,
    Uint,
    Double,
    Float,
    Bool,
    Bytes,
    String,
    /// JSON text; document collections return a single column of this type.
    Json,
}

impl ColumnType {
    /// Fixed byte width of the type, if any.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            ColumnType::Sint | ColumnType::Uint | ColumnType::Double => Some(8),
            ColumnType::Float => Some(4),
            ColumnType::Bool => Some(1),
            ColumnType::Bytes | ColumnType::String | ColumnType::Json => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ColumnType::Sint => "sint",
            ColumnType::Uint => "uint",
            ColumnType::Double => "double",
            ColumnType::Float => "float",
            ColumnType::Bool => "bool",
            ColumnType::Bytes => "bytes",
            ColumnType::String => "string",
            ColumnType::Json => "json",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed value, used both for bound parameters and decoded row fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Sint(i64),
    Uint(u64),
    Double(f64),
    Float(f32),
    String(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Sint(v) => Some(v),
            Value::Uint(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Uint(v) => Some(v),
            Value::Sint(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Double(v) => Some(v),
            Value::Float(v) => Some(v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Encodes the value as row field bytes (`None` for NULL).
    pub fn to_field(&self) -> Option<Vec<u8>> {
        match self {
            Value::Null => None,
            Value::Bool(v) => Some(vec![*v as u8]),
            Value::Sint(v) => Some(v.to_le_bytes().to_vec()),
            Value::Uint(v) => Some(v.to_le_bytes().to_vec()),
            Value::Double(v) => Some(v.to_le_bytes().to_vec()),
            Value::Float(v) => Some(v.to_le_bytes().to_vec()),
            Value::String(s) => Some(s.as_bytes().to_vec()),
            Value::Bytes(b) => Some(b.clone()),
            // serializing a serde_json::Value cannot fail
            Value::Json(v) => Some(v.to_string().into_bytes()),
        }
    }

    /// Decodes a field of the declared column type.
    pub fn decode(
        column: usize,
        column_type: ColumnType,
        field: Option<&[u8]>,
    ) -> Result<Value, ProtocolError> {
        let Some(bytes) = field else {
            return Ok(Value::Null);
        };

        let fail = |reason: String| ProtocolError::ValueDecode {
            column,
            column_type: column_type.to_string(),
            reason,
        };

        if let Some(width) = column_type.fixed_width() {
            if bytes.len() != width {
                return Err(fail(format!(
                    "expected {} bytes, got {}",
                    width,
                    bytes.len()
                )));
            }
        }

        let value = match column_type {
            ColumnType::Sint => Value::Sint(i64::from_le_bytes(fixed(bytes))),
            ColumnType::Uint => Value::Uint(u64::from_le_bytes(fixed(bytes))),
            ColumnType::Double => Value::Double(f64::from_le_bytes(fixed(bytes))),
            ColumnType::Float => Value::Float(f32::from_le_bytes(fixed(bytes))),
            ColumnType::Bool => match bytes[0] {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => return Err(fail(format!("invalid boolean byte {:#04x}", other))),
            },
            ColumnType::Bytes => Value::Bytes(bytes.to_vec()),
            ColumnType::String => Value::String(
                std::str::from_utf8(bytes)
                    .map_err(|_| fail("invalid UTF-8".to_string()))?
                    .to_string(),
            ),
            ColumnType::Json => Value::Json(
                serde_json::from_slice(bytes).map_err(|e| fail(e.to_string()))?,
            ),
        };
        Ok(value)
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Sint(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Sint(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Encodes a row payload from values.
pub fn encode_row(values: &[Value]) -> Bytes {
    let mut buf = BytesMut::new();
    for value in values {
        match value.to_field() {
            None => buf.put_u32_le(NULL_FIELD),
            Some(bytes) => {
                buf.put_u32_le(bytes.len() as u32);
                buf.put_slice(&bytes);
            }
        }
    }
    buf.freeze()
}

/// Splits a row payload into raw fields without interpreting them.
///
/// Fails with [`ProtocolError::MalformedRow`] when a field overruns the
/// payload or the field count differs from `columns`.
pub fn split_row(payload: &Bytes, columns: usize) -> Result<Vec<Option<Bytes>>, ProtocolError> {
    let mut fields = Vec::with_capacity(columns);
    let mut cursor = payload.clone();

    while cursor.has_remaining() {
        if cursor.remaining() < 4 {
            return Err(ProtocolError::MalformedRow(format!(
                "truncated field header after {} fields",
                fields.len()
            )));
        }
        let len = cursor.get_u32_le();
        if len == NULL_FIELD {
            fields.push(None);
            continue;
        }
        let len = len as usize;
        if len > cursor.remaining() {
            return Err(ProtocolError::MalformedRow(format!(
                "field {} declares {} bytes, only {} remain",
                fields.len(),
                len,
                cursor.remaining()
            )));
        }
        fields.push(Some(cursor.split_to(len)));
    }

    if fields.len() != columns {
        return Err(ProtocolError::MalformedRow(format!(
            "expected {} fields, got {}",
            columns,
            fields.len()
        )));
    }
    Ok(fields)
}
