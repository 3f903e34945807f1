// used for persistence
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};

// used to print out readable forms of a data type
use std::fmt;

use crate::error::{Result, VantageError};

/// The closed set of kinds a named value can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueType {
    Integer32,
    Integer64,
    Double,
    String,
}

impl ValueType {
    pub const ALL: [ValueType; 4] = [
        ValueType::Integer32,
        ValueType::Integer64,
        ValueType::Double,
        ValueType::String,
    ];

    /// One-byte tag used on the wire.
    pub fn tag(&self) -> u8 {
        match self {
            ValueType::Integer32 => 1,
            ValueType::Integer64 => 2,
            ValueType::Double => 3,
            ValueType::String => 4,
        }
    }
    pub fn from_tag(tag: u8) -> Result<ValueType> {
        match tag {
            1 => Ok(ValueType::Integer32),
            2 => Ok(ValueType::Integer64),
            3 => Ok(ValueType::Double),
            4 => Ok(ValueType::String),
            other => Err(VantageError::Decode(format!("unknown value type tag {other}"))),
        }
    }
    /// Name stored in the observation tables.
    pub fn name(&self) -> &'static str {
        match self {
            ValueType::Integer32 => "INTEGER32",
            ValueType::Integer64 => "INTEGER64",
            ValueType::Double => "DOUBLE",
            ValueType::String => "STRING",
        }
    }
    pub fn from_name(name: &str) -> Option<ValueType> {
        ValueType::ALL.into_iter().find(|t| t.name() == name)
    }
    /// Turns a caller supplied literal into a typed value, checking range.
    pub fn coerce(&self, scalar: Scalar) -> Result<Value> {
        match (self, scalar) {
            (ValueType::Integer32, Scalar::Integer(i)) => i32::try_from(i)
                .map(Value::Integer32)
                .map_err(|_| VantageError::ValueRange {
                    value_type: *self,
                    value: i.to_string(),
                }),
            (ValueType::Integer64, Scalar::Integer(i)) => Ok(Value::Integer64(i)),
            (ValueType::Double, Scalar::Float(d)) => Ok(Value::Double(d)),
            (ValueType::Double, Scalar::Integer(i)) => Ok(Value::Double(i as f64)),
            (ValueType::String, Scalar::Text(s)) => Ok(Value::String(s)),
            (expected, scalar) => Err(VantageError::ValueKind {
                expected: *expected,
                found: scalar.kind(),
            }),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// An untyped literal as handed to `pack`. The requested [`ValueType`]
/// decides how it is stored.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    fn kind(&self) -> &'static str {
        match self {
            Scalar::Integer(_) => "integer",
            Scalar::Float(_) => "float",
            Scalar::Text(_) => "text",
        }
    }
}

impl From<i32> for Scalar {
    fn from(i: i32) -> Self {
        Scalar::Integer(i as i64)
    }
}
impl From<i64> for Scalar {
    fn from(i: i64) -> Self {
        Scalar::Integer(i)
    }
}
impl From<u32> for Scalar {
    fn from(i: u32) -> Self {
        Scalar::Integer(i as i64)
    }
}
impl From<f64> for Scalar {
    fn from(d: f64) -> Self {
        Scalar::Float(d)
    }
}
impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Text(s.to_owned())
    }
}
impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Text(s)
    }
}

// ------------- Value --------------
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer32(i32),
    Integer64(i64),
    Double(f64),
    String(String),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Integer32(_) => ValueType::Integer32,
            Value::Integer64(_) => ValueType::Integer64,
            Value::Double(_) => ValueType::Double,
            Value::String(_) => ValueType::String,
        }
    }
    /// Bitwise equality, so that NaN payloads compare equal to themselves.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Integer32(i) => write!(f, "{}", i),
            Value::Integer64(l) => write!(f, "{}", l),
            Value::Double(d) => write!(f, "{}", d),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Integer32(i) => ToSqlOutput::from(*i),
            Value::Integer64(l) => ToSqlOutput::from(*l),
            Value::Double(d) => ToSqlOutput::from(*d),
            Value::String(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

impl ToSql for ValueType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.name()))
    }
}
impl FromSql for ValueType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let name = value.as_str()?;
        ValueType::from_name(name).ok_or_else(|| FromSqlError::Other(format!("unknown value type {name}").into()))
    }
}

// ------------- Codec --------------
/// Encodes a typed value into its fixed wire representation.
///
/// Integers and doubles are little-endian fixed width. Strings are a `u32`
/// byte length followed by the raw bytes, so embedded NULs survive.
pub fn encode(value_type: ValueType, value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(encoded_len(value));
    encode_into(value_type, value, &mut out)?;
    Ok(out)
}

pub fn encode_into(value_type: ValueType, value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match (value_type, value) {
        (ValueType::Integer32, Value::Integer32(i)) => out.extend_from_slice(&i.to_le_bytes()),
        (ValueType::Integer64, Value::Integer64(l)) => out.extend_from_slice(&l.to_le_bytes()),
        (ValueType::Double, Value::Double(d)) => out.extend_from_slice(&d.to_bits().to_le_bytes()),
        (ValueType::String, Value::String(s)) => encode_str(s, out)?,
        (expected, value) => {
            return Err(VantageError::ValueKind {
                expected,
                found: value.value_type().name(),
            });
        }
    }
    Ok(())
}

/// Exact inverse of [`encode`]; the whole buffer must be consumed.
pub fn decode(bytes: &[u8], value_type: ValueType) -> Result<Value> {
    let mut reader = Reader::new(bytes);
    let value = reader.value(value_type)?;
    reader.finish()?;
    Ok(value)
}

pub(crate) fn encode_str(s: &str, out: &mut Vec<u8>) -> Result<()> {
    let len = u32::try_from(s.len()).map_err(|_| VantageError::ValueRange {
        value_type: ValueType::String,
        value: format!("{} bytes", s.len()),
    })?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn encoded_len(value: &Value) -> usize {
    match value {
        Value::Integer32(_) => 4,
        Value::Integer64(_) | Value::Double(_) => 8,
        Value::String(s) => 4 + s.len(),
    }
}

/// Cursor over a byte slice, shared by the value codec and message framing.
pub(crate) struct Reader<'b> {
    bytes: &'b [u8],
    position: usize,
}

impl<'b> Reader<'b> {
    pub(crate) fn new(bytes: &'b [u8]) -> Self {
        Self { bytes, position: 0 }
    }
    pub(crate) fn take(&mut self, n: usize) -> Result<&'b [u8]> {
        let end = self
            .position
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                VantageError::Decode(format!(
                    "needed {} bytes at offset {}, only {} available",
                    n,
                    self.position,
                    self.bytes.len() - self.position
                ))
            })?;
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }
    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }
    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }
    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }
    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }
    pub(crate) fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }
    pub(crate) fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }
    pub(crate) fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(u64::from_le_bytes(self.array()?)))
    }
    pub(crate) fn bytes(&mut self) -> Result<&'b [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }
    pub(crate) fn string(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|e| VantageError::Decode(format!("invalid UTF-8 in string: {e}")))
    }
    pub(crate) fn value(&mut self, value_type: ValueType) -> Result<Value> {
        Ok(match value_type {
            ValueType::Integer32 => Value::Integer32(self.i32()?),
            ValueType::Integer64 => Value::Integer64(self.i64()?),
            ValueType::Double => Value::Double(self.f64()?),
            ValueType::String => Value::String(self.string()?),
        })
    }
    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }
    pub(crate) fn finish(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(VantageError::Decode(format!("{n} trailing bytes"))),
        }
    }
}
