//! Read-only views over decoded column values.
//!
//! A `Value` borrows from the `ResultSet` that produced it, so it cannot
//! outlive the response buffer.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::codec::Cursor;
use super::error::{CqlError, CqlResult};
use super::types::{ColumnType, Decimal, ValueType};

/// A typed view of one decoded column (or collection element).
#[derive(Debug, Clone, Copy)]
pub struct Value<'a> {
    column_type: &'a ColumnType,
    data: Option<&'a [u8]>,
}

impl<'a> Value<'a> {
    pub(crate) fn new(column_type: &'a ColumnType, data: Option<&'a [u8]>) -> Self {
        Self { column_type, data }
    }

    /// The wire tag of this value.
    #[inline]
    pub fn value_type(&self) -> ValueType {
        self.column_type.value_type()
    }

    /// The full type, including collection element types.
    #[inline]
    pub fn column_type(&self) -> &'a ColumnType {
        self.column_type
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.data.is_none()
    }

    /// Raw bytes of the value, `None` when null.
    #[inline]
    pub fn raw(&self) -> Option<&'a [u8]> {
        self.data
    }

    pub fn as_int32(&self) -> CqlResult<i32> {
        self.expect(|ty| ty == ValueType::Int, "int")?;
        Ok(i32::from_be_bytes(self.fixed()?))
    }

    /// bigint, counter and timestamp values.
    pub fn as_int64(&self) -> CqlResult<i64> {
        self.expect(ValueType::is_int64, "bigint")?;
        Ok(i64::from_be_bytes(self.fixed()?))
    }

    pub fn as_float(&self) -> CqlResult<f32> {
        self.expect(|ty| ty == ValueType::Float, "float")?;
        Ok(f32::from_bits(u32::from_be_bytes(self.fixed()?)))
    }

    pub fn as_double(&self) -> CqlResult<f64> {
        self.expect(|ty| ty == ValueType::Double, "double")?;
        Ok(f64::from_bits(u64::from_be_bytes(self.fixed()?)))
    }

    pub fn as_bool(&self) -> CqlResult<bool> {
        self.expect(|ty| ty == ValueType::Boolean, "boolean")?;
        let [b] = self.fixed::<1>()?;
        Ok(b != 0)
    }

    /// ascii, text and varchar values, borrowed without copying.
    pub fn as_str(&self) -> CqlResult<&'a str> {
        self.expect(ValueType::is_text_like, "varchar")?;
        std::str::from_utf8(self.bytes()?)
            .map_err(|e| CqlError::protocol(format!("Invalid UTF-8 in text value: {}", e)))
    }

    /// Raw bytes of any non-null value (blob, varint, custom...).
    pub fn as_bytes(&self) -> CqlResult<&'a [u8]> {
        self.bytes()
    }

    pub fn as_uuid(&self) -> CqlResult<Uuid> {
        self.expect(
            |ty| matches!(ty, ValueType::Uuid | ValueType::Timeuuid),
            "uuid",
        )?;
        Ok(Uuid::from_bytes(self.fixed()?))
    }

    pub fn as_inet(&self) -> CqlResult<IpAddr> {
        self.expect(|ty| ty == ValueType::Inet, "inet")?;
        let data = self.bytes()?;
        Cursor::new(data).read_inet(data.len())
    }

    pub fn as_decimal(&self) -> CqlResult<Decimal> {
        self.expect(|ty| ty == ValueType::Decimal, "decimal")?;
        let data = self.bytes()?;
        Cursor::new(data).read_decimal(data.len())
    }

    /// Timestamp as a UTC date time (milliseconds since the epoch on the wire).
    pub fn as_timestamp(&self) -> CqlResult<DateTime<Utc>> {
        self.expect(|ty| ty == ValueType::Timestamp, "timestamp")?;
        let millis = i64::from_be_bytes(self.fixed()?);
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| CqlError::protocol(format!("Timestamp out of range: {}", millis)))
    }

    /// Iterate the elements of a list or set, or the alternating keys and
    /// values of a map.
    pub fn collection(&self) -> CqlResult<CollectionIter<'a>> {
        let (first, second) = match self.column_type {
            ColumnType::List(elem) | ColumnType::Set(elem) => (&**elem, &**elem),
            ColumnType::Map(key, value) => (&**key, &**value),
            other => return Err(CqlError::type_mismatch("collection", other)),
        };
        let mut cursor = Cursor::new(self.bytes()?);
        let count = cursor.read_short()? as usize;
        let items = if matches!(self.column_type, ColumnType::Map(..)) {
            count * 2
        } else {
            count
        };
        Ok(CollectionIter {
            cursor,
            types: [first, second],
            remaining: items,
            index: 0,
        })
    }

    fn expect(&self, accepts: impl Fn(ValueType) -> bool, expected: &str) -> CqlResult<()> {
        let actual = self.value_type();
        if accepts(actual) {
            Ok(())
        } else {
            Err(CqlError::type_mismatch(expected, self.column_type))
        }
    }

    fn bytes(&self) -> CqlResult<&'a [u8]> {
        self.data.ok_or(CqlError::NullValue)
    }

    fn fixed<const N: usize>(&self) -> CqlResult<[u8; N]> {
        let data = self.bytes()?;
        data.try_into().map_err(|_| {
            CqlError::protocol(format!(
                "Invalid {} length: expected {}, got {}",
                self.column_type,
                N,
                data.len()
            ))
        })
    }
}

/// Iterator over the elements of an encoded collection.
///
/// Map entries are yielded key first, then value.
#[derive(Debug, Clone)]
pub struct CollectionIter<'a> {
    cursor: Cursor<'a>,
    types: [&'a ColumnType; 2],
    remaining: usize,
    index: usize,
}

impl<'a> CollectionIter<'a> {
    /// Number of items not yet yielded.
    pub fn len(&self) -> usize {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }
}

impl<'a> Iterator for CollectionIter<'a> {
    type Item = CqlResult<Value<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let ty = self.types[self.index % 2];
        self.index += 1;

        match self.cursor.read_short_bytes() {
            Ok(data) => Some(Ok(Value::new(ty, Some(data)))),
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}
