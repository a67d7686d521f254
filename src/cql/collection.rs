//! Collection values (list, set, map) built element by element.
//!
//! Elements are encoded as they are appended using the protocol v2 layout:
//! each element is `[short length][bytes]`, and the finished value is the
//! element count followed by the accumulated buffer.

use std::net::IpAddr;

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::codec::{self, MAX_SHORT_LENGTH};
use super::error::{CqlError, CqlResult};
use super::types::Decimal;

/// Rough per-element size used to pre-size the buffer.
const ESTIMATED_ELEMENT_SIZE: usize = 16;

/// Upper bound on the initial buffer, whatever count is declared.
const MAX_INITIAL_CAPACITY: usize = MAX_SHORT_LENGTH;

/// A list, set or map value under construction.
///
/// The element count passed to `new` is a capacity hint only; appending
/// past it simply grows the buffer.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    buffer: BytesMut,
    element_count: usize,
    appended: usize,
}

impl Collection {
    /// Create a collection expecting roughly `element_count` elements.
    /// For a map, keys and values each count as an element.
    pub fn new(element_count: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(
                element_count
                    .saturating_mul(ESTIMATED_ELEMENT_SIZE)
                    .min(MAX_INITIAL_CAPACITY),
            ),
            element_count,
            appended: 0,
        }
    }

    /// The element count declared at construction.
    pub fn declared_count(&self) -> usize {
        self.element_count
    }

    /// Number of elements appended so far.
    pub fn len(&self) -> usize {
        self.appended
    }

    pub fn is_empty(&self) -> bool {
        self.appended == 0
    }

    /// Append raw element bytes (blob, varint, or any pre-encoded value).
    pub fn append(&mut self, bytes: &[u8]) -> CqlResult<()> {
        if bytes.len() > MAX_SHORT_LENGTH {
            return Err(CqlError::protocol(format!(
                "Collection element of {} bytes exceeds the element size limit",
                bytes.len()
            )));
        }
        self.buffer.put_u16(bytes.len() as u16);
        self.buffer.put_slice(bytes);
        self.appended += 1;
        Ok(())
    }

    pub fn append_int32(&mut self, value: i32) -> CqlResult<()> {
        self.append(&value.to_be_bytes())
    }

    pub fn append_int64(&mut self, value: i64) -> CqlResult<()> {
        self.append(&value.to_be_bytes())
    }

    pub fn append_float(&mut self, value: f32) -> CqlResult<()> {
        self.append(&value.to_bits().to_be_bytes())
    }

    pub fn append_double(&mut self, value: f64) -> CqlResult<()> {
        self.append(&value.to_bits().to_be_bytes())
    }

    pub fn append_bool(&mut self, value: bool) -> CqlResult<()> {
        self.append(&[value as u8])
    }

    pub fn append_string(&mut self, value: &str) -> CqlResult<()> {
        self.append(value.as_bytes())
    }

    pub fn append_uuid(&mut self, value: &Uuid) -> CqlResult<()> {
        self.append(value.as_bytes())
    }

    pub fn append_inet(&mut self, addr: &IpAddr) -> CqlResult<()> {
        let mut buf = BytesMut::with_capacity(16);
        codec::encode_inet(&mut buf, addr);
        self.append(&buf)
    }

    pub fn append_decimal(&mut self, value: &Decimal) -> CqlResult<()> {
        let mut buf = BytesMut::with_capacity(4 + value.unscaled.len());
        codec::encode_decimal(&mut buf, value);
        self.append(&buf)
    }

    /// Serialize as a bound value: `[short count][elements]`.
    ///
    /// For maps the count is the number of key/value pairs.
    pub fn encode(&self, is_map: bool) -> CqlResult<Bytes> {
        let count = if is_map {
            if self.appended % 2 != 0 {
                return Err(CqlError::protocol(format!(
                    "Map collection has an odd number of elements: {}",
                    self.appended
                )));
            }
            self.appended / 2
        } else {
            self.appended
        };
        if count > MAX_SHORT_LENGTH {
            return Err(CqlError::protocol(format!(
                "Collection of {} elements exceeds the element count limit",
                count
            )));
        }

        let mut out = BytesMut::with_capacity(2 + self.buffer.len());
        codec::encode_short(&mut out, count as u16);
        out.put_slice(&self.buffer);
        Ok(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cql::types::{ColumnType, ValueType};
    use crate::cql::value::Value;

    #[test]
    fn test_empty_collection_encodes_zero_count() {
        let collection = Collection::new(4);
        assert!(collection.is_empty());
        assert_eq!(&collection.encode(false).unwrap()[..], &[0, 0]);
    }

    #[test]
    fn test_huge_declared_count_is_only_a_hint() {
        let mut list = Collection::new(usize::MAX);
        assert_eq!(list.declared_count(), usize::MAX);

        list.append_int32(7).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(&list.encode(false).unwrap()[..], &[0, 1, 0, 4, 0, 0, 0, 7]);
    }

    #[test]
    fn test_list_encoding_layout() {
        let mut list = Collection::new(2);
        list.append_int32(1).unwrap();
        list.append_int32(2).unwrap();

        let encoded = list.encode(false).unwrap();
        assert_eq!(
            &encoded[..],
            &[0, 2, 0, 4, 0, 0, 0, 1, 0, 4, 0, 0, 0, 2]
        );
    }

    #[test]
    fn test_declared_count_is_not_a_cap() {
        let mut list = Collection::new(1);
        for i in 0..5 {
            list.append_int64(i).unwrap();
        }
        assert_eq!(list.declared_count(), 1);
        assert_eq!(list.len(), 5);
        assert_eq!(list.encode(false).unwrap()[1], 5);
    }

    #[test]
    fn test_map_counts_pairs() {
        let mut map = Collection::new(4);
        map.append_string("a").unwrap();
        map.append_int32(1).unwrap();
        map.append_string("b").unwrap();
        map.append_int32(2).unwrap();

        let encoded = map.encode(true).unwrap();
        assert_eq!(&encoded[..2], &[0, 2]);

        let ty = ColumnType::Map(
            Box::new(ValueType::Varchar.into()),
            Box::new(ValueType::Int.into()),
        );
        let value = Value::new(&ty, Some(&encoded[..]));
        let items: Vec<_> = value.collection().unwrap().map(|v| v.unwrap()).collect();
        assert_eq!(items[0].as_str().unwrap(), "a");
        assert_eq!(items[3].as_int32().unwrap(), 2);
    }

    #[test]
    fn test_odd_map_is_rejected() {
        let mut map = Collection::new(2);
        map.append_string("lonely key").unwrap();
        assert!(map.encode(true).is_err());
    }

    #[test]
    fn test_mixed_appends_read_back() {
        let mut set = Collection::new(3);
        set.append_inet(&"10.1.2.3".parse().unwrap()).unwrap();
        set.append_inet(&"::1".parse().unwrap()).unwrap();

        let encoded = set.encode(false).unwrap();
        let ty = ColumnType::Set(Box::new(ValueType::Inet.into()));
        let value = Value::new(&ty, Some(&encoded[..]));
        let addrs: Vec<IpAddr> = value
            .collection()
            .unwrap()
            .map(|v| v.unwrap().as_inet().unwrap())
            .collect();

        assert_eq!(addrs[0], "10.1.2.3".parse::<IpAddr>().unwrap());
        assert!(addrs[1].is_loopback());
    }
}
