//! Primitive encoding and decoding for the CQL native protocol.
//!
//! Encoders append to a `BytesMut` in network byte order. Decoding goes
//! through `Cursor`, which tracks its position and refuses to read past the
//! end of its slice.
//! Reference: https://github.com/apache/cassandra/blob/cassandra-2.0/doc/native_protocol_v2.spec

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use super::error::{CqlError, CqlResult};
use super::types::{ColumnType, Decimal, ValueType};

/// Largest payload of a `[string]` or `[short bytes]`.
pub const MAX_SHORT_LENGTH: usize = u16::MAX as usize;

/// Deepest collection nesting accepted in an `[option]`.
pub const MAX_TYPE_DEPTH: usize = 16;

// ============================================================================
// Encoding
// ============================================================================

#[inline]
pub fn encode_byte(buf: &mut BytesMut, value: u8) {
    buf.put_u8(value);
}

#[inline]
pub fn encode_short(buf: &mut BytesMut, value: u16) {
    buf.put_u16(value);
}

#[inline]
pub fn encode_int(buf: &mut BytesMut, value: i32) {
    buf.put_i32(value);
}

#[inline]
pub fn encode_long(buf: &mut BytesMut, value: i64) {
    buf.put_i64(value);
}

/// IEEE-754 float, written as the bits of an int.
#[inline]
pub fn encode_float(buf: &mut BytesMut, value: f32) {
    buf.put_i32(value.to_bits() as i32);
}

/// IEEE-754 double, written as the bits of a long.
#[inline]
pub fn encode_double(buf: &mut BytesMut, value: f64) {
    buf.put_i64(value.to_bits() as i64);
}

/// `[string]`: u16 length followed by UTF-8 bytes.
pub fn encode_string(buf: &mut BytesMut, value: &str) -> CqlResult<()> {
    encode_short_bytes(buf, value.as_bytes())
}

/// `[long string]`: i32 length followed by UTF-8 bytes.
pub fn encode_long_string(buf: &mut BytesMut, value: &str) {
    buf.put_i32(value.len() as i32);
    buf.put_slice(value.as_bytes());
}

/// `[bytes]`: i32 length followed by the bytes, length -1 for null.
pub fn encode_bytes(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(data) => {
            buf.put_i32(data.len() as i32);
            buf.put_slice(data);
        }
        None => buf.put_i32(-1),
    }
}

/// `[short bytes]`: u16 length followed by the bytes.
pub fn encode_short_bytes(buf: &mut BytesMut, value: &[u8]) -> CqlResult<()> {
    if value.len() > MAX_SHORT_LENGTH {
        return Err(CqlError::protocol(format!(
            "Value of {} bytes exceeds the short length limit",
            value.len()
        )));
    }
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
    Ok(())
}

/// A `[short]` element count, rejecting counts that do not fit.
pub fn encode_count(buf: &mut BytesMut, count: usize, what: &str) -> CqlResult<()> {
    if count > MAX_SHORT_LENGTH {
        return Err(CqlError::protocol(format!(
            "{} of {} entries exceeds the short count limit",
            what, count
        )));
    }
    buf.put_u16(count as u16);
    Ok(())
}

/// `[string list]`
pub fn encode_string_list<S: AsRef<str>>(buf: &mut BytesMut, list: &[S]) -> CqlResult<()> {
    encode_count(buf, list.len(), "String list")?;
    for item in list {
        encode_string(buf, item.as_ref())?;
    }
    Ok(())
}

/// `[string map]`, written in key order.
pub fn encode_string_map(buf: &mut BytesMut, map: &BTreeMap<String, String>) -> CqlResult<()> {
    encode_count(buf, map.len(), "String map")?;
    for (key, value) in map {
        encode_string(buf, key)?;
        encode_string(buf, value)?;
    }
    Ok(())
}

/// `[string multimap]`, written in key order.
pub fn encode_string_multimap(
    buf: &mut BytesMut,
    map: &BTreeMap<String, Vec<String>>,
) -> CqlResult<()> {
    encode_count(buf, map.len(), "String multimap")?;
    for (key, values) in map {
        encode_string(buf, key)?;
        encode_string_list(buf, values)?;
    }
    Ok(())
}

#[inline]
pub fn encode_uuid(buf: &mut BytesMut, value: &Uuid) {
    buf.put_slice(value.as_bytes());
}

/// Raw address bytes: 4 for IPv4, 16 for IPv6.
pub fn encode_inet(buf: &mut BytesMut, addr: &IpAddr) {
    match addr {
        IpAddr::V4(v4) => buf.put_slice(&v4.octets()),
        IpAddr::V6(v6) => buf.put_slice(&v6.octets()),
    }
}

/// `[inet]`: address size byte, address bytes, i32 port.
pub fn encode_inet_with_port(buf: &mut BytesMut, addr: &SocketAddr) {
    let ip = addr.ip();
    buf.put_u8(if ip.is_ipv4() { 4 } else { 16 });
    encode_inet(buf, &ip);
    buf.put_i32(addr.port() as i32);
}

/// i32 scale followed by the big-endian varint magnitude.
pub fn encode_decimal(buf: &mut BytesMut, value: &Decimal) {
    buf.put_i32(value.scale);
    buf.put_slice(&value.unscaled);
}

// ============================================================================
// Decoding
// ============================================================================

/// Bounds-checked read position over a borrowed buffer.
///
/// Every read either consumes exactly the bytes it decodes or fails with
/// `CqlError::Truncated` and leaves the position untouched.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current offset from the start of the buffer.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Unread part of the buffer.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Take the next `n` bytes.
    pub fn take(&mut self, n: usize) -> CqlResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CqlError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> CqlResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_byte(&mut self) -> CqlResult<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_short(&mut self) -> CqlResult<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn read_int(&mut self) -> CqlResult<i32> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_long(&mut self) -> CqlResult<i64> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn read_float(&mut self) -> CqlResult<f32> {
        Ok(f32::from_bits(self.read_int()? as u32))
    }

    pub fn read_double(&mut self) -> CqlResult<f64> {
        Ok(f64::from_bits(self.read_long()? as u64))
    }

    /// `[string]`
    pub fn read_string(&mut self) -> CqlResult<&'a str> {
        let start = self.pos;
        let len = self.read_short()? as usize;
        let data = self.take(len).inspect_err(|_| self.pos = start)?;
        utf8(data).inspect_err(|_| self.pos = start)
    }

    /// `[long string]`
    pub fn read_long_string(&mut self) -> CqlResult<&'a str> {
        let start = self.pos;
        let len = self.read_int()?;
        if len < 0 {
            self.pos = start;
            return Err(CqlError::protocol(format!(
                "Negative long string length: {}",
                len
            )));
        }
        let data = self.take(len as usize).inspect_err(|_| self.pos = start)?;
        utf8(data).inspect_err(|_| self.pos = start)
    }

    /// `[bytes]`, `None` for a negative length.
    pub fn read_bytes(&mut self) -> CqlResult<Option<&'a [u8]>> {
        let start = self.pos;
        let len = self.read_int()?;
        if len < 0 {
            return Ok(None);
        }
        self.take(len as usize)
            .map(Some)
            .inspect_err(|_| self.pos = start)
    }

    /// `[short bytes]`
    pub fn read_short_bytes(&mut self) -> CqlResult<&'a [u8]> {
        let start = self.pos;
        let len = self.read_short()? as usize;
        self.take(len).inspect_err(|_| self.pos = start)
    }

    /// `[string list]`
    pub fn read_string_list(&mut self) -> CqlResult<Vec<String>> {
        let start = self.pos;
        self.rewind_on_err(start, |cur| {
            let len = cur.read_short()? as usize;
            let mut list = Vec::with_capacity(len.min(cur.remaining() / 2));
            for _ in 0..len {
                list.push(cur.read_string()?.to_owned());
            }
            Ok(list)
        })
    }

    /// `[string map]`. Keys are ordered, wire order does not matter.
    pub fn read_string_map(&mut self) -> CqlResult<BTreeMap<String, String>> {
        let start = self.pos;
        self.rewind_on_err(start, |cur| {
            let len = cur.read_short()?;
            let mut map = BTreeMap::new();
            for _ in 0..len {
                let key = cur.read_string()?.to_owned();
                let value = cur.read_string()?.to_owned();
                map.insert(key, value);
            }
            Ok(map)
        })
    }

    /// `[string multimap]`
    pub fn read_string_multimap(&mut self) -> CqlResult<BTreeMap<String, Vec<String>>> {
        let start = self.pos;
        self.rewind_on_err(start, |cur| {
            let len = cur.read_short()?;
            let mut map = BTreeMap::new();
            for _ in 0..len {
                let key = cur.read_string()?.to_owned();
                let values = cur.read_string_list()?;
                map.insert(key, values);
            }
            Ok(map)
        })
    }

    pub fn read_uuid(&mut self) -> CqlResult<Uuid> {
        Ok(Uuid::from_bytes(self.take_array()?))
    }

    /// Raw address of `len` bytes (4 or 16).
    pub fn read_inet(&mut self, len: usize) -> CqlResult<IpAddr> {
        match len {
            4 => Ok(IpAddr::V4(Ipv4Addr::from(self.take_array::<4>()?))),
            16 => Ok(IpAddr::V6(Ipv6Addr::from(self.take_array::<16>()?))),
            _ => Err(CqlError::protocol(format!(
                "Invalid inet address length: {}",
                len
            ))),
        }
    }

    /// `[inet]`: size byte, address, i32 port.
    pub fn read_inet_with_port(&mut self) -> CqlResult<SocketAddr> {
        let start = self.pos;
        self.rewind_on_err(start, |cur| {
            let size = cur.read_byte()? as usize;
            let ip = cur.read_inet(size)?;
            let port = cur.read_int()?;
            Ok(SocketAddr::new(ip, port as u16))
        })
    }

    /// Decimal spanning `len` bytes: i32 scale plus varint magnitude.
    pub fn read_decimal(&mut self, len: usize) -> CqlResult<Decimal> {
        if len < 4 {
            return Err(CqlError::protocol(format!(
                "Decimal of {} bytes is too short",
                len
            )));
        }
        let data = self.take(len)?;
        let scale = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        Ok(Decimal::new(scale, &data[4..]))
    }

    /// `[option]` describing a column type, recursing into collections.
    ///
    /// Nesting deeper than `MAX_TYPE_DEPTH` is rejected.
    pub fn read_option(&mut self) -> CqlResult<ColumnType> {
        let start = self.pos;
        self.rewind_on_err(start, |cur| cur.read_option_at(0))
    }

    fn read_option_at(&mut self, depth: usize) -> CqlResult<ColumnType> {
        if depth >= MAX_TYPE_DEPTH {
            return Err(CqlError::protocol(format!(
                "Type nesting exceeds {} levels",
                MAX_TYPE_DEPTH
            )));
        }
        let id = self.read_short()?;
        let ty = ValueType::from_id(id)
            .ok_or_else(|| CqlError::protocol(format!("Unknown type id: {:#06x}", id)))?;
        let column_type = match ty {
            ValueType::Custom => ColumnType::Custom(self.read_string()?.to_owned()),
            ValueType::List => ColumnType::List(Box::new(self.read_option_at(depth + 1)?)),
            ValueType::Set => ColumnType::Set(Box::new(self.read_option_at(depth + 1)?)),
            ValueType::Map => {
                let key = self.read_option_at(depth + 1)?;
                let value = self.read_option_at(depth + 1)?;
                ColumnType::Map(Box::new(key), Box::new(value))
            }
            native => ColumnType::Native(native),
        };
        Ok(column_type)
    }

    fn rewind_on_err<T>(
        &mut self,
        start: usize,
        f: impl FnOnce(&mut Self) -> CqlResult<T>,
    ) -> CqlResult<T> {
        let result = f(self);
        if result.is_err() {
            self.pos = start;
        }
        result
    }
}

fn utf8(data: &[u8]) -> CqlResult<&str> {
    std::str::from_utf8(data).map_err(|e| CqlError::protocol(format!("Invalid UTF-8: {}", e)))
}

/// `[option]` encoding, used when building result metadata.
pub fn encode_option(buf: &mut BytesMut, ty: &ColumnType) -> CqlResult<()> {
    buf.put_u16(ty.value_type().id());
    match ty {
        ColumnType::Native(_) => {}
        ColumnType::Custom(class) => encode_string(buf, class)?,
        ColumnType::List(elem) | ColumnType::Set(elem) => encode_option(buf, elem)?,
        ColumnType::Map(key, value) => {
            encode_option(buf, key)?;
            encode_option(buf, value)?;
        }
    }
    Ok(())
}
