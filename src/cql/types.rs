//! CQL type identifiers and composite type descriptions.
//!
//! Type ids are the `[option]` ids of the native protocol (v2).

use std::fmt;

// ============================================================================
// Value Types
// ============================================================================

/// CQL value type tag as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ValueType {
    Custom = 0x0000,
    Ascii = 0x0001,
    BigInt = 0x0002,
    Blob = 0x0003,
    Boolean = 0x0004,
    Counter = 0x0005,
    Decimal = 0x0006,
    Double = 0x0007,
    Float = 0x0008,
    Int = 0x0009,
    Text = 0x000A,
    Timestamp = 0x000B,
    Uuid = 0x000C,
    Varchar = 0x000D,
    Varint = 0x000E,
    Timeuuid = 0x000F,
    Inet = 0x0010,
    List = 0x0020,
    Map = 0x0021,
    Set = 0x0022,
}

impl ValueType {
    /// Look up a type id, `None` for ids outside protocol v2.
    pub fn from_id(id: u16) -> Option<Self> {
        let ty = match id {
            0x0000 => ValueType::Custom,
            0x0001 => ValueType::Ascii,
            0x0002 => ValueType::BigInt,
            0x0003 => ValueType::Blob,
            0x0004 => ValueType::Boolean,
            0x0005 => ValueType::Counter,
            0x0006 => ValueType::Decimal,
            0x0007 => ValueType::Double,
            0x0008 => ValueType::Float,
            0x0009 => ValueType::Int,
            0x000A => ValueType::Text,
            0x000B => ValueType::Timestamp,
            0x000C => ValueType::Uuid,
            0x000D => ValueType::Varchar,
            0x000E => ValueType::Varint,
            0x000F => ValueType::Timeuuid,
            0x0010 => ValueType::Inet,
            0x0020 => ValueType::List,
            0x0021 => ValueType::Map,
            0x0022 => ValueType::Set,
            _ => return None,
        };
        Some(ty)
    }

    #[inline]
    pub fn id(self) -> u16 {
        self as u16
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(self, ValueType::Ascii | ValueType::Text | ValueType::Varchar)
    }

    /// Check if this is a 64-bit integer type
    pub fn is_int64(self) -> bool {
        matches!(
            self,
            ValueType::BigInt | ValueType::Counter | ValueType::Timestamp
        )
    }

    /// Check if this is a collection type
    pub fn is_collection(self) -> bool {
        matches!(self, ValueType::List | ValueType::Map | ValueType::Set)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Custom => "custom",
            ValueType::Ascii => "ascii",
            ValueType::BigInt => "bigint",
            ValueType::Blob => "blob",
            ValueType::Boolean => "boolean",
            ValueType::Counter => "counter",
            ValueType::Decimal => "decimal",
            ValueType::Double => "double",
            ValueType::Float => "float",
            ValueType::Int => "int",
            ValueType::Text => "text",
            ValueType::Timestamp => "timestamp",
            ValueType::Uuid => "uuid",
            ValueType::Varchar => "varchar",
            ValueType::Varint => "varint",
            ValueType::Timeuuid => "timeuuid",
            ValueType::Inet => "inet",
            ValueType::List => "list",
            ValueType::Map => "map",
            ValueType::Set => "set",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Column Types
// ============================================================================

/// Full type of a column, including collection element types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    /// A primitive type.
    Native(ValueType),
    /// A server-side custom type, identified by its Java class name.
    Custom(String),
    List(Box<ColumnType>),
    Set(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
}

impl ColumnType {
    /// The wire tag of this type.
    pub fn value_type(&self) -> ValueType {
        match self {
            ColumnType::Native(ty) => *ty,
            ColumnType::Custom(_) => ValueType::Custom,
            ColumnType::List(_) => ValueType::List,
            ColumnType::Set(_) => ValueType::Set,
            ColumnType::Map(_, _) => ValueType::Map,
        }
    }
}

impl From<ValueType> for ColumnType {
    fn from(ty: ValueType) -> Self {
        ColumnType::Native(ty)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Native(ty) => write!(f, "{}", ty),
            ColumnType::Custom(class) => write!(f, "'{}'", class),
            ColumnType::List(elem) => write!(f, "list<{}>", elem),
            ColumnType::Set(elem) => write!(f, "set<{}>", elem),
            ColumnType::Map(key, value) => write!(f, "map<{}, {}>", key, value),
        }
    }
}

// ============================================================================
// Decimal
// ============================================================================

/// An arbitrary precision decimal: `unscaled * 10^-scale`.
///
/// The unscaled value is a two's complement big-endian varint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decimal {
    pub scale: i32,
    pub unscaled: Vec<u8>,
}

impl Decimal {
    pub fn new(scale: i32, unscaled: impl Into<Vec<u8>>) -> Self {
        Self {
            scale,
            unscaled: unscaled.into(),
        }
    }

    /// Build from an `i64` unscaled value using the minimal varint encoding.
    pub fn from_i64(unscaled: i64, scale: i32) -> Self {
        Self::new(scale, varint_from_i64(unscaled))
    }
}

/// Minimal two's complement big-endian encoding of an `i64`.
pub fn varint_from_i64(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let b = bytes[start];
        let next_sign = bytes[start + 1] & 0x80;
        if (b == 0x00 && next_sign == 0) || (b == 0xFF && next_sign != 0) {
            start += 1;
        } else {
            break;
        }
    }
    bytes[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_ids() {
        assert_eq!(ValueType::from_id(0x0009), Some(ValueType::Int));
        assert_eq!(ValueType::from_id(0x0021), Some(ValueType::Map));
        assert_eq!(ValueType::from_id(0x0030), None);
        assert_eq!(ValueType::Varchar.id(), 0x000D);
    }

    #[test]
    fn test_value_type_classification() {
        assert!(ValueType::Varchar.is_text_like());
        assert!(ValueType::Ascii.is_text_like());
        assert!(!ValueType::Blob.is_text_like());

        assert!(ValueType::Counter.is_int64());
        assert!(ValueType::Timestamp.is_int64());
        assert!(!ValueType::Int.is_int64());

        assert!(ValueType::Set.is_collection());
        assert!(!ValueType::Uuid.is_collection());
    }

    #[test]
    fn test_column_type_display() {
        let ty = ColumnType::Map(
            Box::new(ValueType::Varchar.into()),
            Box::new(ColumnType::List(Box::new(ValueType::Int.into()))),
        );
        assert_eq!(ty.to_string(), "map<varchar, list<int>>");
        assert_eq!(ty.value_type(), ValueType::Map);
    }

    #[test]
    fn test_varint_minimal_encoding() {
        assert_eq!(varint_from_i64(0), vec![0x00]);
        assert_eq!(varint_from_i64(127), vec![0x7F]);
        assert_eq!(varint_from_i64(128), vec![0x00, 0x80]);
        assert_eq!(varint_from_i64(-1), vec![0xFF]);
        assert_eq!(varint_from_i64(-129), vec![0xFF, 0x7F]);
        assert_eq!(varint_from_i64(i64::MIN).len(), 8);
    }
}
