//! Statements, batches and prepared statement management.
//!
//! This module provides:
//! - `Statement`: an ad-hoc query or a bound prepared statement with
//!   positional parameter slots
//! - `BatchStatement`: several statements sent in one BATCH frame
//! - `Prepared`: a statement parsed by the server, shared via `Arc`
//! - `StatementCache`: O(1) LRU cache of prepared statements per session

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use lru::LruCache;
use uuid::Uuid;

use super::codec;
use super::collection::Collection;
use super::error::{CqlError, CqlResult};
use super::protocol::{
    BatchEntry, BatchMessage, BatchQuery, EncodedRequest, ExecuteMessage, FrontendMessage,
    QueryMessage, QueryParameters,
};
use super::result::{PreparedMetadata, SharedColumns};
use super::types::{varint_from_i64, Decimal, ValueType};

pub use super::protocol::{BatchType, Consistency};

// ============================================================================
// Prepared Statement
// ============================================================================

/// A statement that has been parsed by the server.
///
/// Immutable and shared: every bound statement created from it holds an
/// `Arc` to the same value.
#[derive(Debug, Clone)]
pub struct Prepared {
    /// Server-assigned id sent with EXECUTE
    pub id: Bytes,
    /// The CQL query text
    pub query: String,
    /// Bind variable descriptions, in marker order
    pub variables: SharedColumns,
    /// Result column descriptions, empty for statements returning no rows
    pub result_columns: SharedColumns,
}

impl Prepared {
    pub fn new(query: impl Into<String>, metadata: PreparedMetadata) -> Self {
        Self {
            id: metadata.id,
            query: query.into(),
            variables: metadata.variables,
            result_columns: metadata.result_columns,
        }
    }

    /// Number of bind markers in the query.
    pub fn parameter_count(&self) -> usize {
        self.variables.len()
    }

    /// Create a bound statement with one slot per bind variable.
    pub fn bind(self: Arc<Self>, consistency: Consistency) -> Statement {
        let count = self.parameter_count();
        Statement::bound(self, count, consistency)
    }
}

// ============================================================================
// Statement
// ============================================================================

/// State of one positional parameter slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Unset,
    Null,
    Set(Bytes),
}

#[derive(Debug, Clone)]
pub enum StatementKind {
    /// Ad-hoc query text, sent with QUERY.
    Query(String),
    /// A prepared statement, sent with EXECUTE.
    Bound(Arc<Prepared>),
}

/// A query or bound prepared statement with its parameter slots.
///
/// Binding is synchronous and never touches the network. Every slot must
/// be bound (possibly to null) before the statement is executed.
#[derive(Debug, Clone)]
pub struct Statement {
    kind: StatementKind,
    params: Vec<Param>,
    consistency: Consistency,
    serial_consistency: Option<Consistency>,
    page_size: Option<i32>,
    paging_state: Option<Bytes>,
}

impl Statement {
    /// Create an ad-hoc statement with `parameter_count` bind markers.
    pub fn new(query: impl Into<String>, parameter_count: usize, consistency: Consistency) -> Self {
        Self::with_kind(StatementKind::Query(query.into()), parameter_count, consistency)
    }

    /// Create a statement bound to a prepared statement.
    pub fn bound(prepared: Arc<Prepared>, parameter_count: usize, consistency: Consistency) -> Self {
        Self::with_kind(StatementKind::Bound(prepared), parameter_count, consistency)
    }

    /// Create a bound statement sized from the prepared bind variables.
    pub fn from_prepared(prepared: &Arc<Prepared>, consistency: Consistency) -> Self {
        Arc::clone(prepared).bind(consistency)
    }

    fn with_kind(kind: StatementKind, parameter_count: usize, consistency: Consistency) -> Self {
        Self {
            kind,
            params: vec![Param::Unset; parameter_count],
            consistency,
            serial_consistency: None,
            page_size: None,
            paging_state: None,
        }
    }

    pub fn kind(&self) -> &StatementKind {
        &self.kind
    }

    /// The query text, for both ad-hoc and prepared statements.
    pub fn query(&self) -> &str {
        match &self.kind {
            StatementKind::Query(q) => q,
            StatementKind::Bound(p) => &p.query,
        }
    }

    #[inline]
    pub fn parameter_count(&self) -> usize {
        self.params.len()
    }

    pub fn param(&self, index: usize) -> Option<&Param> {
        self.params.get(index)
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    pub fn set_consistency(&mut self, consistency: Consistency) {
        self.consistency = consistency;
    }

    pub fn set_serial_consistency(&mut self, consistency: Option<Consistency>) {
        self.serial_consistency = consistency;
    }

    /// Limit the number of rows returned per page.
    pub fn set_page_size(&mut self, page_size: Option<i32>) {
        self.page_size = page_size;
    }

    /// Resume from a previous result's paging state.
    pub fn set_paging_state(&mut self, paging_state: Option<Bytes>) {
        self.paging_state = paging_state;
    }

    // ------------------------------------------------------------------------
    // Binding
    // ------------------------------------------------------------------------

    fn set(&mut self, index: usize, param: Param) -> CqlResult<()> {
        let count = self.params.len();
        let slot = self
            .params
            .get_mut(index)
            .ok_or(CqlError::IndexOutOfBounds { index, count })?;
        *slot = param;
        Ok(())
    }

    fn check_index(&self, index: usize) -> CqlResult<()> {
        if index < self.params.len() {
            Ok(())
        } else {
            Err(CqlError::IndexOutOfBounds {
                index,
                count: self.params.len(),
            })
        }
    }

    /// Bounds check, then for bound statements check the variable type.
    /// Ad-hoc queries carry no type information and custom types accept
    /// any encoding.
    fn check_type(
        &self,
        index: usize,
        accepts: impl Fn(ValueType) -> bool,
        bound: &str,
    ) -> CqlResult<()> {
        self.check_index(index)?;
        if let StatementKind::Bound(prepared) = &self.kind {
            if let Some(variable) = prepared.variables.get(index) {
                let actual = variable.column_type.value_type();
                if actual != ValueType::Custom && !accepts(actual) {
                    return Err(CqlError::type_mismatch(&variable.column_type, bound));
                }
            }
        }
        Ok(())
    }

    fn set_checked(
        &mut self,
        index: usize,
        accepts: impl Fn(ValueType) -> bool,
        bound: &str,
        bytes: &[u8],
    ) -> CqlResult<()> {
        self.check_type(index, accepts, bound)?;
        self.set(index, Param::Set(Bytes::copy_from_slice(bytes)))
    }

    pub fn bind_null(&mut self, index: usize) -> CqlResult<()> {
        self.set(index, Param::Null)
    }

    /// Shorts are bound as 32-bit integers.
    pub fn bind_short(&mut self, index: usize, value: i16) -> CqlResult<()> {
        self.bind_int32(index, i32::from(value))
    }

    pub fn bind_int32(&mut self, index: usize, value: i32) -> CqlResult<()> {
        self.set_checked(index, |ty| ty == ValueType::Int, "int", &value.to_be_bytes())
    }

    /// bigint, counter and timestamp variables.
    pub fn bind_int64(&mut self, index: usize, value: i64) -> CqlResult<()> {
        self.set_checked(index, ValueType::is_int64, "bigint", &value.to_be_bytes())
    }

    /// Counters are bound as 64-bit integers.
    pub fn bind_counter(&mut self, index: usize, value: i64) -> CqlResult<()> {
        self.bind_int64(index, value)
    }

    pub fn bind_float(&mut self, index: usize, value: f32) -> CqlResult<()> {
        let bits = value.to_bits().to_be_bytes();
        self.set_checked(index, |ty| ty == ValueType::Float, "float", &bits)
    }

    pub fn bind_double(&mut self, index: usize, value: f64) -> CqlResult<()> {
        let bits = value.to_bits().to_be_bytes();
        self.set_checked(index, |ty| ty == ValueType::Double, "double", &bits)
    }

    pub fn bind_bool(&mut self, index: usize, value: bool) -> CqlResult<()> {
        self.set_checked(index, |ty| ty == ValueType::Boolean, "boolean", &[value as u8])
    }

    pub fn bind_string(&mut self, index: usize, value: &str) -> CqlResult<()> {
        self.set_checked(index, ValueType::is_text_like, "varchar", value.as_bytes())
    }

    /// Raw bytes, accepted for any variable type.
    pub fn bind_bytes(&mut self, index: usize, value: &[u8]) -> CqlResult<()> {
        self.set_checked(index, |_| true, "blob", value)
    }

    pub fn bind_uuid(&mut self, index: usize, value: &Uuid) -> CqlResult<()> {
        self.set_checked(
            index,
            |ty| matches!(ty, ValueType::Uuid | ValueType::Timeuuid),
            "uuid",
            value.as_bytes(),
        )
    }

    pub fn bind_inet(&mut self, index: usize, value: &IpAddr) -> CqlResult<()> {
        self.check_type(index, |ty| ty == ValueType::Inet, "inet")?;
        let mut buf = BytesMut::with_capacity(16);
        codec::encode_inet(&mut buf, value);
        self.set(index, Param::Set(buf.freeze()))
    }

    pub fn bind_decimal(&mut self, index: usize, value: &Decimal) -> CqlResult<()> {
        self.check_type(index, |ty| ty == ValueType::Decimal, "decimal")?;
        let mut buf = BytesMut::with_capacity(4 + value.unscaled.len());
        codec::encode_decimal(&mut buf, value);
        self.set(index, Param::Set(buf.freeze()))
    }

    /// Bind a varint given as two's complement big-endian bytes.
    pub fn bind_varint(&mut self, index: usize, value: &[u8]) -> CqlResult<()> {
        self.set_checked(index, |ty| ty == ValueType::Varint, "varint", value)
    }

    /// Bind a varint from an `i64` using the minimal encoding.
    pub fn bind_varint_i64(&mut self, index: usize, value: i64) -> CqlResult<()> {
        self.bind_varint(index, &varint_from_i64(value))
    }

    /// Timestamps are milliseconds since the epoch.
    pub fn bind_timestamp(&mut self, index: usize, value: DateTime<Utc>) -> CqlResult<()> {
        self.bind_int64(index, value.timestamp_millis())
    }

    pub fn bind_collection(
        &mut self,
        index: usize,
        collection: &Collection,
        is_map: bool,
    ) -> CqlResult<()> {
        if is_map {
            self.check_type(index, |ty| ty == ValueType::Map, "map")?;
        } else {
            self.check_type(
                index,
                |ty| matches!(ty, ValueType::List | ValueType::Set),
                "list",
            )?;
        }
        let encoded = collection.encode(is_map)?;
        self.set(index, Param::Set(encoded))
    }

    // ------------------------------------------------------------------------
    // Encoding
    // ------------------------------------------------------------------------

    /// Slot values in order, failing on the first unbound slot.
    pub(crate) fn values(&self) -> CqlResult<Vec<Option<Bytes>>> {
        self.params
            .iter()
            .enumerate()
            .map(|(index, param)| match param {
                Param::Unset => Err(CqlError::UnboundParameter(index)),
                Param::Null => Ok(None),
                Param::Set(bytes) => Ok(Some(bytes.clone())),
            })
            .collect()
    }

    fn parameters(&self) -> CqlResult<QueryParameters> {
        Ok(QueryParameters {
            consistency: self.consistency,
            values: self.values()?,
            skip_metadata: false,
            page_size: self.page_size,
            paging_state: self.paging_state.clone(),
            serial_consistency: self.serial_consistency,
        })
    }

    /// Encode as a QUERY or EXECUTE request body.
    pub fn encode(&self) -> CqlResult<EncodedRequest> {
        let params = self.parameters()?;
        match &self.kind {
            StatementKind::Query(query) => QueryMessage {
                query: query.clone(),
                params,
            }
            .encode(),
            StatementKind::Bound(prepared) => ExecuteMessage {
                id: prepared.id.clone(),
                params,
            }
            .encode(),
        }
    }
}

// ============================================================================
// Batch Statement
// ============================================================================

/// An ordered group of statements executed in one BATCH request.
///
/// Children are borrowed and must outlive the batch.
#[derive(Debug, Clone, Default)]
pub struct BatchStatement<'a> {
    batch_type: BatchType,
    consistency: Consistency,
    statements: Vec<&'a Statement>,
}

impl<'a> BatchStatement<'a> {
    pub fn new(batch_type: BatchType) -> Self {
        Self {
            batch_type,
            consistency: Consistency::default(),
            statements: Vec::new(),
        }
    }

    pub fn add_statement(&mut self, statement: &'a Statement) {
        self.statements.push(statement);
    }

    pub fn set_consistency(&mut self, consistency: Consistency) {
        self.consistency = consistency;
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    pub fn batch_type(&self) -> BatchType {
        self.batch_type
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Encode every child into a single BATCH request body.
    pub fn encode(&self) -> CqlResult<EncodedRequest> {
        if self.statements.len() > codec::MAX_SHORT_LENGTH {
            return Err(CqlError::protocol(format!(
                "Batch of {} statements exceeds the batch size limit",
                self.statements.len()
            )));
        }

        let entries = self
            .statements
            .iter()
            .map(|stmt| {
                let query = match stmt.kind() {
                    StatementKind::Query(q) => BatchQuery::Query(q.clone()),
                    StatementKind::Bound(p) => BatchQuery::Prepared(p.id.clone()),
                };
                Ok(BatchEntry {
                    query,
                    values: stmt.values()?,
                })
            })
            .collect::<CqlResult<Vec<_>>>()?;

        BatchMessage {
            batch_type: self.batch_type,
            entries,
            consistency: self.consistency,
        }
        .encode()
    }
}

// ============================================================================
// Statement Cache (O(1) LRU)
// ============================================================================

/// O(1) LRU cache of prepared statements, keyed by query text.
///
/// Each session keeps its own cache so a repeated `prepare` of the same
/// text returns the existing `Arc<Prepared>` without a round trip.
pub struct StatementCache {
    cache: LruCache<String, Arc<Prepared>>,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
        }
    }

    /// Look up without updating LRU order.
    pub fn get(&self, query: &str) -> Option<Arc<Prepared>> {
        self.cache.peek(query).map(Arc::clone)
    }

    /// Look up and mark as recently used.
    pub fn get_and_touch(&mut self, query: &str) -> Option<Arc<Prepared>> {
        self.cache.get(query).map(Arc::clone)
    }

    #[inline]
    pub fn contains(&self, query: &str) -> bool {
        self.cache.contains(query)
    }

    /// Insert a statement, returning the query text of the evicted entry.
    pub fn insert(&mut self, prepared: Arc<Prepared>) -> Option<String> {
        let query = prepared.query.clone();
        match self.cache.push(query, prepared) {
            Some((evicted, _)) if !self.cache.contains(&evicted) => Some(evicted),
            _ => None,
        }
    }

    pub fn remove(&mut self, query: &str) -> Option<Arc<Prepared>> {
        self.cache.pop(query)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cql::codec::Cursor;
    use crate::cql::protocol::Opcode;
    use crate::cql::result::ColumnSpec;
    use crate::cql::types::{ColumnType, ValueType};

    fn prepared(query: &str, vars: usize) -> Arc<Prepared> {
        let variables = (0..vars)
            .map(|i| ColumnSpec {
                keyspace: "ks".to_string(),
                table: "t".to_string(),
                name: format!("v{}", i),
                column_type: ColumnType::Native(ValueType::Int),
            })
            .collect();
        Arc::new(Prepared::new(
            query,
            PreparedMetadata {
                id: Bytes::from_static(b"\x01\x02\x03"),
                variables: Arc::new(variables),
                result_columns: Arc::new(Vec::new()),
            },
        ))
    }

    #[test]
    fn test_bind_out_of_range_leaves_statement_untouched() {
        let mut stmt = Statement::new("INSERT INTO t (a) VALUES (?)", 1, Consistency::One);

        let err = stmt.bind_int32(1, 7).unwrap_err();
        assert!(matches!(err, CqlError::IndexOutOfBounds { index: 1, count: 1 }));
        assert_eq!(stmt.param(0), Some(&Param::Unset));

        let mut list = Collection::new(1);
        list.append_int32(1).unwrap();
        assert!(stmt.bind_collection(5, &list, false).is_err());
        assert!(stmt.bind_inet(5, &"::1".parse().unwrap()).is_err());
        assert_eq!(stmt.param(0), Some(&Param::Unset));
    }

    #[test]
    fn test_last_bind_wins() {
        let mut stmt = Statement::new("SELECT ?", 1, Consistency::One);
        stmt.bind_int32(0, 1).unwrap();
        stmt.bind_string(0, "two").unwrap();
        assert_eq!(
            stmt.param(0),
            Some(&Param::Set(Bytes::from_static(b"two")))
        );
        stmt.bind_null(0).unwrap();
        assert_eq!(stmt.param(0), Some(&Param::Null));
    }

    #[test]
    fn test_unbound_slot_fails_encoding() {
        let mut stmt = Statement::new("INSERT INTO t (a, b) VALUES (?, ?)", 2, Consistency::One);
        stmt.bind_int32(0, 1).unwrap();

        assert!(matches!(
            stmt.encode(),
            Err(CqlError::UnboundParameter(1))
        ));
    }

    #[test]
    fn test_two_parameter_query_layout() {
        let mut stmt = Statement::new(
            "INSERT INTO t (a, b) VALUES (?, ?)",
            2,
            Consistency::One,
        );
        stmt.bind_int32(0, 42).unwrap();
        stmt.bind_string(1, "hello").unwrap();

        let encoded = stmt.encode().unwrap();
        assert_eq!(encoded.opcode, Opcode::Query);

        let body = &encoded.body[..];
        let mut cur = Cursor::new(body);
        assert_eq!(cur.read_long_string().unwrap(), "INSERT INTO t (a, b) VALUES (?, ?)");
        assert_eq!(
            cur.rest(),
            &[
                0x00, 0x01, // consistency ONE
                0x01, // flags: values
                0x00, 0x02, // value count
                0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x2A, // 42
                0x00, 0x00, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o',
            ]
        );
    }

    #[test]
    fn test_bound_statement_encodes_execute() {
        let prep = prepared("SELECT * FROM t WHERE a = ?", 1);
        let mut stmt = prep.bind(Consistency::Quorum);
        assert_eq!(stmt.parameter_count(), 1);
        assert_eq!(stmt.query(), "SELECT * FROM t WHERE a = ?");

        stmt.bind_int32(0, 5).unwrap();
        let encoded = stmt.encode().unwrap();
        assert_eq!(encoded.opcode, Opcode::Execute);

        let mut cur = Cursor::new(&encoded.body);
        assert_eq!(cur.read_short_bytes().unwrap(), b"\x01\x02\x03");
        assert_eq!(cur.read_short().unwrap(), Consistency::Quorum as u16);
    }

    #[test]
    fn test_bound_type_mismatch_leaves_slot_untouched() {
        let prep = prepared("INSERT INTO t (a) VALUES (?)", 1);
        let mut stmt = prep.bind(Consistency::One);

        let err = stmt.bind_string(0, "not an int").unwrap_err();
        assert!(matches!(err, CqlError::TypeMismatch { .. }));
        assert_eq!(err.code(), crate::cql::error::StatusCode::LibTypeMismatch);
        assert_eq!(stmt.param(0), Some(&Param::Unset));

        assert!(stmt.bind_int64(0, 1).is_err());
        assert!(stmt.bind_collection(0, &Collection::new(0), false).is_err());

        stmt.bind_short(0, 7).unwrap();
        assert_eq!(
            stmt.param(0),
            Some(&Param::Set(Bytes::copy_from_slice(&7i32.to_be_bytes())))
        );
        stmt.bind_bytes(0, &[0, 0, 0, 9]).unwrap();
        stmt.bind_null(0).unwrap();
    }

    #[test]
    fn test_typed_binds() {
        let mut stmt = Statement::new("INSERT", 4, Consistency::One);
        stmt.bind_bool(0, true).unwrap();
        stmt.bind_varint_i64(1, 128).unwrap();
        stmt.bind_decimal(2, &Decimal::from_i64(-5, 2)).unwrap();
        let ts = DateTime::from_timestamp_millis(1_000).unwrap();
        stmt.bind_timestamp(3, ts).unwrap();

        let values = stmt.values().unwrap();
        assert_eq!(values[0].as_deref(), Some(&[1u8][..]));
        assert_eq!(values[1].as_deref(), Some(&[0x00u8, 0x80][..]));
        assert_eq!(values[2].as_deref(), Some(&[0u8, 0, 0, 2, 0xFB][..]));
        assert_eq!(values[3].as_deref(), Some(&1_000i64.to_be_bytes()[..]));
    }

    #[test]
    fn test_batch_encoding() {
        let prep = prepared("UPDATE t SET a = ?", 1);
        let mut first = Statement::from_prepared(&prep, Consistency::One);
        first.bind_int32(0, 1).unwrap();
        let second = Statement::new("DELETE FROM t", 0, Consistency::One);

        let mut batch = BatchStatement::new(BatchType::Logged);
        batch.add_statement(&first);
        batch.add_statement(&second);
        batch.set_consistency(Consistency::Quorum);
        assert_eq!(batch.len(), 2);

        let encoded = batch.encode().unwrap();
        assert_eq!(encoded.opcode, Opcode::Batch);

        let mut cur = Cursor::new(&encoded.body);
        assert_eq!(cur.read_byte().unwrap(), BatchType::Logged as u8);
        assert_eq!(cur.read_short().unwrap(), 2);
        assert_eq!(cur.read_byte().unwrap(), 1);
        assert_eq!(cur.read_short_bytes().unwrap(), b"\x01\x02\x03");
        assert_eq!(cur.read_short().unwrap(), 1);
        assert_eq!(cur.read_bytes().unwrap(), Some(&1i32.to_be_bytes()[..]));
        assert_eq!(cur.read_byte().unwrap(), 0);
        assert_eq!(cur.read_long_string().unwrap(), "DELETE FROM t");
        assert_eq!(cur.read_short().unwrap(), 0);
        assert_eq!(cur.read_short().unwrap(), Consistency::Quorum as u16);
        assert!(cur.is_empty());
    }

    #[test]
    fn test_batch_with_unbound_child_fails() {
        let child = Statement::new("INSERT ?", 1, Consistency::One);
        let mut batch = BatchStatement::new(BatchType::Unlogged);
        batch.add_statement(&child);

        assert!(matches!(
            batch.encode(),
            Err(CqlError::UnboundParameter(0))
        ));
    }

    #[test]
    fn test_cache_basic_operations() {
        let mut cache = StatementCache::new(10);
        assert!(cache.is_empty());

        cache.insert(prepared("SELECT 1", 0));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("SELECT 1"));
        assert_eq!(cache.get("SELECT 1").unwrap().query, "SELECT 1");
        assert!(cache.get("SELECT 2").is_none());
    }

    #[test]
    fn test_cache_lru_eviction() {
        let mut cache = StatementCache::new(2);
        cache.insert(prepared("q1", 0));
        cache.insert(prepared("q2", 0));

        // Touch q1 so q2 becomes least recently used
        cache.get_and_touch("q1");

        let evicted = cache.insert(prepared("q3", 0));
        assert_eq!(evicted.as_deref(), Some("q2"));
        assert!(cache.get("q1").is_some());
        assert!(cache.get("q2").is_none());

        // Replacing an existing key evicts nothing
        assert_eq!(cache.insert(prepared("q3", 1)), None);
        assert_eq!(cache.get("q3").unwrap().parameter_count(), 1);

        cache.remove("q1");
        assert_eq!(cache.len(), 1);
    }
}
