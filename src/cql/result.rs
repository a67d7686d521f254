//! Decoded RESULT responses and forward-only row iteration.
//!
//! A `ResultSet` keeps the raw response body; rows and values are decoded
//! lazily from it and borrow from it.

use std::sync::Arc;

use bytes::Bytes;
use smallvec::SmallVec;

use super::codec::{Cursor, MAX_SHORT_LENGTH};
use super::error::{CqlError, CqlResult};
use super::types::{ColumnType, ValueType};
use super::value::Value;

/// Column metadata shared between a prepared statement and its results.
pub type SharedColumns = Arc<Vec<ColumnSpec>>;

/// RESULT kinds (v2).
mod kind {
    pub const VOID: i32 = 0x0001;
    pub const ROWS: i32 = 0x0002;
    pub const SET_KEYSPACE: i32 = 0x0003;
    pub const PREPARED: i32 = 0x0004;
    pub const SCHEMA_CHANGE: i32 = 0x0005;
}

/// Most columns accepted in a result without column metadata, matching
/// the `[short]` limit on bound values.
const MAX_COLUMNS: usize = MAX_SHORT_LENGTH;

/// Rows metadata flag bits.
mod metadata_flags {
    pub const GLOBAL_TABLES_SPEC: i32 = 0x0001;
    pub const HAS_MORE_PAGES: i32 = 0x0002;
    pub const NO_METADATA: i32 = 0x0004;
}

// ============================================================================
// Column Metadata
// ============================================================================

/// Description of one result column or bind variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub keyspace: String,
    pub table: String,
    pub name: String,
    pub column_type: ColumnType,
}

/// Column metadata plus the paging state of a rows result.
#[derive(Debug, Default)]
struct Metadata {
    columns: Vec<ColumnSpec>,
    paging_state: Option<Bytes>,
}

fn read_metadata(cur: &mut Cursor<'_>, body: &Bytes) -> CqlResult<Metadata> {
    let flags = cur.read_int()?;
    let column_count = read_count(cur, "column")?;

    let paging_state = if flags & metadata_flags::HAS_MORE_PAGES != 0 {
        cur.read_bytes()?.map(|state| body.slice_ref(state))
    } else {
        None
    };

    if flags & metadata_flags::NO_METADATA != 0 {
        if column_count > MAX_COLUMNS {
            return Err(CqlError::protocol(format!(
                "Result announces {} columns",
                column_count
            )));
        }
        // Types are unknown, values can only be read as raw bytes
        let columns = (0..column_count)
            .map(|_| ColumnSpec {
                keyspace: String::new(),
                table: String::new(),
                name: String::new(),
                column_type: ColumnType::Native(ValueType::Blob),
            })
            .collect();
        return Ok(Metadata {
            columns,
            paging_state,
        });
    }

    let global = if flags & metadata_flags::GLOBAL_TABLES_SPEC != 0 {
        let keyspace = cur.read_string()?;
        let table = cur.read_string()?;
        Some((keyspace, table))
    } else {
        None
    };

    let mut columns = Vec::with_capacity(column_count.min(cur.remaining()));
    for _ in 0..column_count {
        let (keyspace, table) = match global {
            Some(spec) => spec,
            None => (cur.read_string()?, cur.read_string()?),
        };
        let name = cur.read_string()?;
        let column_type = cur.read_option()?;
        columns.push(ColumnSpec {
            keyspace: keyspace.to_owned(),
            table: table.to_owned(),
            name: name.to_owned(),
            column_type,
        });
    }

    Ok(Metadata {
        columns,
        paging_state,
    })
}

fn read_count(cur: &mut Cursor<'_>, what: &str) -> CqlResult<usize> {
    let count = cur.read_int()?;
    usize::try_from(count)
        .map_err(|_| CqlError::protocol(format!("Negative {} count: {}", what, count)))
}

// ============================================================================
// Result Kinds
// ============================================================================

/// Metadata returned by a successful PREPARE.
#[derive(Debug, Clone)]
pub struct PreparedMetadata {
    /// Server-assigned statement id.
    pub id: Bytes,
    /// Bind variables, in marker order.
    pub variables: SharedColumns,
    /// Columns of the rows the statement returns, empty if none.
    pub result_columns: SharedColumns,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    /// CREATED, UPDATED or DROPPED
    pub change: String,
    pub keyspace: String,
    /// Empty when the keyspace itself changed.
    pub table: String,
}

#[derive(Debug, Clone)]
pub enum ResultKind {
    Void,
    Rows,
    SetKeyspace(String),
    Prepared(PreparedMetadata),
    SchemaChange(SchemaChange),
}

// ============================================================================
// Result Set
// ============================================================================

/// An immutable decoded RESULT response.
///
/// Non-rows results report zero rows and zero columns.
#[derive(Debug, Clone)]
pub struct ResultSet {
    kind: ResultKind,
    columns: SharedColumns,
    row_count: usize,
    body: Bytes,
    rows_offset: usize,
    paging_state: Option<Bytes>,
}

impl ResultSet {
    /// Decode a RESULT body. Row contents are validated lazily during
    /// iteration.
    pub fn decode(body: Bytes) -> CqlResult<Self> {
        let mut cur = Cursor::new(&body);
        let result_kind = cur.read_int()?;

        let mut columns = Vec::new();
        let mut row_count = 0;
        let mut paging_state = None;

        let kind = match result_kind {
            kind::VOID => ResultKind::Void,
            kind::ROWS => {
                let metadata = read_metadata(&mut cur, &body)?;
                columns = metadata.columns;
                paging_state = metadata.paging_state;
                row_count = read_count(&mut cur, "row")?;
                ResultKind::Rows
            }
            kind::SET_KEYSPACE => ResultKind::SetKeyspace(cur.read_string()?.to_owned()),
            kind::PREPARED => {
                let id = body.slice_ref(cur.read_short_bytes()?);
                let variables = read_metadata(&mut cur, &body)?;
                let result_columns = read_metadata(&mut cur, &body)?;
                ResultKind::Prepared(PreparedMetadata {
                    id,
                    variables: Arc::new(variables.columns),
                    result_columns: Arc::new(result_columns.columns),
                })
            }
            kind::SCHEMA_CHANGE => ResultKind::SchemaChange(SchemaChange {
                change: cur.read_string()?.to_owned(),
                keyspace: cur.read_string()?.to_owned(),
                table: cur.read_string()?.to_owned(),
            }),
            other => {
                return Err(CqlError::protocol(format!(
                    "Unknown result kind: {:#06x}",
                    other
                )))
            }
        };

        let rows_offset = cur.position();
        Ok(Self {
            kind,
            columns: Arc::new(columns),
            row_count,
            body,
            rows_offset,
            paging_state,
        })
    }

    #[inline]
    pub fn kind(&self) -> &ResultKind {
        &self.kind
    }

    /// Number of rows, as announced by the server.
    #[inline]
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    #[inline]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &SharedColumns {
        &self.columns
    }

    pub fn column(&self, index: usize) -> CqlResult<&ColumnSpec> {
        self.columns.get(index).ok_or(CqlError::IndexOutOfBounds {
            index,
            count: self.columns.len(),
        })
    }

    pub fn column_name(&self, index: usize) -> CqlResult<&str> {
        Ok(&self.column(index)?.name)
    }

    pub fn column_type(&self, index: usize) -> CqlResult<ValueType> {
        Ok(self.column(index)?.column_type.value_type())
    }

    /// Index of the first column with the given name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Opaque state to resume from when more pages are available.
    pub fn paging_state(&self) -> Option<&Bytes> {
        self.paging_state.as_ref()
    }

    pub fn has_more_pages(&self) -> bool {
        self.paging_state.is_some()
    }

    /// The keyspace of a SET_KEYSPACE result.
    pub fn keyspace(&self) -> Option<&str> {
        match &self.kind {
            ResultKind::SetKeyspace(ks) => Some(ks),
            _ => None,
        }
    }

    /// A new forward-only iterator over the rows.
    pub fn rows(&self) -> RowIterator<'_> {
        RowIterator {
            columns: &self.columns,
            cursor: Cursor::new(&self.body[self.rows_offset..]),
            remaining: self.row_count,
            state: IterState::BeforeFirst,
            current: SmallVec::new(),
        }
    }

    /// The first row, if any.
    pub fn first_row(&self) -> CqlResult<Option<Row<'_>>> {
        let mut rows = self.rows();
        if rows.advance()? {
            rows.row().map(Some)
        } else {
            Ok(None)
        }
    }
}

// ============================================================================
// Row Iteration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IterState {
    BeforeFirst,
    OnRow,
    Exhausted,
}

/// Forward-only cursor over the rows of a `ResultSet`.
///
/// Call `advance` before each `row`; the iterator cannot be restarted.
#[derive(Debug)]
pub struct RowIterator<'a> {
    columns: &'a [ColumnSpec],
    cursor: Cursor<'a>,
    remaining: usize,
    state: IterState,
    current: SmallVec<[Value<'a>; 8]>,
}

impl<'a> RowIterator<'a> {
    /// Move to the next row. Returns `false` once all rows were visited.
    ///
    /// A malformed row region fails here and ends the iteration.
    pub fn advance(&mut self) -> CqlResult<bool> {
        if self.remaining == 0 {
            self.state = IterState::Exhausted;
            self.current.clear();
            return Ok(false);
        }

        self.current.clear();
        for column in self.columns {
            match self.cursor.read_bytes() {
                Ok(data) => self.current.push(Value::new(&column.column_type, data)),
                Err(e) => {
                    self.remaining = 0;
                    self.state = IterState::Exhausted;
                    self.current.clear();
                    return Err(e);
                }
            }
        }

        self.remaining -= 1;
        self.state = IterState::OnRow;
        Ok(true)
    }

    /// The current row.
    pub fn row(&self) -> CqlResult<Row<'a>> {
        match self.state {
            IterState::OnRow => Ok(Row {
                columns: self.columns,
                values: self.current.clone(),
            }),
            IterState::BeforeFirst => Err(CqlError::IteratorState(
                "row requested before the first advance",
            )),
            IterState::Exhausted => Err(CqlError::IteratorState(
                "row requested after the iterator was exhausted",
            )),
        }
    }

    /// Rows not yet visited.
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl<'a> Iterator for RowIterator<'a> {
    type Item = CqlResult<Row<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(true) => Some(self.row()),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// One decoded row. Values borrow from the owning `ResultSet`.
#[derive(Debug, Clone)]
pub struct Row<'a> {
    columns: &'a [ColumnSpec],
    values: SmallVec<[Value<'a>; 8]>,
}

impl<'a> Row<'a> {
    pub fn get(&self, index: usize) -> CqlResult<Value<'a>> {
        self.values
            .get(index)
            .copied()
            .ok_or(CqlError::IndexOutOfBounds {
                index,
                count: self.values.len(),
            })
    }

    /// Value of the first column with the given name.
    pub fn get_by_name(&self, name: &str) -> CqlResult<Value<'a>> {
        let index = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| CqlError::protocol(format!("No column named {:?}", name)))?;
        self.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = Value<'a>> + '_ {
        self.values.iter().copied()
    }
}

// ============================================================================
// Test Support
// ============================================================================
