//! CQL native protocol (v2) client driver.
//!
//! Requests are built and encoded on the calling thread and completed on a
//! background tokio runtime. Every session operation returns a `CqlFuture`
//! the caller can poll, block on, or block on with a timeout.
//!
//! Architecture:
//! - `codec`: Primitive wire encoding and the bounds-checked decode cursor
//! - `types`, `value`, `collection`: Type tags, decoded values, collection builder
//! - `protocol`: Frame header, opcodes, request and response messages
//! - `statement`: Statements, batches, prepared statements and their cache
//! - `result`: Result sets and row iteration
//! - `future`: Single-assignment futures and their promises
//! - `connection`, `auth`, `config`, `session`: Connection handling and the session API
//! - `handle`: Opaque handle table for foreign callers

pub mod codec;
pub mod types;
pub mod value;
pub mod collection;
pub mod protocol;
pub mod statement;
pub mod result;
pub mod future;
pub mod auth;
pub mod config;
pub mod connection;
pub mod session;
pub mod handle;
pub mod error;


// Public API re-exports for library consumers
pub use collection::Collection;
pub use config::ClusterConfig;
pub use error::{CqlError, CqlResult, ErrorSource, FutureError, StatusCode};
pub use future::{CqlFuture, PrepareFuture, Promise, ResultFuture, SessionFuture, ShutdownFuture};
pub use handle::{Handle, HandleTable};
pub use result::{ColumnSpec, ResultKind, ResultSet, Row, RowIterator};
pub use session::{Cluster, Session};
pub use statement::{BatchStatement, BatchType, Consistency, Prepared, Statement};
pub use types::{ColumnType, Decimal, ValueType};
pub use value::Value;
