//! cqlkit - a client driver for the CQL native protocol (v2).
//!
//! ```no_run
//! use cqlkit::{Cluster, ClusterConfig, Consistency};
//!
//! let cluster = Cluster::new(ClusterConfig::new().contact_points("127.0.0.1").keyspace("app"))?;
//! let session = cluster.connect().get()?;
//!
//! let prepared = session.prepare("SELECT name FROM users WHERE id = ?").get()?;
//! let mut stmt = prepared.bind(Consistency::One);
//! stmt.bind_int32(0, 42)?;
//!
//! let result = session.execute(&stmt).get()?;
//! let mut rows = result.rows();
//! while rows.advance()? {
//!     println!("{}", rows.row()?.get(0)?.as_str()?);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod cql;

pub use cql::{
    BatchStatement, BatchType, Cluster, ClusterConfig, Collection, Consistency, CqlError,
    CqlFuture, CqlResult, FutureError, Prepared, ResultSet, Row, Session, Statement, StatusCode,
    Value, ValueType,
};
