//! Opaque handles for entities handed across a language boundary.
//!
//! The driver itself works with owned Rust values; `HandleTable` is the
//! building block for a C-style binding layer that passes sessions,
//! statements and futures to foreign callers as integer ids.
//!
//! Each `insert` must be matched by exactly one `release`. Entities are
//! held as `Arc<T>`, so releasing a handle while an operation still uses
//! the entity only drops the table's reference.
//!
//! ```
//! use cqlkit::cql::{CqlFuture, HandleTable, StatusCode};
//!
//! let futures: HandleTable<CqlFuture<u32>> = HandleTable::new();
//! let (promise, future) = CqlFuture::pending();
//! let id = futures.insert(future).id();
//!
//! // A foreign caller holds only `id`
//! let handle = cqlkit::cql::Handle::from_id(id);
//! promise.set_value(7).unwrap();
//! assert_eq!(futures.get(handle).unwrap().payload(), Some(&7));
//!
//! futures.release(handle).unwrap();
//! assert_eq!(futures.release(handle).unwrap_err().code(), StatusCode::LibBadParams);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use super::error::{CqlError, CqlResult};

/// An opaque id for an entity stored in a `HandleTable<T>`.
pub struct Handle<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// The raw id, suitable for passing as an integer.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Rebuild a handle from a raw id. Lookups validate it.
    pub fn from_id(id: u64) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.id)
    }
}

/// Registry of live entities keyed by handle id.
///
/// Ids are never reused, so a stale handle cannot alias a newer entity.
pub struct HandleTable<T> {
    entries: Mutex<HashMap<u64, Arc<T>>>,
    next_id: AtomicU64,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn insert(&self, value: T) -> Handle<T> {
        self.insert_arc(Arc::new(value))
    }

    pub fn insert_arc(&self, value: Arc<T>) -> Handle<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(id, value);
        Handle::from_id(id)
    }

    pub fn get(&self, handle: Handle<T>) -> CqlResult<Arc<T>> {
        self.entries
            .lock()
            .get(&handle.id)
            .cloned()
            .ok_or(CqlError::InvalidHandle)
    }

    /// Release the table's reference. A second release of the same handle
    /// fails with `CqlError::InvalidHandle`.
    pub fn release(&self, handle: Handle<T>) -> CqlResult<Arc<T>> {
        self.entries.lock().remove(&handle.id).ok_or_else(|| {
            warn!(id = handle.id, "Release of unknown or already released handle");
            CqlError::InvalidHandle
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for HandleTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("live", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cql::error::StatusCode;
    use crate::cql::future::CqlFuture;

    #[test]
    fn test_insert_get_release() {
        let table = HandleTable::new();
        let handle = table.insert(String::from("statement"));

        assert_eq!(*table.get(handle).unwrap(), "statement");
        assert_eq!(table.len(), 1);

        let released = table.release(handle).unwrap();
        assert_eq!(*released, "statement");
        assert!(table.is_empty());
    }

    #[test]
    fn test_double_release_rejected() {
        let table = HandleTable::new();
        let handle = table.insert(1u32);
        table.release(handle).unwrap();

        let err = table.release(handle).unwrap_err();
        assert!(matches!(err, CqlError::InvalidHandle));
        assert_eq!(err.code(), StatusCode::LibBadParams);
        assert!(table.get(handle).is_err());
    }

    #[test]
    fn test_ids_are_not_reused() {
        let table = HandleTable::new();
        let first = table.insert(1u8);
        table.release(first).unwrap();
        let second = table.insert(2u8);

        assert_ne!(first, second);
        assert!(table.get(Handle::from_id(first.id())).is_err());
    }

    #[test]
    fn test_release_pending_future() {
        let table = HandleTable::new();
        let (promise, future) = CqlFuture::<u32>::pending();
        let handle = table.insert(future);

        // The caller releases interest before the I/O side completes
        table.release(handle).unwrap();
        promise.set_value(3).unwrap();
        assert!(promise.is_completed());
    }
}
