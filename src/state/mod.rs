mod sqlite;

use std::fmt;

use tracing::warn;

pub use sqlite::SqliteStateStore;

use crate::traits::StateStore;

/// Classified state-store failure. The caller's recovery strategy depends
/// on which of these it got.
#[derive(Debug)]
pub enum StoreError {
    /// Optimistic version conflict: someone else wrote the key since our
    /// read. Recover by re-reading, re-merging, and retrying (bounded).
    Stale,
    /// Stored bytes no longer decode (schema drift). Fail closed for this
    /// key and leave the stored data untouched rather than guessing.
    Malformed(String),
    /// The backing database rejected the operation.
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Stale => write!(f, "stale write: collection changed since read"),
            StoreError::Malformed(detail) => write!(f, "malformed persisted state: {}", detail),
            StoreError::Backend(detail) => write!(f, "state store backend error: {}", detail),
        }
    }
}

impl std::error::Error for StoreError {}

/// Bounded retries for optimistic read-modify-write conflicts.
const RMW_MAX_ATTEMPTS: u32 = 3;

/// Read a collection, apply `mutate` to its JSON body, and write it back
/// under the version read. Stale writes re-read and re-apply up to
/// [`RMW_MAX_ATTEMPTS`] times; persistent conflict is surfaced as `Stale`
/// after a logged warning (the caller drops the mutation).
///
/// Absent collections present `mutate` with the provided default.
pub async fn read_modify_write<T, F>(
    store: &dyn StateStore,
    key: &str,
    default: fn() -> serde_json::Value,
    mut mutate: F,
) -> Result<T, StoreError>
where
    F: FnMut(&mut serde_json::Value) -> T,
{
    for attempt in 1..=RMW_MAX_ATTEMPTS {
        let read = store.read_collection(key).await?;
        let mut body = if read.version == 0 || read.body.is_null() {
            default()
        } else {
            read.body
        };
        let result = mutate(&mut body);
        match store.write_collection(key, &body, read.version).await {
            Ok(_) => return Ok(result),
            Err(StoreError::Stale) if attempt < RMW_MAX_ATTEMPTS => {
                warn!(key, attempt, "Stale write, retrying read-modify-write");
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(StoreError::Stale)
}

pub fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}
