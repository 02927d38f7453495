//! Cross-invocation state
//!
//! Everything that must survive between invocations (alarm states, daily
//! thread handles, in-flight remediation locks, pending verifications) lives
//! behind the [`StateStore`] trait: a string key-value store with conditional
//! writes. Records are stored as JSON; typed helpers are in [`records`].

pub mod file;
pub mod memory;
pub mod records;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;
pub use records::{AlarmState, InFlightMarker, PendingVerification, ThreadHandle, ThreadRecord};

use crate::error::StateError;
use crate::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Key-value store with conditional writes
///
/// `compare_and_swap` with `expected = None` succeeds only when the key is
/// absent; `new = None` deletes the key. Both conditional operations must be
/// atomic with respect to every other caller of the same store.
pub trait StateStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StateError>>;

    fn put<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<(), StateError>>;

    /// Returns `true` if the value was written
    fn put_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: String,
    ) -> BoxFuture<'a, Result<bool, StateError>>;

    /// Returns `true` if the current value matched `expected` and was replaced
    fn compare_and_swap<'a>(
        &'a self,
        key: &'a str,
        expected: Option<&'a str>,
        new: Option<String>,
    ) -> BoxFuture<'a, Result<bool, StateError>>;
}

pub fn alarm_key(target: &str) -> String {
    format!("alarm/{}", target)
}

pub fn in_flight_key(target: &str) -> String {
    format!("remediation/{}", target)
}

pub fn verification_key(target: &str) -> String {
    format!("verify/{}", target)
}

pub fn thread_key(day_key: &str) -> String {
    format!("thread/{}", day_key)
}

pub(crate) fn encode<T: Serialize>(key: &str, value: &T) -> Result<String, StateError> {
    serde_json::to_string(value).map_err(|e| StateError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, StateError> {
    serde_json::from_str(raw).map_err(|e| StateError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Read and decode a record, returning the raw value too so callers can use
/// it as the `expected` side of a compare-and-swap
pub(crate) async fn load<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<(String, T)>, StateError> {
    match store.get(key).await? {
        Some(raw) => {
            let value = decode(key, &raw)?;
            Ok(Some((raw, value)))
        }
        None => Ok(None),
    }
}
