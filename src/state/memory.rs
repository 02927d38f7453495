use crate::error::StateError;
use crate::state::StateStore;
use crate::BoxFuture;
use std::collections::HashMap;
use std::sync::Mutex;

/// In-process state store
///
/// Every operation runs under one mutex, so the conditional writes are
/// trivially atomic. State does not outlive the process.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut HashMap<String, String>) -> R) -> R {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut entries)
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.with_entries(|entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for MemoryStateStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StateError>> {
        Box::pin(async move { Ok(self.with_entries(|entries| entries.get(key).cloned())) })
    }

    fn put<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<(), StateError>> {
        Box::pin(async move {
            self.with_entries(|entries| entries.insert(key.to_string(), value));
            Ok(())
        })
    }

    fn put_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: String,
    ) -> BoxFuture<'a, Result<bool, StateError>> {
        Box::pin(async move {
            Ok(self.with_entries(|entries| {
                if entries.contains_key(key) {
                    false
                } else {
                    entries.insert(key.to_string(), value);
                    true
                }
            }))
        })
    }

    fn compare_and_swap<'a>(
        &'a self,
        key: &'a str,
        expected: Option<&'a str>,
        new: Option<String>,
    ) -> BoxFuture<'a, Result<bool, StateError>> {
        Box::pin(async move {
            Ok(self.with_entries(|entries| {
                if entries.get(key).map(String::as_str) != expected {
                    return false;
                }
                match new {
                    Some(value) => entries.insert(key.to_string(), value),
                    None => entries.remove(key),
                };
                true
            }))
        })
    }
}
