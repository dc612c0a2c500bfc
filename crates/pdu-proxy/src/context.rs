//! Per-session state shared by both relay directions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{PoisonError, RwLock};

use serde_json::Value;

/// State that filters in either direction can read and write.
///
/// Each accessor is atomic on its own. There is **no** atomicity across
/// fields: a reader can see a new `user_id` next to an old `user_name` while
/// a writer in the other direction is between the two calls. Filters that
/// need a consistent identity snapshot have to coordinate through the
/// attribute map themselves.
///
/// [`attribute_names`](Self::attribute_names) and
/// [`attributes`](Self::attributes) return copies taken under one lock, so
/// they are consistent at that instant but may already be stale when read.
#[derive(Debug, Default)]
pub struct SessionContext {
    user_id: AtomicI64,
    user_name: RwLock<Option<String>>,
    level: AtomicI32,
    attributes: RwLock<HashMap<String, Value>>,
}

impl SessionContext {
    /// Create an empty context: no identity and no attributes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Account id of the logged-in user, `0` until a filter sets it.
    pub fn user_id(&self) -> i64 {
        self.user_id.load(Ordering::SeqCst)
    }

    /// Record the account id of the logged-in user.
    pub fn set_user_id(&self, user_id: i64) {
        self.user_id.store(user_id, Ordering::SeqCst);
    }

    /// Display name of the logged-in user, if known.
    pub fn user_name(&self) -> Option<String> {
        self.user_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record the display name of the logged-in user.
    pub fn set_user_name(&self, user_name: impl Into<String>) {
        *self.user_name.write().unwrap_or_else(PoisonError::into_inner) = Some(user_name.into());
    }

    /// Game progression level of the logged-in user.
    pub fn level(&self) -> i32 {
        self.level.load(Ordering::SeqCst)
    }

    /// Record the user's progression level.
    pub fn set_level(&self, level: i32) {
        self.level.store(level, Ordering::SeqCst);
    }

    /// Store `value` under `key`, returning the previous value if any.
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.attributes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into())
    }

    /// Copy of the value stored under `key`.
    pub fn get_attribute(&self, key: &str) -> Option<Value> {
        self.attributes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Remove `key`, returning its value if it was set.
    pub fn remove_attribute(&self, key: &str) -> Option<Value> {
        self.attributes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Snapshot of the keys currently set.
    pub fn attribute_names(&self) -> HashSet<String> {
        self.attributes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Snapshot of the whole attribute map.
    pub fn attributes(&self) -> HashMap<String, Value> {
        self.attributes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
