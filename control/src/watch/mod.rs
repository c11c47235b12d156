//! Generic list+watch machinery.
//!
//! A [`Store`] mirrors one remote collection keyed by `namespace/name`; a
//! [`ListWatcher`] keeps it current by seeding it from a bulk list and then
//! applying a continuous watch. Consumers observe mutations through a
//! callback bound at store construction.

pub mod list_watcher;
pub mod store;

pub use list_watcher::{ListSnapshot, ListWatcher, WatchedEvent};
pub use store::Store;

use thiserror::Error;

/// How an object changed relative to the store's prior contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Updated,
    Deleted,
    /// Synthetic event carrying a full resynchronised snapshot.
    Replaced,
}

/// Prior and current versions of a changed object.
///
/// `Added` carries no prior, `Deleted` carries no current; `Updated` carries
/// both.
#[derive(Debug, Clone)]
pub struct Delta<T> {
    pub old: Option<T>,
    pub new: Option<T>,
}

/// Payload delivered to a store's change callback. Handlers must iterate the
/// `Replaced` sequence themselves.
#[derive(Debug, Clone)]
pub enum Change<T> {
    Object(Delta<T>),
    Replaced(Vec<T>),
}

/// Callback invoked after each successful store mutation, on the mutating
/// thread. It must not block the store.
pub type OnChange<T> = Box<dyn Fn(ChangeType, Change<T>) + Send + Sync>;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("list failed: {0}")]
    List(String),
    #[error("watch failed: {0}")]
    Watch(String),
}
