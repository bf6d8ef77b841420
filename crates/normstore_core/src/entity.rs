//! Entity wrapper, lifecycle flags and identity.

use crate::value::IndexValue;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Generator of unique ids for collections and entities.
///
/// Uids are monotonic, never reused, and scoped to the store they belong to,
/// so two stores in one process cannot collide. The generator is shared
/// between initial-state construction and the store itself: build the initial
/// snapshot with a `UidGen`, then hand the same generator to the store
/// configuration so later upserts continue the sequence.
#[derive(Debug, Clone, Default)]
pub struct UidGen(Arc<AtomicU64>);

impl UidGen {
    /// Creates a new generator starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next unique id.
    pub fn next_uid(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Tri-state load marker for a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    /// The collection has never been loaded.
    #[default]
    NotLoaded,
    /// A load is currently in flight.
    Loading,
    /// The collection has been fully loaded.
    Loaded,
}

impl LoadState {
    /// Returns true if the collection is fully loaded.
    pub fn is_loaded(self) -> bool {
        matches!(self, LoadState::Loaded)
    }
}

/// The contract a domain type must fulfil to live in an [`EntityCollection`].
///
/// [`EntityCollection`]: crate::EntityCollection
pub trait StoreEntity: Clone + Send + Sync + 'static {
    /// The primary-key type of the entity.
    type Key: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Returns the primary key of this value.
    fn key(&self) -> Self::Key;

    /// Returns the value of a named secondary-index field.
    ///
    /// Returning `None` means the field is absent on this value; the entity
    /// is then simply skipped by that index.
    fn index_value(&self, index: &str) -> Option<IndexValue> {
        let _ = index;
        None
    }

    /// Merges this (possibly partial) value into a previously stored one.
    ///
    /// The default keeps the incoming value wholesale. Types with optional
    /// fields should override this so fields absent from the incoming value
    /// retain their previous content (shallow merge, later fields win).
    fn merge(self, previous: &Self) -> Self {
        let _ = previous;
        self
    }
}

/// Flag overrides applied during an upsert.
///
/// Each `Some` field replaces the corresponding entity flag; `None` leaves it
/// untouched. By default `loaded: Some(false)` does not downgrade an entity
/// that is already fully loaded; set `force` to make the downgrade explicit.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityState {
    /// Override for the `loaded` flag.
    pub loaded: Option<bool>,
    /// Override for the `loading` flag.
    pub loading: Option<bool>,
    /// Override for the `busy` flag.
    pub busy: Option<bool>,
    /// Permit downgrading `loaded` on an already-loaded entity.
    pub force: bool,
}

impl EntityState {
    /// No overrides; defaults apply.
    pub fn none() -> Self {
        Self::default()
    }

    /// Overrides only the `loaded` flag.
    pub fn loaded(loaded: bool) -> Self {
        Self {
            loaded: Some(loaded),
            ..Self::default()
        }
    }

    /// Returns a copy with `force` set.
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// A domain value plus its per-item lifecycle flags.
///
/// The `uid` identifies the entity instance independently of its business
/// key; busy-state counters are keyed by it, so overwriting the value in
/// place never loses bookkeeping.
#[derive(Debug, Clone)]
pub struct Entity<T> {
    uid: u64,
    /// The domain payload.
    pub value: T,
    /// Whether the entity is fully loaded.
    pub loaded: bool,
    /// Whether a load for this entity is in flight.
    pub loading: bool,
    /// Whether an update for this entity is in flight.
    pub updating: bool,
    /// Whether a delete for this entity is in flight.
    pub deleting: bool,
    /// Whether any operation on this entity is in flight.
    pub busy: bool,
}

impl<T> Entity<T> {
    /// Wraps a value in a fresh entity.
    ///
    /// New entities start loaded with no operation in flight.
    pub(crate) fn new(uids: &UidGen, value: T) -> Self {
        Self {
            uid: uids.next_uid(),
            value,
            loaded: true,
            loading: false,
            updating: false,
            deleting: false,
            busy: false,
        }
    }

    /// Returns the instance identifier of this entity.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Applies flag overrides, honoring the loaded-downgrade rule.
    pub(crate) fn apply_state(&mut self, state: EntityState) {
        if let Some(loaded) = state.loaded {
            if loaded || !self.loaded || state.force {
                self.loaded = loaded;
            }
        }
        if let Some(loading) = state.loading {
            self.loading = loading;
        }
        if let Some(busy) = state.busy {
            self.busy = busy;
        }
    }

    /// Recomputes `busy` as the OR of the in-flight flags.
    pub(crate) fn recompute_busy(&mut self) {
        self.busy = self.loading || self.updating || self.deleting;
    }
}
