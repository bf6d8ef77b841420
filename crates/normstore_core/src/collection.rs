//! Normalized entity collection with primary and secondary indices.

use crate::entity::{Entity, EntityState, LoadState, StoreEntity, UidGen};
use crate::value::IndexValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Buckets of one secondary index: indexed value to storage positions.
type IndexBuckets = HashMap<IndexValue, Vec<usize>>;

/// A normalized container for entities of one type.
///
/// Storage is an ordered sequence of slots; removing an entity leaves a
/// tombstone (`None`) and positions are never reused or compacted, so index
/// buckets and the primary-key map can hold stable positions. Inserts always
/// append. Under sustained churn the slot vector grows without bound; use
/// [`Store::reset`](crate::Store::reset) to reclaim a bounded-lifetime
/// collection.
///
/// All the heavy members sit behind `Arc`s: cloning a collection is cheap,
/// and a mutation only copies the members it touches, leaving everything else
/// reference-identical with the previous snapshot. Equality compares those
/// references, not contents, which is what makes change detection in the
/// selector layer cheap.
#[derive(Clone)]
pub struct EntityCollection<T: StoreEntity> {
    uid: u64,
    storage: Arc<Vec<Option<Arc<Entity<T>>>>>,
    by_key: Arc<HashMap<T::Key, usize>>,
    index_names: Arc<Vec<String>>,
    indices: Arc<HashMap<String, IndexBuckets>>,
    pub(crate) loaded: LoadState,
    pub(crate) adding: bool,
    pub(crate) loading: bool,
    pub(crate) busy: bool,
}

impl<T: StoreEntity> EntityCollection<T> {
    /// Creates an empty collection with no secondary indices.
    pub fn new(uids: &UidGen) -> Self {
        Self::with_indices(uids, Vec::new(), &[])
    }

    /// Creates a collection seeded with values and no secondary indices.
    pub fn with_values(uids: &UidGen, values: Vec<T>) -> Self {
        Self::with_indices(uids, values, &[])
    }

    /// Creates a collection seeded with values and secondary indices.
    ///
    /// The index set is fixed for the lifetime of the collection.
    pub fn with_indices(uids: &UidGen, values: Vec<T>, indices: &[&str]) -> Self {
        let mut collection = Self {
            uid: uids.next_uid(),
            storage: Arc::new(Vec::new()),
            by_key: Arc::new(HashMap::new()),
            index_names: Arc::new(indices.iter().map(|s| s.to_string()).collect()),
            indices: Arc::new(
                indices
                    .iter()
                    .map(|s| (s.to_string(), IndexBuckets::new()))
                    .collect(),
            ),
            loaded: LoadState::NotLoaded,
            adding: false,
            loading: false,
            busy: false,
        };

        if !values.is_empty() {
            collection.upsert(values, EntityState::none(), uids);
        }

        collection
    }

    /// Returns the collection instance identifier.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Returns the tri-state load marker.
    pub fn loaded(&self) -> LoadState {
        self.loaded
    }

    /// Returns true while any load touching this collection is in flight.
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Returns true while a create operation on this collection is in flight.
    pub fn is_adding(&self) -> bool {
        self.adding
    }

    /// Returns true while any operation on this collection is outstanding.
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Returns the number of live entities.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Returns true if the collection holds no live entities.
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Returns the storage length, tombstones included.
    pub fn storage_len(&self) -> usize {
        self.storage.len()
    }

    /// Returns the names of the secondary indices.
    pub fn index_names(&self) -> &[String] {
        &self.index_names
    }

    /// Returns whether an entity with this key is present.
    pub fn has(&self, key: &T::Key) -> bool {
        self.by_key.contains_key(key)
    }

    /// Returns the entity with this key, if present.
    pub fn find_by_key(&self, key: &T::Key) -> Option<&Arc<Entity<T>>> {
        let position = *self.by_key.get(key)?;
        self.storage.get(position).and_then(|slot| slot.as_ref())
    }

    /// Returns the first entity matching a predicate.
    pub fn find_by(&self, mut predicate: impl FnMut(&Entity<T>) -> bool) -> Option<&Arc<Entity<T>>> {
        self.storage.iter().flatten().find(|e| predicate(e.as_ref()))
    }

    /// Returns the entity with this instance identifier, if present.
    pub fn find_by_uid(&self, uid: u64) -> Option<&Arc<Entity<T>>> {
        self.storage.iter().flatten().find(|e| e.uid() == uid)
    }

    /// Returns the value with this key, if present.
    pub fn value_by_key(&self, key: &T::Key) -> Option<T> {
        self.find_by_key(key).map(|e| e.value.clone())
    }

    /// Returns the first value matching a predicate.
    pub fn value_by(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        self.storage
            .iter()
            .flatten()
            .find(|e| predicate(&e.value))
            .map(|e| e.value.clone())
    }

    /// Returns all values matching a predicate, in storage order.
    pub fn values_by(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        self.storage
            .iter()
            .flatten()
            .filter(|e| predicate(&e.value))
            .map(|e| e.value.clone())
            .collect()
    }

    /// Returns the first value whose indexed field equals `value`.
    pub fn value_by_index(&self, index: &str, value: &IndexValue) -> Option<T> {
        self.entities_by_index(index, value)
            .first()
            .map(|e| e.value.clone())
    }

    /// Returns all values whose indexed field equals `value`, in bucket order.
    pub fn values_by_index(&self, index: &str, value: &IndexValue) -> Vec<T> {
        self.entities_by_index(index, value)
            .iter()
            .map(|e| e.value.clone())
            .collect()
    }

    /// Returns all entities whose indexed field equals `value`.
    pub fn entities_by_index(&self, index: &str, value: &IndexValue) -> Vec<Arc<Entity<T>>> {
        let Some(positions) = self.indices.get(index).and_then(|b| b.get(value)) else {
            return Vec::new();
        };
        positions
            .iter()
            .filter_map(|p| self.storage.get(*p).and_then(|slot| slot.clone()))
            .collect()
    }

    /// Returns all live entities, tombstones skipped.
    pub fn entities(&self) -> Vec<Arc<Entity<T>>> {
        self.storage.iter().flatten().cloned().collect()
    }

    /// Returns all live values, tombstones skipped.
    pub fn values(&self) -> Vec<T> {
        self.storage
            .iter()
            .flatten()
            .map(|e| e.value.clone())
            .collect()
    }

    /// Upserts values into the collection.
    ///
    /// An existing key is merged via [`StoreEntity::merge`], its secondary
    /// indices adjusted wherever the indexed value changed, and `state`
    /// applied with the loaded-downgrade rule. A new key appends an entity to
    /// storage, registers the key, and populates every index for which the
    /// value has an indexed field.
    pub fn upsert(&mut self, values: Vec<T>, state: EntityState, uids: &UidGen) {
        for value in values {
            self.upsert_one(value, state, uids);
        }
    }

    fn upsert_one(&mut self, value: T, state: EntityState, uids: &UidGen) {
        let key = value.key();

        if let Some(position) = self.by_key.get(&key).copied() {
            let storage = Arc::make_mut(&mut self.storage);
            let Some(slot) = storage.get_mut(position).and_then(|s| s.as_mut()) else {
                debug_assert!(false, "by_key referenced a tombstone");
                return;
            };
            let entity = Arc::make_mut(slot);
            let merged = value.merge(&entity.value);

            for index in self.index_names.iter() {
                let old = entity.value.index_value(index);
                let new = merged.index_value(index);
                if old != new {
                    let indices = Arc::make_mut(&mut self.indices);
                    if let Some(old) = old {
                        Self::bucket_remove(indices, index, &old, position);
                    }
                    if let Some(new) = new {
                        Self::bucket_insert(indices, index, new, position);
                    }
                }
            }

            entity.value = merged;
            entity.apply_state(state);
        } else {
            let mut entity = Entity::new(uids, value);
            entity.apply_state(state);

            let position = self.storage.len();
            for index in self.index_names.iter() {
                if let Some(indexed) = entity.value.index_value(index) {
                    Self::bucket_insert(Arc::make_mut(&mut self.indices), index, indexed, position);
                }
            }

            Arc::make_mut(&mut self.storage).push(Some(Arc::new(entity)));
            Arc::make_mut(&mut self.by_key).insert(key, position);
        }
    }

    /// Removes the entities with the given keys.
    ///
    /// Each removed slot becomes a tombstone; storage never shrinks and no
    /// other entity's position changes.
    pub fn remove_by_keys(&mut self, keys: &[T::Key]) {
        if !keys.iter().any(|k| self.by_key.contains_key(k)) {
            return;
        }
        for position in (0..self.storage.len()).rev() {
            let matched = match self.storage[position].as_ref() {
                Some(entity) if keys.contains(&entity.value.key()) => Some(entity.value.key()),
                _ => None,
            };
            if let Some(key) = matched {
                self.remove_at(position, &key);
            }
        }
    }

    /// Removes every entity whose value matches the predicate.
    pub fn remove_by(&mut self, mut predicate: impl FnMut(&T) -> bool) {
        for position in (0..self.storage.len()).rev() {
            let matched = match self.storage[position].as_ref() {
                Some(entity) if predicate(&entity.value) => Some(entity.value.key()),
                _ => None,
            };
            if let Some(key) = matched {
                self.remove_at(position, &key);
            }
        }
    }

    fn remove_at(&mut self, position: usize, key: &T::Key) {
        let indexed: Vec<(String, IndexValue)> = match self.storage[position].as_ref() {
            Some(entity) => self
                .index_names
                .iter()
                .filter_map(|index| {
                    entity
                        .value
                        .index_value(index)
                        .map(|v| (index.clone(), v))
                })
                .collect(),
            None => return,
        };

        let indices = Arc::make_mut(&mut self.indices);
        for (index, value) in &indexed {
            Self::bucket_remove(indices, index, value, position);
        }

        Arc::make_mut(&mut self.by_key).remove(key);
        Arc::make_mut(&mut self.storage)[position] = None;
    }

    /// Applies a closure to the entity with this key.
    ///
    /// Secondary indices are adjusted for every indexed field the closure
    /// changed. Absent keys are ignored.
    pub fn update_entity(&mut self, key: &T::Key, updater: impl FnOnce(&mut Entity<T>)) {
        let Some(position) = self.by_key.get(key).copied() else {
            return;
        };

        let old: Vec<Option<IndexValue>> = {
            let Some(entity) = self.storage.get(position).and_then(|s| s.as_ref()) else {
                return;
            };
            self.index_names
                .iter()
                .map(|index| entity.value.index_value(index))
                .collect()
        };

        {
            let storage = Arc::make_mut(&mut self.storage);
            let Some(slot) = storage.get_mut(position).and_then(|s| s.as_mut()) else {
                return;
            };
            updater(Arc::make_mut(slot));
        }

        let new: Vec<Option<IndexValue>> = {
            let Some(entity) = self.storage.get(position).and_then(|s| s.as_ref()) else {
                return;
            };
            self.index_names
                .iter()
                .map(|index| entity.value.index_value(index))
                .collect()
        };

        let names = Arc::clone(&self.index_names);
        let indices = Arc::make_mut(&mut self.indices);
        for ((index, old), new) in names.iter().zip(old).zip(new) {
            if old != new {
                if let Some(old) = old {
                    Self::bucket_remove(indices, index, &old, position);
                }
                if let Some(new) = new {
                    Self::bucket_insert(indices, index, new, position);
                }
            }
        }
    }

    /// Applies a closure to every entity matching the predicate.
    pub fn update_entities_by(
        &mut self,
        mut predicate: impl FnMut(&Entity<T>) -> bool,
        mut updater: impl FnMut(&mut Entity<T>),
    ) {
        let keys: Vec<T::Key> = self
            .storage
            .iter()
            .flatten()
            .filter(|e| predicate(e.as_ref()))
            .map(|e| e.value.key())
            .collect();
        for key in keys {
            self.update_entity(&key, &mut updater);
        }
    }

    /// Recomputes every index bucket from current storage.
    ///
    /// Entities without a value for an index are skipped by that index.
    pub fn rebuild_indices(&mut self) {
        let mut fresh: HashMap<String, IndexBuckets> = self
            .index_names
            .iter()
            .map(|n| (n.clone(), IndexBuckets::new()))
            .collect();

        for (position, slot) in self.storage.iter().enumerate() {
            let Some(entity) = slot else { continue };
            for index in self.index_names.iter() {
                if let Some(indexed) = entity.value.index_value(index) {
                    if let Some(buckets) = fresh.get_mut(index) {
                        buckets.entry(indexed).or_default().push(position);
                    }
                }
            }
        }

        self.indices = Arc::new(fresh);
    }

    fn bucket_insert(
        indices: &mut HashMap<String, IndexBuckets>,
        index: &str,
        value: IndexValue,
        position: usize,
    ) {
        if let Some(buckets) = indices.get_mut(index) {
            buckets.entry(value).or_default().push(position);
        }
    }

    fn bucket_remove(
        indices: &mut HashMap<String, IndexBuckets>,
        index: &str,
        value: &IndexValue,
        position: usize,
    ) {
        if let Some(buckets) = indices.get_mut(index) {
            if let Some(positions) = buckets.get_mut(value) {
                positions.retain(|p| *p != position);
                if positions.is_empty() {
                    buckets.remove(value);
                }
            }
        }
    }

    /// Mutable access to one entity, copying the touched path.
    pub(crate) fn entity_mut(&mut self, key: &T::Key) -> Option<&mut Entity<T>> {
        let position = *self.by_key.get(key)?;
        let storage = Arc::make_mut(&mut self.storage);
        let slot = storage.get_mut(position)?.as_mut()?;
        Some(Arc::make_mut(slot))
    }

    /// The uid of the entity with this key, if present.
    pub(crate) fn entity_uid(&self, key: &T::Key) -> Option<u64> {
        self.find_by_key(key).map(|e| e.uid())
    }

    /// Reference to the underlying slot vector, for selector probes.
    pub(crate) fn storage(&self) -> &Arc<Vec<Option<Arc<Entity<T>>>>> {
        &self.storage
    }

    /// The slot holding this key, for selector probes.
    pub(crate) fn slot_by_key(&self, key: &T::Key) -> Option<Arc<Entity<T>>> {
        self.find_by_key(key).cloned()
    }
}

/// Reference-based equality: two collections compare equal when they share
/// the same identity, the same storage/index references and the same flags.
/// A mutation through the store always replaces at least one of these, so
/// `==` is a reliable, cheap "nothing changed" check.
impl<T: StoreEntity> PartialEq for EntityCollection<T> {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
            && Arc::ptr_eq(&self.storage, &other.storage)
            && Arc::ptr_eq(&self.by_key, &other.by_key)
            && Arc::ptr_eq(&self.indices, &other.indices)
            && self.loaded == other.loaded
            && self.adding == other.adding
            && self.loading == other.loading
            && self.busy == other.busy
    }
}

impl<T: StoreEntity> std::fmt::Debug for EntityCollection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCollection")
            .field("uid", &self.uid)
            .field("len", &self.len())
            .field("storage_len", &self.storage_len())
            .field("loaded", &self.loaded)
            .field("busy", &self.busy)
            .finish_non_exhaustive()
    }
}
