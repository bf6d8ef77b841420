//! Store root: snapshot ownership, mutation engine and collection operations.

use crate::collection::EntityCollection;
use crate::config::StoreConfig;
use crate::entity::{Entity, EntityState, LoadState, StoreEntity, UidGen};
use crate::error::{StoreError, StoreResult};
use crate::lens::Lens;
use crate::transport::{Transport, TransportFuture};
use crate::value::IndexValue;
use futures::future::Shared;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;

/// A deduplicated in-flight request, shareable by any number of awaiters.
pub(crate) type SharedLoad = Shared<TransportFuture>;

/// Reference counts backing the public busy/loading flags.
///
/// Kept outside the snapshot on purpose: overlapping asynchronous operations
/// mutate these tables constantly, and placing them inside the immutable
/// state would turn every counter tick into a structural change, defeating
/// reference-equality change detection. Only the derived booleans are written
/// into the snapshot.
#[derive(Debug, Default)]
struct FlagCounters {
    adding: HashMap<u64, u64>,
    loading: HashMap<u64, u64>,
    updating: HashMap<u64, u64>,
    deleting: HashMap<u64, u64>,
}

impl FlagCounters {
    /// `Some(true)` increments, `Some(false)` decrements, `None` leaves the
    /// counter alone. Decrements saturate at zero.
    fn apply(map: &mut HashMap<u64, u64>, uid: u64, delta: Option<bool>) {
        match delta {
            Some(true) => *map.entry(uid).or_insert(0) += 1,
            Some(false) => {
                if let Some(count) = map.get_mut(&uid) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        map.remove(&uid);
                    }
                }
            }
            None => {}
        }
    }

    fn count(map: &HashMap<u64, u64>, uid: u64) -> u64 {
        map.get(&uid).copied().unwrap_or(0)
    }
}

/// The store root.
///
/// Holds the current immutable snapshot of type `S` (the caller's state
/// struct, a plain `Clone` type whose collection members are
/// [`EntityCollection`]s), publishes new snapshots through a watch channel,
/// and carries the out-of-band machinery: busy counters, the in-flight
/// request cache and the executed-query set.
///
/// All writes go through [`Store::update`]; readers either pull the current
/// snapshot or subscribe through the selector layer.
pub struct Store<S> {
    snapshot_tx: watch::Sender<S>,
    initial: S,
    uids: UidGen,
    transport: Option<Arc<dyn Transport>>,
    write_lock: Mutex<()>,
    counters: Mutex<FlagCounters>,
    pub(crate) inflight: Mutex<HashMap<String, SharedLoad>>,
    pub(crate) executed_tx: watch::Sender<HashSet<String>>,
}

impl<S: Clone + Send + Sync + 'static> Store<S> {
    /// Creates a store from its configuration.
    pub fn new(config: StoreConfig<S>) -> Self {
        let StoreConfig {
            initial,
            uids,
            transport,
        } = config;
        let (snapshot_tx, _) = watch::channel(initial.clone());
        let (executed_tx, _) = watch::channel(HashSet::new());

        Self {
            snapshot_tx,
            initial,
            uids,
            transport,
            write_lock: Mutex::new(()),
            counters: Mutex::new(FlagCounters::default()),
            inflight: Mutex::new(HashMap::new()),
            executed_tx,
        }
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> S {
        self.snapshot_tx.borrow().clone()
    }

    /// Runs a closure against the current snapshot without cloning it.
    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.snapshot_tx.borrow())
    }

    /// Subscribes to raw snapshot publications.
    ///
    /// Most callers want the selector layer instead; this is the low-level
    /// hook it is built on.
    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.snapshot_tx.subscribe()
    }

    pub(crate) fn transport(&self) -> StoreResult<Arc<dyn Transport>> {
        self.transport.clone().ok_or(StoreError::Configuration)
    }

    /// Applies a transform to a draft of the current snapshot and publishes
    /// the result.
    ///
    /// The transform receives the mutable draft and the read-only original
    /// (for before/after comparisons). Writes are serialized in call order;
    /// readers observe either the previous snapshot or the fully transformed
    /// one, never an intermediate state. Unmodified subtrees keep their
    /// references, which is what the selector layer's change detection
    /// relies on.
    pub fn update(&self, transform: impl FnOnce(&mut S, &S)) {
        let _guard = self.write_lock.lock();
        let original = self.snapshot_tx.borrow().clone();
        let mut draft = original.clone();
        transform(&mut draft, &original);
        self.snapshot_tx.send_replace(draft);
    }

    /// Restores the configured initial snapshot, discarding all mutations.
    pub fn reset(&self) {
        tracing::debug!("resetting store to initial snapshot");
        self.update(|draft, _| *draft = self.initial.clone());
    }

    /// Returns the first entity matching a predicate.
    pub fn find_entity_by<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        predicate: impl FnMut(&Entity<T>) -> bool,
    ) -> Option<Arc<Entity<T>>> {
        self.read(|s| lens.get(s).find_by(predicate).cloned())
    }

    /// Returns the entity with this key, if present.
    pub fn find_entity_by_key<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        key: &T::Key,
    ) -> Option<Arc<Entity<T>>> {
        self.read(|s| lens.get(s).find_by_key(key).cloned())
    }

    /// Returns the entity with this instance identifier, if present.
    pub fn find_entity_by_uid<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        uid: u64,
    ) -> Option<Arc<Entity<T>>> {
        self.read(|s| lens.get(s).find_by_uid(uid).cloned())
    }

    /// Returns the first value matching a predicate.
    pub fn find_value_by<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        predicate: impl FnMut(&T) -> bool,
    ) -> Option<T> {
        self.read(|s| lens.get(s).value_by(predicate))
    }

    /// Returns the value with this key, if present.
    pub fn find_value_by_key<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        key: &T::Key,
    ) -> Option<T> {
        self.read(|s| lens.get(s).value_by_key(key))
    }

    /// Returns the first value whose indexed field equals `value`.
    pub fn find_value_by_index<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        index: &str,
        value: &IndexValue,
    ) -> Option<T> {
        self.read(|s| lens.get(s).value_by_index(index, value))
    }

    /// Returns all values matching a predicate.
    pub fn find_values_by<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        predicate: impl FnMut(&T) -> bool,
    ) -> Vec<T> {
        self.read(|s| lens.get(s).values_by(predicate))
    }

    /// Returns all values whose indexed field equals `value`.
    pub fn find_values_by_index<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        index: &str,
        value: &IndexValue,
    ) -> Vec<T> {
        self.read(|s| lens.get(s).values_by_index(index, value))
    }

    /// Returns all live entities of a collection.
    pub fn entities<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
    ) -> Vec<Arc<Entity<T>>> {
        self.read(|s| lens.get(s).entities())
    }

    /// Returns all live values of a collection.
    pub fn values<T: StoreEntity>(&self, lens: Lens<S, EntityCollection<T>>) -> Vec<T> {
        self.read(|s| lens.get(s).values())
    }

    /// Returns whether an entity with this key is present.
    pub fn has_entity<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        key: &T::Key,
    ) -> bool {
        self.read(|s| lens.get(s).has(key))
    }

    /// Upserts one value into a collection.
    pub fn upsert_value<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        value: T,
        state: EntityState,
    ) {
        self.upsert_values(lens, vec![value], state);
    }

    /// Upserts values into a collection.
    ///
    /// Existing keys are merged (see [`StoreEntity::merge`]); new keys are
    /// appended. Secondary indices are kept consistent either way.
    pub fn upsert_values<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        values: Vec<T>,
        state: EntityState,
    ) {
        self.update(|draft, _| lens.get_mut(draft).upsert(values, state, &self.uids));
    }

    /// Removes the entities with the given keys, tombstoning their slots.
    pub fn remove_entities_by_keys<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        keys: &[T::Key],
    ) {
        self.update(|draft, _| lens.get_mut(draft).remove_by_keys(keys));
    }

    /// Removes every value matching the predicate.
    pub fn remove_values_by<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        predicate: impl FnMut(&T) -> bool,
    ) {
        self.update(|draft, _| lens.get_mut(draft).remove_by(predicate));
    }

    /// Applies a closure to the entity with this key, with index fixup.
    pub fn update_entity_by_key<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        key: &T::Key,
        updater: impl FnOnce(&mut Entity<T>),
    ) {
        self.update(|draft, _| lens.get_mut(draft).update_entity(key, updater));
    }

    /// Applies a closure to the value with this key, with index fixup.
    pub fn update_value_by_key<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        key: &T::Key,
        updater: impl FnOnce(&mut T),
    ) {
        self.update_entity_by_key(lens, key, |entity| updater(&mut entity.value));
    }

    /// Applies a closure to every entity matching the predicate.
    pub fn update_entities_by<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        predicate: impl FnMut(&Entity<T>) -> bool,
        updater: impl FnMut(&mut Entity<T>),
    ) {
        self.update(|draft, _| lens.get_mut(draft).update_entities_by(predicate, updater));
    }

    /// Applies a closure to every value matching the predicate.
    pub fn update_values_by<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        mut predicate: impl FnMut(&T) -> bool,
        mut updater: impl FnMut(&mut T),
    ) {
        self.update_entities_by(
            lens,
            move |entity| predicate(&entity.value),
            move |entity| updater(&mut entity.value),
        );
    }

    /// Recomputes the index buckets of a collection from its storage.
    pub fn rebuild_indices<T: StoreEntity>(&self, lens: Lens<S, EntityCollection<T>>) {
        self.update(|draft, _| lens.get_mut(draft).rebuild_indices());
    }

    /// Returns whether a keyed query has completed successfully.
    pub fn is_query_executed(&self, query: &str) -> bool {
        self.executed_tx.borrow().contains(query)
    }

    pub(crate) fn mark_query_executed(&self, query: &str) {
        self.executed_tx.send_modify(|set| {
            set.insert(query.to_string());
        });
    }

    /// Adjusts collection-level counters inside an update transform and
    /// rewrites the derived flags. `Some(true)` starts an operation,
    /// `Some(false)` ends one, `None` leaves that counter alone.
    pub(crate) fn adjust_collection_flags<T: StoreEntity>(
        &self,
        draft: &mut S,
        lens: Lens<S, EntityCollection<T>>,
        adding: Option<bool>,
        loading: Option<bool>,
        updating: Option<bool>,
        deleting: Option<bool>,
    ) {
        let uid = lens.get(draft).uid();
        let (is_adding, is_loading, is_busy) = {
            let mut counters = self.counters.lock();
            FlagCounters::apply(&mut counters.adding, uid, adding);
            FlagCounters::apply(&mut counters.loading, uid, loading);
            FlagCounters::apply(&mut counters.updating, uid, updating);
            FlagCounters::apply(&mut counters.deleting, uid, deleting);

            let adding_count = FlagCounters::count(&counters.adding, uid);
            let loading_count = FlagCounters::count(&counters.loading, uid);
            let total = adding_count
                + loading_count
                + FlagCounters::count(&counters.updating, uid)
                + FlagCounters::count(&counters.deleting, uid);
            (adding_count > 0, loading_count > 0, total > 0)
        };

        let collection = lens.get_mut(draft);
        collection.adding = is_adding;
        collection.loading = is_loading;
        collection.busy = is_busy;
    }

    /// Adjusts entity-level counters inside an update transform and rewrites
    /// the derived flags. `loaded` is written through as-is when present.
    pub(crate) fn adjust_entity_flags<T: StoreEntity>(
        &self,
        draft: &mut S,
        lens: Lens<S, EntityCollection<T>>,
        key: &T::Key,
        loaded: Option<bool>,
        loading: Option<bool>,
        updating: Option<bool>,
        deleting: Option<bool>,
    ) {
        let Some(uid) = lens.get(draft).entity_uid(key) else {
            return;
        };

        let (is_loading, is_updating, is_deleting) = {
            let mut counters = self.counters.lock();
            FlagCounters::apply(&mut counters.loading, uid, loading);
            FlagCounters::apply(&mut counters.updating, uid, updating);
            FlagCounters::apply(&mut counters.deleting, uid, deleting);
            (
                FlagCounters::count(&counters.loading, uid) > 0,
                FlagCounters::count(&counters.updating, uid) > 0,
                FlagCounters::count(&counters.deleting, uid) > 0,
            )
        };

        if let Some(entity) = lens.get_mut(draft).entity_mut(key) {
            if let Some(loaded) = loaded {
                entity.loaded = loaded;
            }
            entity.loading = is_loading;
            entity.updating = is_updating;
            entity.deleting = is_deleting;
            entity.recompute_busy();
        }
    }

    /// Sets a collection's tri-state load marker inside an update transform.
    pub(crate) fn set_collection_loaded<T: StoreEntity>(
        &self,
        draft: &mut S,
        lens: Lens<S, EntityCollection<T>>,
        loaded: LoadState,
    ) {
        lens.get_mut(draft).loaded = loaded;
    }
}

impl<S> std::fmt::Debug for Store<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("has_transport", &self.transport.is_some())
            .field("inflight", &self.inflight.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Creature {
        id: u32,
        name: String,
        kind: String,
    }

    impl Creature {
        fn new(id: u32, name: &str, kind: &str) -> Self {
            Self {
                id,
                name: name.to_string(),
                kind: kind.to_string(),
            }
        }
    }

    impl StoreEntity for Creature {
        type Key = u32;

        fn key(&self) -> u32 {
            self.id
        }

        fn index_value(&self, index: &str) -> Option<IndexValue> {
            (index == "kind").then(|| self.kind.as_str().into())
        }
    }

    #[derive(Clone)]
    struct TestState {
        creatures: EntityCollection<Creature>,
    }

    fn creatures() -> Lens<TestState, EntityCollection<Creature>> {
        crate::lens!(TestState, creatures)
    }

    fn test_store() -> Store<TestState> {
        let uids = UidGen::new();
        let initial = TestState {
            creatures: EntityCollection::with_indices(
                &uids,
                vec![Creature::new(1, "Pikachu", "electric")],
                &["kind"],
            ),
        };
        Store::new(StoreConfig::new(initial, uids))
    }

    #[test]
    fn upsert_and_find_round_trip() {
        let store = test_store();

        store.upsert_value(
            creatures(),
            Creature::new(2, "Charmander", "fire"),
            EntityState::none(),
        );

        assert_eq!(
            store.find_value_by_key(creatures(), &2).unwrap().name,
            "Charmander"
        );
        assert_eq!(
            store
                .find_value_by_index(creatures(), "kind", &"fire".into())
                .unwrap()
                .id,
            2
        );
        assert!(store.has_entity(creatures(), &2));
    }

    #[test]
    fn update_publishes_to_subscribers() {
        let store = test_store();
        let mut rx = store.subscribe();
        assert!(!rx.has_changed().unwrap());

        store.upsert_value(creatures(), Creature::new(3, "Mew", "psychic"), EntityState::none());

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().creatures.len(), 2);
    }

    #[test]
    fn unchanged_collections_share_structure() {
        let store = test_store();
        let before = store.snapshot();

        // A write that does not touch the collection leaves it
        // reference-equal with the previous snapshot.
        store.update(|_, _| {});
        let after = store.snapshot();
        assert_eq!(before.creatures, after.creatures);

        store.upsert_value(creatures(), Creature::new(4, "Eevee", "normal"), EntityState::none());
        assert_ne!(store.snapshot().creatures, before.creatures);
    }

    #[test]
    fn reset_restores_initial_snapshot() {
        let store = test_store();

        store.upsert_value(creatures(), Creature::new(5, "Onix", "rock"), EntityState::none());
        store.remove_entities_by_keys(creatures(), &[1]);
        assert!(!store.has_entity(creatures(), &1));

        store.reset();

        let state = store.snapshot();
        assert_eq!(state.creatures.len(), 1);
        assert!(state.creatures.has(&1));
        assert_eq!(state.creatures.storage_len(), 1);
        assert_eq!(state.creatures.loaded(), LoadState::NotLoaded);
    }

    #[test]
    fn update_value_by_key_moves_index_buckets() {
        let store = test_store();

        store.update_value_by_key(creatures(), &1, |c| c.kind = "psychic".into());

        assert!(store
            .find_value_by_index(creatures(), "kind", &"electric".into())
            .is_none());
        assert_eq!(
            store
                .find_value_by_index(creatures(), "kind", &"psychic".into())
                .unwrap()
                .id,
            1
        );
    }

    #[test]
    fn overlapping_operations_keep_flags_raised() {
        let store = test_store();

        // Two operations start.
        store.update(|d, _| {
            store.adjust_collection_flags(d, creatures(), None, Some(true), None, None);
            store.adjust_collection_flags(d, creatures(), None, Some(true), None, None);
        });
        assert!(store.read(|s| s.creatures.is_loading()));

        // First ends; the flag must stay raised.
        store.update(|d, _| {
            store.adjust_collection_flags(d, creatures(), None, Some(false), None, None);
        });
        assert!(store.read(|s| s.creatures.is_loading()));
        assert!(store.read(|s| s.creatures.is_busy()));

        // Second ends; now it clears.
        store.update(|d, _| {
            store.adjust_collection_flags(d, creatures(), None, Some(false), None, None);
        });
        assert!(!store.read(|s| s.creatures.is_loading()));
        assert!(!store.read(|s| s.creatures.is_busy()));
    }

    #[test]
    fn entity_flag_counters_follow_operations() {
        let store = test_store();

        store.update(|d, _| {
            store.adjust_entity_flags(d, creatures(), &1, None, Some(true), None, None);
        });
        let entity = store.find_entity_by_key(creatures(), &1).unwrap();
        assert!(entity.loading);
        assert!(entity.busy);

        store.update(|d, _| {
            store.adjust_entity_flags(d, creatures(), &1, Some(true), Some(false), None, None);
        });
        let entity = store.find_entity_by_key(creatures(), &1).unwrap();
        assert!(!entity.loading);
        assert!(!entity.busy);
        assert!(entity.loaded);
    }

    #[test]
    fn saturating_decrement_never_underflows() {
        let store = test_store();

        store.update(|d, _| {
            store.adjust_collection_flags(d, creatures(), None, Some(false), None, None);
            store.adjust_collection_flags(d, creatures(), None, Some(true), None, None);
        });
        // The stray decrement must not mask the following increment.
        assert!(store.read(|s| s.creatures.is_loading()));
    }

    #[test]
    fn executed_queries_are_tracked() {
        let store = test_store();
        assert!(!store.is_query_executed("/creatures"));

        store.mark_query_executed("/creatures");
        assert!(store.is_query_executed("/creatures"));
    }

    #[test]
    fn upsert_preserves_uid_across_merge() {
        let store = test_store();
        let uid = store.find_entity_by_key(creatures(), &1).unwrap().uid();

        store.upsert_value(creatures(), Creature::new(1, "Raichu", "electric"), EntityState::none());

        let entity = store.find_entity_by_key(creatures(), &1).unwrap();
        assert_eq!(entity.uid(), uid);
        assert_eq!(entity.value.name, "Raichu");
    }
}
