//! Reactive selector layer: derived views over the snapshot stream.
//!
//! A [`View`] projects part of the snapshot and re-emits only on real change.
//! Change detection leans on the mutation engine's structural sharing:
//! untouched subtrees keep their references across snapshots, so most probes
//! are pointer comparisons, not data diffs.

use crate::collection::EntityCollection;
use crate::entity::{Entity, StoreEntity};
use crate::lens::Lens;
use crate::store::Store;
use crate::value::IndexValue;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;

/// A derived, read-only view over a published stream of `St` values.
///
/// `current()` pulls the projection synchronously; `next().await` resolves
/// with the projection after the next real change, or `None` once the owning
/// store is gone. Emissions coalesce: a slow consumer observes the latest
/// state, not every intermediate snapshot.
///
/// Dropping a view only stops its notifications; it never cancels a shared
/// in-flight request it may have been waiting on.
pub struct View<St: 'static, T: 'static> {
    rx: watch::Receiver<St>,
    project: Box<dyn Fn(&St) -> T + Send + Sync>,
    emit: Box<dyn FnMut(&St) -> Option<T> + Send>,
}

impl<St: Clone + Send + Sync + 'static, T: 'static> View<St, T> {
    /// Assembles a view from a probe (cheap change key), an `unchanged`
    /// comparator over probes, and a mapper producing the emitted value.
    pub(crate) fn from_parts<P: Send + 'static>(
        rx: watch::Receiver<St>,
        probe: Arc<dyn Fn(&St) -> P + Send + Sync>,
        unchanged: Arc<dyn Fn(&P, &P) -> bool + Send + Sync>,
        map: Arc<dyn Fn(&St, &P) -> T + Send + Sync>,
    ) -> Self {
        let mut last = probe(&rx.borrow());

        let emit: Box<dyn FnMut(&St) -> Option<T> + Send> = {
            let probe = Arc::clone(&probe);
            let map = Arc::clone(&map);
            Box::new(move |state: &St| {
                let next = probe(state);
                if unchanged(&last, &next) {
                    None
                } else {
                    let out = map(state, &next);
                    last = next;
                    Some(out)
                }
            })
        };

        let project: Box<dyn Fn(&St) -> T + Send + Sync> =
            Box::new(move |state: &St| map(state, &probe(state)));

        Self { rx, project, emit }
    }

    /// Returns the projection of the current snapshot.
    pub fn current(&self) -> T {
        (self.project)(&self.rx.borrow())
    }

    /// Waits for the next real change and returns the new projection.
    ///
    /// Returns `None` once the publishing store has been dropped.
    pub async fn next(&mut self) -> Option<T> {
        loop {
            self.rx.changed().await.ok()?;
            let state = self.rx.borrow_and_update().clone();
            if let Some(value) = (self.emit)(&state) {
                return Some(value);
            }
        }
    }
}

fn same_slot<T: StoreEntity>(
    a: &Option<Arc<Entity<T>>>,
    b: &Option<Arc<Entity<T>>>,
) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

fn same_elements<T: StoreEntity>(a: &[Arc<Entity<T>>], b: &[Arc<Entity<T>>]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| Arc::ptr_eq(x, y))
}

impl<S: Clone + Send + Sync + 'static> Store<S> {
    /// Projects part of the snapshot, re-emitting when the projection
    /// compares unequal.
    ///
    /// Collections compare by internal reference, so selecting a collection
    /// re-emits exactly when something in it changed.
    pub fn select<T>(&self, project: impl Fn(&S) -> T + Send + Sync + 'static) -> View<S, T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        let project = Arc::new(project);
        View::from_parts(
            self.subscribe(),
            Arc::new(move |state: &S| project(state)),
            Arc::new(|a: &T, b: &T| a == b),
            Arc::new(|_: &S, probe: &T| probe.clone()),
        )
    }

    /// Projects a collection's live values; re-emits when storage changes.
    pub fn select_values<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
    ) -> View<S, Vec<T>> {
        View::from_parts(
            self.subscribe(),
            Arc::new(move |state: &S| Arc::clone(lens.get(state).storage())),
            Arc::new(|a, b| Arc::ptr_eq(a, b)),
            Arc::new(move |state: &S, _| lens.get(state).values()),
        )
    }

    /// Projects a collection's live entities; re-emits when storage changes.
    pub fn select_entities<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
    ) -> View<S, Vec<Arc<Entity<T>>>> {
        View::from_parts(
            self.subscribe(),
            Arc::new(move |state: &S| Arc::clone(lens.get(state).storage())),
            Arc::new(|a, b| Arc::ptr_eq(a, b)),
            Arc::new(move |state: &S, _| lens.get(state).entities()),
        )
    }

    /// Projects the values passing a filter.
    ///
    /// Re-emission is suppressed while the filtered list stays element-wise
    /// identical (same length, same entity references), regardless of
    /// unrelated changes in the collection.
    pub fn select_values_by<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        filter: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> View<S, Vec<T>> {
        View::from_parts(
            self.subscribe(),
            Arc::new(move |state: &S| {
                lens.get(state)
                    .entities()
                    .into_iter()
                    .filter(|e| filter(&e.value))
                    .collect::<Vec<_>>()
            }),
            Arc::new(|a: &Vec<Arc<Entity<T>>>, b: &Vec<Arc<Entity<T>>>| same_elements(a, b)),
            Arc::new(|_: &S, probe: &Vec<Arc<Entity<T>>>| {
                probe.iter().map(|e| e.value.clone()).collect()
            }),
        )
    }

    /// Projects the entities passing a filter, with element-wise suppression.
    pub fn select_entities_by<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        filter: impl Fn(&Entity<T>) -> bool + Send + Sync + 'static,
    ) -> View<S, Vec<Arc<Entity<T>>>> {
        View::from_parts(
            self.subscribe(),
            Arc::new(move |state: &S| {
                lens.get(state)
                    .entities()
                    .into_iter()
                    .filter(|e| filter(e))
                    .collect::<Vec<_>>()
            }),
            Arc::new(|a: &Vec<Arc<Entity<T>>>, b: &Vec<Arc<Entity<T>>>| same_elements(a, b)),
            Arc::new(|_: &S, probe: &Vec<Arc<Entity<T>>>| probe.clone()),
        )
    }

    /// Projects the first value passing a filter, re-emitting on reference
    /// change of the matched entity.
    pub fn select_value_by<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        filter: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> View<S, Option<T>> {
        View::from_parts(
            self.subscribe(),
            Arc::new(move |state: &S| {
                lens.get(state).find_by(|e| filter(&e.value)).cloned()
            }),
            Arc::new(|a, b| same_slot(a, b)),
            Arc::new(|_: &S, probe: &Option<Arc<Entity<T>>>| {
                probe.as_ref().map(|e| e.value.clone())
            }),
        )
    }

    /// Projects the first entity passing a filter.
    pub fn select_entity_by<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        filter: impl Fn(&Entity<T>) -> bool + Send + Sync + 'static,
    ) -> View<S, Option<Arc<Entity<T>>>> {
        View::from_parts(
            self.subscribe(),
            Arc::new(move |state: &S| lens.get(state).find_by(|e| filter(e)).cloned()),
            Arc::new(|a, b| same_slot(a, b)),
            Arc::new(|_: &S, probe: &Option<Arc<Entity<T>>>| probe.clone()),
        )
    }

    /// Projects one index bucket as values; re-emits when storage changes.
    ///
    /// This is deliberately a cheap reference check, no array diff.
    pub fn select_values_by_index<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        index: &str,
        value: impl Into<IndexValue>,
    ) -> View<S, Vec<T>> {
        let index = index.to_string();
        let value = value.into();
        View::from_parts(
            self.subscribe(),
            Arc::new(move |state: &S| Arc::clone(lens.get(state).storage())),
            Arc::new(|a, b| Arc::ptr_eq(a, b)),
            Arc::new(move |state: &S, _| lens.get(state).values_by_index(&index, &value)),
        )
    }

    /// Projects one index bucket as entities; re-emits when the collection
    /// changes.
    pub fn select_entities_by_index<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        index: &str,
        value: impl Into<IndexValue>,
    ) -> View<S, Vec<Arc<Entity<T>>>> {
        let index = index.to_string();
        let value = value.into();
        View::from_parts(
            self.subscribe(),
            Arc::new(move |state: &S| lens.get(state).clone()),
            Arc::new(|a: &EntityCollection<T>, b: &EntityCollection<T>| a == b),
            Arc::new(move |state: &S, _| lens.get(state).entities_by_index(&index, &value)),
        )
    }

    /// Projects the first value of one index bucket.
    pub fn select_value_by_index<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        index: &str,
        value: impl Into<IndexValue>,
    ) -> View<S, Option<T>> {
        let index = index.to_string();
        let value = value.into();
        View::from_parts(
            self.subscribe(),
            Arc::new(move |state: &S| Arc::clone(lens.get(state).storage())),
            Arc::new(|a, b| Arc::ptr_eq(a, b)),
            Arc::new(move |state: &S, _| lens.get(state).value_by_index(&index, &value)),
        )
    }

    /// Projects the first entity of one index bucket.
    pub fn select_entity_by_index<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        index: &str,
        value: impl Into<IndexValue>,
    ) -> View<S, Option<Arc<Entity<T>>>> {
        let index = index.to_string();
        let value = value.into();
        View::from_parts(
            self.subscribe(),
            Arc::new(move |state: &S| lens.get(state).clone()),
            Arc::new(|a: &EntityCollection<T>, b: &EntityCollection<T>| a == b),
            Arc::new(move |state: &S, _| {
                lens.get(state)
                    .entities_by_index(&index, &value)
                    .first()
                    .cloned()
            }),
        )
    }

    /// Projects one entity's value by key, re-emitting on reference change.
    pub fn select_value_by_key<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        key: T::Key,
    ) -> View<S, Option<T>> {
        View::from_parts(
            self.subscribe(),
            Arc::new(move |state: &S| lens.get(state).slot_by_key(&key)),
            Arc::new(|a, b| same_slot(a, b)),
            Arc::new(|_: &S, probe: &Option<Arc<Entity<T>>>| {
                probe.as_ref().map(|e| e.value.clone())
            }),
        )
    }

    /// Projects one entity by key, re-emitting on reference change.
    pub fn select_entity_by_key<T: StoreEntity>(
        &self,
        lens: Lens<S, EntityCollection<T>>,
        key: T::Key,
    ) -> View<S, Option<Arc<Entity<T>>>> {
        View::from_parts(
            self.subscribe(),
            Arc::new(move |state: &S| lens.get(state).slot_by_key(&key)),
            Arc::new(|a, b| same_slot(a, b)),
            Arc::new(|_: &S, probe: &Option<Arc<Entity<T>>>| probe.clone()),
        )
    }

    /// Emits whether a keyed query has completed, as it changes.
    pub fn query_executed(&self, query: &str) -> View<HashSet<String>, bool> {
        let query = query.to_string();
        View::from_parts(
            self.executed_tx.subscribe(),
            Arc::new(move |set: &HashSet<String>| set.contains(&query)),
            Arc::new(|a: &bool, b: &bool| a == b),
            Arc::new(|_: &HashSet<String>, probe: &bool| *probe),
        )
    }
}
