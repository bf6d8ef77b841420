//! Query coordinator: asynchronous loads and writes over the transport.
//!
//! Every network interaction goes through here. The coordinator
//! deduplicates concurrent identical loads through a multicast in-flight
//! cache, toggles reference-counted busy flags around each awaited call, and
//! restores every optimistically changed flag on failure, so state after a
//! failed operation is indistinguishable from state before it — apart from
//! the busy counters, which are cleared on every exit path.

use crate::collection::EntityCollection;
use crate::entity::{Entity, EntityState, LoadState, StoreEntity};
use crate::error::{StoreError, StoreResult};
use crate::lens::{EntityFlag, Flag, Lens};
use crate::store::Store;
use crate::transport::TransportFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

fn decode_one<T: DeserializeOwned>(value: Value) -> StoreResult<T> {
    serde_json::from_value(value).map_err(StoreError::decode)
}

/// Decodes a payload that may be a single object or an array of objects.
fn decode_many<T: DeserializeOwned>(value: Value) -> StoreResult<Vec<T>> {
    match value {
        Value::Array(_) => serde_json::from_value(value).map_err(StoreError::decode),
        other => Ok(vec![decode_one(other)?]),
    }
}

fn encode_body(body: &impl Serialize) -> StoreResult<Value> {
    serde_json::to_value(body).map_err(StoreError::decode)
}

fn batch_url<K: fmt::Display>(url: &str, keys: impl Iterator<Item = K>) -> String {
    let ids = keys.map(|k| k.to_string()).collect::<Vec<_>>().join("&ids=");
    format!("{}/?ids={}", url.trim_end_matches('/'), ids)
}

impl<S: Clone + Send + Sync + 'static> Store<S> {
    /// Issues a request at most once per key while one is outstanding.
    ///
    /// If a request for `key` is already in flight, the caller joins it and
    /// receives the same settled result; otherwise `issue` produces the real
    /// call. The cache entry is removed when the request settles, success or
    /// failure, so a later call issues fresh work. Joining callers that are
    /// dropped do not cancel the shared request.
    pub async fn load_once(
        &self,
        key: &str,
        issue: impl FnOnce() -> TransportFuture,
    ) -> StoreResult<Value> {
        let shared = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(shared) => {
                    tracing::debug!(key, "joining in-flight request");
                    shared.clone()
                }
                None => {
                    let shared = issue().shared();
                    inflight.insert(key.to_string(), shared.clone());
                    shared
                }
            }
        };

        let result = shared.clone().await;

        // Drop the settled entry, unless a newer request already took the key.
        let mut inflight = self.inflight.lock();
        if inflight.get(key).is_some_and(|current| current.ptr_eq(&shared)) {
            inflight.remove(key);
        }
        drop(inflight);

        result.map_err(StoreError::from)
    }

    /// Loads a whole collection.
    ///
    /// If the collection is already loaded and `force` is not set, the
    /// current values are returned without a network call. Otherwise the
    /// collection is marked loading, the response upserted with
    /// `entities_loaded`, and the tri-state marker set to loaded — or
    /// restored to its prior value when the call fails.
    pub async fn load_all<T>(
        &self,
        url: &str,
        lens: Lens<S, EntityCollection<T>>,
        entities_loaded: bool,
        force: bool,
    ) -> StoreResult<Vec<T>>
    where
        T: StoreEntity + DeserializeOwned,
    {
        let transport = self.transport()?;
        self.load_all_inner(url, || transport.get(url), lens, entities_loaded, force)
            .await
    }

    /// [`load_all`](Store::load_all) with a caller-issued request.
    ///
    /// The request joins the dedup cache under `key` and does not require a
    /// configured transport.
    pub async fn load_all_from<T>(
        &self,
        key: &str,
        request: TransportFuture,
        lens: Lens<S, EntityCollection<T>>,
        entities_loaded: bool,
        force: bool,
    ) -> StoreResult<Vec<T>>
    where
        T: StoreEntity + DeserializeOwned,
    {
        self.load_all_inner(key, move || request, lens, entities_loaded, force)
            .await
    }

    async fn load_all_inner<T>(
        &self,
        key: &str,
        issue: impl FnOnce() -> TransportFuture,
        lens: Lens<S, EntityCollection<T>>,
        entities_loaded: bool,
        force: bool,
    ) -> StoreResult<Vec<T>>
    where
        T: StoreEntity + DeserializeOwned,
    {
        let prior = self.read(|s| lens.get(s).loaded());
        if prior.is_loaded() && !force {
            return Ok(self.values(lens));
        }

        tracing::debug!(key, "loading collection");
        self.update(|draft, _| {
            self.adjust_collection_flags(draft, lens, None, Some(true), None, None);
            self.set_collection_loaded(draft, lens, LoadState::Loading);
        });

        let result = match self.load_once(key, issue).await {
            Ok(value) => decode_many::<T>(value),
            Err(err) => Err(err),
        };

        match &result {
            Ok(values) => {
                self.upsert_values(lens, values.clone(), EntityState::loaded(entities_loaded));
                self.update(|draft, _| {
                    self.set_collection_loaded(draft, lens, LoadState::Loaded);
                });
            }
            Err(err) => {
                tracing::debug!(key, %err, "collection load failed, restoring marker");
                self.update(|draft, _| self.set_collection_loaded(draft, lens, prior));
            }
        }

        self.update(|draft, _| {
            self.adjust_collection_flags(draft, lens, None, Some(false), None, None);
        });
        result
    }

    /// Loads one entity by key.
    ///
    /// If the entity is present and loaded and `force` is not set, the cached
    /// value is returned without a network call. On failure the entity's
    /// prior `loaded` flag is restored; `loading` clears on every exit path.
    pub async fn load_by_key<T>(
        &self,
        url: &str,
        lens: Lens<S, EntityCollection<T>>,
        key: &T::Key,
        entity_loaded: bool,
        force: bool,
    ) -> StoreResult<T>
    where
        T: StoreEntity + DeserializeOwned,
    {
        let transport = self.transport()?;
        let existing = self.find_entity_by_key(lens, key);
        self.load_entity_inner(url, || transport.get(url), lens, existing, entity_loaded, force)
            .await
    }

    /// [`load_by_key`](Store::load_by_key) with a caller-issued request.
    pub async fn load_by_key_from<T>(
        &self,
        key: &str,
        request: TransportFuture,
        lens: Lens<S, EntityCollection<T>>,
        entity_key: &T::Key,
        entity_loaded: bool,
        force: bool,
    ) -> StoreResult<T>
    where
        T: StoreEntity + DeserializeOwned,
    {
        let existing = self.find_entity_by_key(lens, entity_key);
        self.load_entity_inner(key, move || request, lens, existing, entity_loaded, force)
            .await
    }

    /// Loads the first entity matching a predicate.
    ///
    /// Behaves like [`load_by_key`](Store::load_by_key) but finds the
    /// already-present entity (if any) by predicate instead of key.
    pub async fn load_by<T>(
        &self,
        url: &str,
        lens: Lens<S, EntityCollection<T>>,
        predicate: impl FnMut(&T) -> bool,
        entity_loaded: bool,
        force: bool,
    ) -> StoreResult<T>
    where
        T: StoreEntity + DeserializeOwned,
    {
        let transport = self.transport()?;
        let mut predicate = predicate;
        let existing = self.find_entity_by(lens, |e| predicate(&e.value));
        self.load_entity_inner(url, || transport.get(url), lens, existing, entity_loaded, force)
            .await
    }

    async fn load_entity_inner<T>(
        &self,
        key: &str,
        issue: impl FnOnce() -> TransportFuture,
        lens: Lens<S, EntityCollection<T>>,
        existing: Option<Arc<Entity<T>>>,
        entity_loaded: bool,
        force: bool,
    ) -> StoreResult<T>
    where
        T: StoreEntity + DeserializeOwned,
    {
        let prior_loaded = existing.as_ref().map(|e| e.loaded).unwrap_or(false);
        if let Some(entity) = &existing {
            if prior_loaded && !force {
                return Ok(entity.value.clone());
            }
        }
        let existing_key = existing.map(|e| e.value.key());

        tracing::debug!(key, "loading entity");
        self.update(|draft, _| {
            self.adjust_collection_flags(draft, lens, None, Some(true), None, None);
            if let Some(entity_key) = &existing_key {
                self.adjust_entity_flags(draft, lens, entity_key, None, Some(true), None, None);
            }
        });

        let result = match self.load_once(key, issue).await {
            Ok(value) => decode_one::<T>(value),
            Err(err) => Err(err),
        };

        match &result {
            Ok(data) => {
                let data_key = data.key();
                self.upsert_value(lens, data.clone(), EntityState::loaded(entity_loaded));
                self.update(|draft, _| {
                    self.adjust_entity_flags(
                        draft,
                        lens,
                        &data_key,
                        Some(entity_loaded),
                        None,
                        None,
                        None,
                    );
                });
            }
            Err(_) => {
                if let Some(entity_key) = &existing_key {
                    self.update(|draft, _| {
                        self.adjust_entity_flags(
                            draft,
                            lens,
                            entity_key,
                            Some(prior_loaded),
                            None,
                            None,
                            None,
                        );
                    });
                }
            }
        }

        self.update(|draft, _| {
            if let Some(entity_key) = &existing_key {
                self.adjust_entity_flags(draft, lens, entity_key, None, Some(false), None, None);
            }
            self.adjust_collection_flags(draft, lens, None, Some(false), None, None);
        });

        result
    }

    /// Loads one entity gated on a dependent flag elsewhere in the state.
    ///
    /// Skips the call (returning `None`) when the flag already reads
    /// `Some(true)` and `force` is not set. While the call runs, the flag is
    /// `None`; it becomes `Some(true)` on success and reverts to its prior
    /// value on failure.
    pub async fn load_dependent<T>(
        &self,
        url: &str,
        lens: Lens<S, EntityCollection<T>>,
        flag: Flag<S>,
        entity_loaded: bool,
        force: bool,
    ) -> StoreResult<Option<T>>
    where
        T: StoreEntity + DeserializeOwned,
    {
        let transport = self.transport()?;
        let prior = self.read(|s| flag.get(s));
        if prior == Some(true) && !force {
            return Ok(None);
        }

        self.update(|draft, _| {
            self.adjust_collection_flags(draft, lens, None, Some(true), None, None);
            flag.set(draft, None);
        });

        let result = match self.load_once(url, || transport.get(url)).await {
            Ok(value) => decode_one::<T>(value),
            Err(err) => Err(err),
        };

        let outcome = match result {
            Ok(data) => {
                self.upsert_value(lens, data.clone(), EntityState::loaded(entity_loaded));
                self.update(|draft, _| flag.set(draft, Some(true)));
                Ok(Some(data))
            }
            Err(err) => {
                self.update(|draft, _| flag.set(draft, prior));
                Err(err)
            }
        };

        self.update(|draft, _| {
            self.adjust_collection_flags(draft, lens, None, Some(false), None, None);
        });
        outcome
    }

    /// Loads a list of entities gated on a dependent flag.
    ///
    /// List form of [`load_dependent`](Store::load_dependent); returns an
    /// empty list when the flag says the data is already there.
    pub async fn load_all_dependent<T>(
        &self,
        url: &str,
        lens: Lens<S, EntityCollection<T>>,
        flag: Flag<S>,
        entities_loaded: bool,
        force: bool,
    ) -> StoreResult<Vec<T>>
    where
        T: StoreEntity + DeserializeOwned,
    {
        let transport = self.transport()?;
        let prior = self.read(|s| flag.get(s));
        if prior == Some(true) && !force {
            return Ok(Vec::new());
        }

        self.update(|draft, _| {
            self.adjust_collection_flags(draft, lens, None, Some(true), None, None);
            flag.set(draft, None);
        });

        let result = match self.load_once(url, || transport.get(url)).await {
            Ok(value) => decode_many::<T>(value),
            Err(err) => Err(err),
        };

        let outcome = match result {
            Ok(values) => {
                self.upsert_values(lens, values.clone(), EntityState::loaded(entities_loaded));
                self.update(|draft, _| flag.set(draft, Some(true)));
                Ok(values)
            }
            Err(err) => {
                self.update(|draft, _| flag.set(draft, prior));
                Err(err)
            }
        };

        self.update(|draft, _| {
            self.adjust_collection_flags(draft, lens, None, Some(false), None, None);
        });
        outcome
    }

    /// Loads the entities behind a set of dependent keys in one request.
    ///
    /// Dependent keys whose flag already reads `Some(true)` are filtered out
    /// unless `force` is set; if nothing remains, no call is made. The
    /// surviving keys are appended to the URL as repeated `ids` parameters.
    /// Each pending dependent's flag is `None` while the call runs, flips to
    /// `Some(true)` on success, and reverts to its prior value on failure.
    pub async fn load_batch<T, D>(
        &self,
        url: &str,
        lens: Lens<S, EntityCollection<T>>,
        dependent: Lens<S, EntityCollection<D>>,
        keys: &[D::Key],
        flag: EntityFlag<D>,
        entities_loaded: bool,
        force: bool,
    ) -> StoreResult<Vec<T>>
    where
        T: StoreEntity + DeserializeOwned,
        D: StoreEntity,
        D::Key: fmt::Display,
    {
        let transport = self.transport()?;

        let pending: Vec<(D::Key, Option<bool>)> = self.read(|s| {
            let collection = dependent.get(s);
            keys.iter()
                .map(|k| {
                    let state = collection.value_by_key(k).and_then(|v| flag.get(&v));
                    (k.clone(), state)
                })
                .filter(|(_, state)| force || !matches!(state, Some(true)))
                .collect()
        });
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        self.update(|draft, _| {
            self.adjust_collection_flags(draft, lens, None, Some(true), None, None);
            for (dep_key, _) in &pending {
                dependent
                    .get_mut(draft)
                    .update_entity(dep_key, |e| flag.set(&mut e.value, None));
            }
        });

        let request_url = batch_url(url, pending.iter().map(|(k, _)| k));
        tracing::debug!(url = %request_url, pending = pending.len(), "loading batch");

        let result = match self.load_once(&request_url, || transport.get(&request_url)).await {
            Ok(value) => decode_many::<T>(value),
            Err(err) => Err(err),
        };

        let outcome = match result {
            Ok(values) => {
                self.upsert_values(lens, values.clone(), EntityState::loaded(entities_loaded));
                self.update(|draft, _| {
                    for (dep_key, _) in &pending {
                        dependent
                            .get_mut(draft)
                            .update_entity(dep_key, |e| flag.set(&mut e.value, Some(true)));
                    }
                });
                Ok(values)
            }
            Err(err) => {
                self.update(|draft, _| {
                    for (dep_key, prior) in &pending {
                        dependent
                            .get_mut(draft)
                            .update_entity(dep_key, |e| flag.set(&mut e.value, *prior));
                    }
                });
                Err(err)
            }
        };

        self.update(|draft, _| {
            self.adjust_collection_flags(draft, lens, None, Some(false), None, None);
        });
        outcome
    }

    /// Loads a collection at most once per URL for the store's lifetime.
    ///
    /// Skips the call once the URL has completed successfully, unless
    /// `force` is set; see [`Store::is_query_executed`].
    pub async fn load_all_once<T>(
        &self,
        url: &str,
        lens: Lens<S, EntityCollection<T>>,
        entities_loaded: bool,
        force: bool,
    ) -> StoreResult<Vec<T>>
    where
        T: StoreEntity + DeserializeOwned,
    {
        let transport = self.transport()?;
        if self.is_query_executed(url) && !force {
            return Ok(Vec::new());
        }

        self.update(|draft, _| {
            self.adjust_collection_flags(draft, lens, None, Some(true), None, None);
        });

        let result = match self.load_once(url, || transport.get(url)).await {
            Ok(value) => decode_many::<T>(value),
            Err(err) => Err(err),
        };

        if let Ok(values) = &result {
            self.upsert_values(lens, values.clone(), EntityState::loaded(entities_loaded));
            self.mark_query_executed(url);
        }

        self.update(|draft, _| {
            self.adjust_collection_flags(draft, lens, None, Some(false), None, None);
        });
        result
    }

    /// Creates an entity through the transport.
    ///
    /// Raises the collection's `adding` flag around the call and returns the
    /// raw response; the store does not interpret write responses, so
    /// upserting the created entity is the caller's decision.
    pub async fn create_entity<T: StoreEntity>(
        &self,
        url: &str,
        lens: Lens<S, EntityCollection<T>>,
        body: &impl Serialize,
    ) -> StoreResult<Value> {
        let transport = self.transport()?;
        let body = encode_body(body)?;

        self.update(|draft, _| {
            self.adjust_collection_flags(draft, lens, Some(true), None, None, None);
        });

        let result = transport.post(url, body).await.map_err(StoreError::from);

        self.update(|draft, _| {
            self.adjust_collection_flags(draft, lens, Some(false), None, None, None);
        });
        result
    }

    /// Updates an entity through the transport.
    ///
    /// If the entity is present it is marked `updating` for the duration of
    /// the call (the collection too); if not, the collection is marked
    /// `adding`. Returns the raw response.
    pub async fn update_by_key<T: StoreEntity>(
        &self,
        url: &str,
        lens: Lens<S, EntityCollection<T>>,
        key: &T::Key,
        body: &impl Serialize,
    ) -> StoreResult<Value> {
        let transport = self.transport()?;
        let body = encode_body(body)?;
        let existing = self.find_entity_by_key(lens, key);
        let prior_loaded = existing.as_ref().map(|e| e.loaded);
        let exists = existing.is_some();

        self.update(|draft, _| {
            if exists {
                self.adjust_collection_flags(draft, lens, None, None, Some(true), None);
                self.adjust_entity_flags(draft, lens, key, None, None, Some(true), None);
            } else {
                self.adjust_collection_flags(draft, lens, Some(true), None, None, None);
            }
        });

        let result = transport.put(url, body).await.map_err(StoreError::from);

        self.update(|draft, _| {
            if exists {
                self.adjust_collection_flags(draft, lens, None, None, Some(false), None);
                self.adjust_entity_flags(draft, lens, key, prior_loaded, None, Some(false), None);
            } else {
                self.adjust_collection_flags(draft, lens, Some(false), None, None, None);
            }
        });
        result
    }

    /// Deletes an entity through the transport.
    ///
    /// Fails fast with [`StoreError::NotFound`] when the key is absent and
    /// with [`StoreError::Conflict`] when the entity is already being deleted
    /// by another in-flight operation — in both cases before touching any
    /// counter. The entity is not removed from the collection; callers decide
    /// what to do with the local copy once the server confirms.
    pub async fn delete_by_key<T: StoreEntity>(
        &self,
        url: &str,
        lens: Lens<S, EntityCollection<T>>,
        key: &T::Key,
    ) -> StoreResult<Value> {
        let transport = self.transport()?;
        let Some(entity) = self.find_entity_by_key(lens, key) else {
            return Err(StoreError::not_found(key));
        };
        if entity.deleting {
            return Err(StoreError::conflict(key));
        }

        self.update(|draft, _| {
            self.adjust_collection_flags(draft, lens, None, None, None, Some(true));
            self.adjust_entity_flags(draft, lens, key, None, None, None, Some(true));
        });

        let result = transport.delete(url).await.map_err(StoreError::from);

        self.update(|draft, _| {
            self.adjust_collection_flags(draft, lens, None, None, None, Some(false));
            self.adjust_entity_flags(draft, lens, key, None, None, None, Some(false));
        });
        result
    }
}
