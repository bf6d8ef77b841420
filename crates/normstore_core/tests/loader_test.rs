//! Integration tests for the query coordinator: deduplication, flag
//! bookkeeping and failure recovery.

mod common;

use common::*;
use normstore_core::{
    EntityFlag, Flag, LoadState, Method, MockTransport, StoreError, TransportError,
};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn near_simultaneous_loads_hit_transport_once() {
    let transport = Arc::new(MockTransport::new());
    transport.respond_get("/pokemon/1", pokemon_json(1, "Pikachu", "electric"));
    let gate = transport.gated();
    let store = empty_store(Arc::clone(&transport));

    let first = store.load_by_key("/pokemon/1", pokemon(), &1, true, false);
    let second = store.load_by_key("/pokemon/1", pokemon(), &1, true, false);
    tokio::pin!(first);
    tokio::pin!(second);

    assert!(futures::poll!(first.as_mut()).is_pending());
    assert!(futures::poll!(second.as_mut()).is_pending());

    gate.open(1);
    let (a, b) = futures::join!(first, second);
    assert_eq!(a.unwrap().name, "Pikachu");
    assert_eq!(b.unwrap().name, "Pikachu");
    assert_eq!(transport.call_count(Method::Get, "/pokemon/1"), 1);
}

#[tokio::test]
async fn rejected_load_restores_loaded_and_propagates() {
    let transport = Arc::new(MockTransport::new());
    transport.fail(Method::Get, "/pokemon/1", TransportError::new("offline"));
    let store = seeded_store(Arc::clone(&transport));

    // Pikachu is in the store; mark it loaded through an initial upsert state.
    assert!(store.find_entity_by_key(pokemon(), &1).unwrap().loaded);

    let err = store
        .load_by_key::<Pokemon>("/pokemon/1", pokemon(), &1, true, true)
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::Transport(_)));
    let entity = store.find_entity_by_key(pokemon(), &1).unwrap();
    assert!(entity.loaded);
    assert!(!entity.loading);
    assert!(!entity.busy);
    assert!(!store.read(|s| s.pokemon.is_loading()));
}

#[tokio::test]
async fn load_all_marks_collection_and_upserts() {
    let transport = Arc::new(MockTransport::new());
    transport.respond_get(
        "/pokemon",
        json!([
            pokemon_json(1, "Pikachu", "electric"),
            pokemon_json(2, "Charmander", "fire"),
        ]),
    );
    let store = empty_store(Arc::clone(&transport));
    assert_eq!(store.read(|s| s.pokemon.loaded()), LoadState::NotLoaded);

    let values = store
        .load_all::<Pokemon>("/pokemon", pokemon(), true, false)
        .await
        .unwrap();

    assert_eq!(values.len(), 2);
    assert_eq!(store.read(|s| s.pokemon.loaded()), LoadState::Loaded);
    assert_eq!(
        store
            .find_values_by_index(pokemon(), "type", &"fire".into())
            .len(),
        1
    );

    // Loaded collections skip the network on the next call.
    let cached = store
        .load_all::<Pokemon>("/pokemon", pokemon(), true, false)
        .await
        .unwrap();
    assert_eq!(cached.len(), 2);
    assert_eq!(transport.call_count(Method::Get, "/pokemon"), 1);
}

#[tokio::test]
async fn load_dependent_flips_flag_and_skips_when_done() {
    let transport = Arc::new(MockTransport::new());
    transport.respond_get("/trainers/1/starter", pokemon_json(25, "Pikachu", "electric"));
    let store = seeded_store(Arc::clone(&transport));

    let starter_flag = Flag::<AppState>::new(
        |s| s.trainers.value_by_key(&1).and_then(|t| t.pokedex_loaded),
        |s, v| {
            s.trainers
                .update_entity(&1, move |e| e.value.pokedex_loaded = v)
        },
    );

    let loaded = store
        .load_dependent::<Pokemon>("/trainers/1/starter", pokemon(), starter_flag, true, false)
        .await
        .unwrap();
    assert_eq!(loaded.unwrap().id, 25);
    assert_eq!(
        store.find_value_by_key(trainers(), &1).unwrap().pokedex_loaded,
        Some(true)
    );

    // Flag says loaded: second call is a no-op without a network call.
    let skipped = store
        .load_dependent::<Pokemon>("/trainers/1/starter", pokemon(), starter_flag, true, false)
        .await
        .unwrap();
    assert!(skipped.is_none());
    assert_eq!(transport.call_count(Method::Get, "/trainers/1/starter"), 1);
}

#[tokio::test]
async fn load_dependent_failure_restores_flag() {
    let transport = Arc::new(MockTransport::new());
    transport.fail(
        Method::Get,
        "/trainers/1/starter",
        TransportError::new("offline"),
    );
    let store = seeded_store(Arc::clone(&transport));

    let starter_flag = Flag::<AppState>::new(
        |s| s.trainers.value_by_key(&1).and_then(|t| t.pokedex_loaded),
        |s, v| {
            s.trainers
                .update_entity(&1, move |e| e.value.pokedex_loaded = v)
        },
    );

    let err = store
        .load_dependent::<Pokemon>("/trainers/1/starter", pokemon(), starter_flag, true, false)
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::Transport(_)));
    // The tri-state flag reverted to its pre-call value.
    assert_eq!(
        store.find_value_by_key(trainers(), &1).unwrap().pokedex_loaded,
        Some(false)
    );
    assert!(!store.read(|s| s.pokemon.is_loading()));
}

#[tokio::test]
async fn load_batch_filters_already_loaded_dependents() {
    let transport = Arc::new(MockTransport::new());
    transport.respond_get(
        "/pokedex/?ids=2",
        json!([pokemon_json(2, "Charmander", "fire")]),
    );
    let store = seeded_store(Arc::clone(&transport));
    // Trainers 1 and 3 are already loaded and must be filtered out.
    store.upsert_values(
        trainers(),
        vec![
            Trainer {
                id: 2,
                name: "Blue".into(),
                pokedex_loaded: None,
            },
            Trainer {
                id: 3,
                name: "Green".into(),
                pokedex_loaded: Some(true),
            },
        ],
        normstore_core::EntityState::none(),
    );
    store.update_value_by_key(trainers(), &1, |t| t.pokedex_loaded = Some(true));

    let flag = EntityFlag::<Trainer>::new(
        |t| t.pokedex_loaded,
        |t, v| t.pokedex_loaded = v,
    );

    let loaded = store
        .load_batch::<Pokemon, Trainer>(
            "/pokedex",
            pokemon(),
            trainers(),
            &[1, 2, 3],
            flag,
            true,
            false,
        )
        .await
        .unwrap();

    assert_eq!(loaded.len(), 1);
    // Only trainer 2 was pending; its flag flipped on success.
    assert_eq!(
        store.find_value_by_key(trainers(), &2).unwrap().pokedex_loaded,
        Some(true)
    );
    assert_eq!(transport.call_count(Method::Get, "/pokedex/?ids=2"), 1);

    // Everything loaded: a second batch makes no call at all.
    let empty = store
        .load_batch::<Pokemon, Trainer>(
            "/pokedex",
            pokemon(),
            trainers(),
            &[1, 2, 3],
            flag,
            true,
            false,
        )
        .await
        .unwrap();
    assert!(empty.is_empty());
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test]
async fn load_batch_failure_restores_each_flag() {
    let transport = Arc::new(MockTransport::new());
    transport.fail(
        Method::Get,
        "/pokedex/?ids=1",
        TransportError::new("offline"),
    );
    let store = seeded_store(Arc::clone(&transport));

    let flag = EntityFlag::<Trainer>::new(
        |t| t.pokedex_loaded,
        |t, v| t.pokedex_loaded = v,
    );

    let err = store
        .load_batch::<Pokemon, Trainer>(
            "/pokedex",
            pokemon(),
            trainers(),
            &[1],
            flag,
            true,
            false,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::Transport(_)));
    assert_eq!(
        store.find_value_by_key(trainers(), &1).unwrap().pokedex_loaded,
        Some(false)
    );
    assert!(!store.read(|s| s.pokemon.is_loading()));
}

#[tokio::test]
async fn create_update_delete_round_trip() {
    let transport = Arc::new(MockTransport::new());
    transport.respond_get("/pokemon/2", pokemon_json(2, "Charmander", "fire"));
    transport.respond_post("/pokemon", json!({"id": 2}));
    transport.respond_put("/pokemon/2", json!({"ok": true}));
    transport.respond_delete("/pokemon/2", json!(null));
    let store = seeded_store(Arc::clone(&transport));

    let created = store
        .create_entity("/pokemon", pokemon(), &json!({"name": "Charmander"}))
        .await
        .unwrap();
    assert_eq!(created["id"], 2);
    assert!(!store.read(|s| s.pokemon.is_adding()));

    // The caller upserts once the server confirms; do that via a load.
    store
        .load_by_key::<Pokemon>("/pokemon/2", pokemon(), &2, true, false)
        .await
        .unwrap();

    store
        .update_by_key("/pokemon/2", pokemon(), &2, &json!({"name": "Charmeleon"}))
        .await
        .unwrap();
    let entity = store.find_entity_by_key(pokemon(), &2).unwrap();
    assert!(entity.loaded);
    assert!(!entity.updating);

    store.delete_by_key("/pokemon/2", pokemon(), &2).await.unwrap();
    let entity = store.find_entity_by_key(pokemon(), &2).unwrap();
    assert!(!entity.deleting);
    assert!(!entity.busy);
    assert!(!store.read(|s| s.pokemon.is_busy()));
}

#[tokio::test]
async fn delete_requires_presence() {
    let transport = Arc::new(MockTransport::new());
    let store = empty_store(Arc::clone(&transport));

    let err = store
        .delete_by_key("/pokemon/9", pokemon(), &9)
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::NotFound { .. }));
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn load_all_once_tracks_executed_queries() {
    let transport = Arc::new(MockTransport::new());
    transport.respond_get("/pokemon", json!([pokemon_json(1, "Pikachu", "electric")]));
    let store = empty_store(Arc::clone(&transport));

    let mut executed = store.query_executed("/pokemon");
    assert!(!executed.current());

    store
        .load_all_once::<Pokemon>("/pokemon", pokemon(), true, false)
        .await
        .unwrap();

    assert_eq!(executed.next().await, Some(true));
    assert!(store.is_query_executed("/pokemon"));

    let skipped = store
        .load_all_once::<Pokemon>("/pokemon", pokemon(), true, false)
        .await
        .unwrap();
    assert!(skipped.is_empty());
    assert_eq!(transport.call_count(Method::Get, "/pokemon"), 1);
}

#[tokio::test]
async fn load_all_from_joins_dedup_cache_without_transport_config() {
    // External calls work without any configured transport.
    let uids = normstore_core::UidGen::new();
    let initial = AppState {
        pokemon: normstore_core::EntityCollection::with_indices(&uids, Vec::new(), &["type"]),
        trainers: normstore_core::EntityCollection::new(&uids),
    };
    let store = normstore_core::Store::new(normstore_core::StoreConfig::new(initial, uids));

    let request: normstore_core::TransportFuture = Box::pin(async {
        Ok(json!([
            {"id": 4, "name": "Bulbasaur", "type": "grass"}
        ]))
    });

    let values = store
        .load_all_from::<Pokemon>("seed-batch", request, pokemon(), true, false)
        .await
        .unwrap();

    assert_eq!(values.len(), 1);
    assert_eq!(store.find_value_by_key(pokemon(), &4).unwrap().name, "Bulbasaur");
    assert_eq!(store.read(|s| s.pokemon.loaded()), LoadState::Loaded);
}

#[tokio::test]
async fn overlapping_collection_loads_keep_loading_raised() {
    let transport = Arc::new(MockTransport::new());
    transport.respond_get("/pokemon/1", pokemon_json(1, "Pikachu", "electric"));
    transport.respond_get("/pokemon/2", pokemon_json(2, "Charmander", "fire"));
    let gate = transport.gated();
    let store = empty_store(Arc::clone(&transport));

    let first = store.load_by_key("/pokemon/1", pokemon(), &1, true, false);
    let second = store.load_by_key("/pokemon/2", pokemon(), &2, true, false);
    tokio::pin!(first);
    tokio::pin!(second);

    assert!(futures::poll!(first.as_mut()).is_pending());
    assert!(futures::poll!(second.as_mut()).is_pending());
    assert!(store.read(|s| s.pokemon.is_loading()));
    assert!(store.read(|s| s.pokemon.is_busy()));

    gate.open(1);
    first.await.unwrap();
    // One of two loads settled: the collection must still read as loading.
    assert!(store.read(|s| s.pokemon.is_loading()));

    gate.open(1);
    second.await.unwrap();
    assert!(!store.read(|s| s.pokemon.is_loading()));
    assert!(!store.read(|s| s.pokemon.is_busy()));
}
