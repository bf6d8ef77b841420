//! Reactive pokedex demo.
//!
//! This example demonstrates the store end to end:
//! - Building a state struct of entity collections with secondary indices
//! - Loading collections and single entities through a transport capability
//!   (a scripted mock here, so the demo runs offline)
//! - Request deduplication for concurrent identical loads
//! - Reactive views that only fire when their slice of state really changed
//!
//! Run with: cargo run -p pokedex_demo

use normstore_core::{
    lens, EntityCollection, EntityState, IndexValue, Lens, Method, MockTransport, Store,
    StoreConfig, StoreEntity, UidGen,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Pokemon {
    id: u32,
    name: String,
    #[serde(rename = "type")]
    kind: String,
}

impl StoreEntity for Pokemon {
    type Key = u32;

    fn key(&self) -> u32 {
        self.id
    }

    fn index_value(&self, index: &str) -> Option<IndexValue> {
        match index {
            "type" => Some(self.kind.as_str().into()),
            _ => None,
        }
    }
}

#[derive(Clone)]
struct PokedexState {
    pokemon: EntityCollection<Pokemon>,
}

fn pokemon() -> Lens<PokedexState, EntityCollection<Pokemon>> {
    lens!(PokedexState, pokemon)
}

/// Scripts the "server" the demo talks to.
fn scripted_transport() -> Arc<MockTransport> {
    let transport = Arc::new(MockTransport::new());
    transport.respond_get(
        "/api/pokemon",
        json!([
            {"id": 1, "name": "Bulbasaur", "type": "grass"},
            {"id": 4, "name": "Charmander", "type": "fire"},
            {"id": 7, "name": "Squirtle", "type": "water"},
            {"id": 25, "name": "Pikachu", "type": "electric"},
        ]),
    );
    transport.respond_get(
        "/api/pokemon/26",
        json!({"id": 26, "name": "Raichu", "type": "electric"}),
    );
    transport.respond_post("/api/pokemon", json!({"id": 133}));
    transport
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let transport = scripted_transport();

    // Explicit construction: the uid generator is shared between the initial
    // snapshot and the store so later upserts continue the sequence.
    let uids = UidGen::new();
    let initial = PokedexState {
        pokemon: EntityCollection::with_indices(&uids, Vec::new(), &["type"]),
    };
    let store = Store::new(StoreConfig::new(initial, uids).with_transport(transport.clone()));

    // Views register before any data exists and fire as it arrives.
    let mut all = store.select_values(pokemon());
    let electric = store.select_values_by_index(pokemon(), "type", "electric");

    println!("=== Load the collection ===");
    let loaded = store.load_all::<Pokemon>("/api/pokemon", pokemon(), true, false).await?;
    println!("loaded {} pokemon", loaded.len());
    if let Some(values) = all.next().await {
        for p in &values {
            println!("  #{:<3} {:<10} [{}]", p.id, p.name, p.kind);
        }
    }
    println!("electric bucket: {:?}", name_list(&electric.current()));

    println!("\n=== Local upsert merges and re-indexes ===");
    store.upsert_value(
        pokemon(),
        Pokemon {
            id: 25,
            name: "Raichu".into(),
            kind: "electric".into(),
        },
        EntityState::none(),
    );
    println!("electric bucket: {:?}", name_list(&electric.current()));

    println!("\n=== Create through the transport ===");
    let created = store
        .create_entity("/api/pokemon", pokemon(), &json!({"name": "Eevee", "type": "normal"}))
        .await?;
    println!("server assigned id {}", created["id"]);
    store.upsert_value(
        pokemon(),
        Pokemon {
            id: 133,
            name: "Eevee".into(),
            kind: "normal".into(),
        },
        EntityState::none(),
    );

    println!("\n=== Remove leaves a tombstone ===");
    store.remove_entities_by_keys(pokemon(), &[7]);
    let state = store.snapshot();
    println!(
        "{} live pokemon in {} storage slots",
        state.pokemon.len(),
        state.pokemon.storage_len()
    );

    println!("\n=== Dedup two concurrent loads of the same entity ===");
    // The gate holds the scripted response back so both loads are genuinely
    // in flight at once; the second joins the first's request.
    let gate = transport.gated();
    let (a, b, _) = tokio::join!(
        store.load_by_key::<Pokemon>("/api/pokemon/26", pokemon(), &26, true, false),
        store.load_by_key::<Pokemon>("/api/pokemon/26", pokemon(), &26, true, false),
        async { gate.open(1) },
    );
    println!("both callers got {} / {}", a?.name, b?.name);
    println!(
        "transport saw {} call(s) for /api/pokemon/26",
        transport.call_count(Method::Get, "/api/pokemon/26")
    );

    println!("\n=== Reset restores the configured snapshot ===");
    store.reset();
    println!("{} pokemon after reset", store.values(pokemon()).len());

    Ok(())
}

fn name_list(values: &[Pokemon]) -> Vec<&str> {
    values.iter().map(|p| p.name.as_str()).collect()
}
