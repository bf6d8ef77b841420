//! Shared fixtures for integration tests.

#![allow(dead_code)]

use normstore_core::{
    lens, EntityCollection, IndexValue, Lens, MockTransport, Store, StoreConfig, StoreEntity,
    UidGen,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Domain entity with a secondary index on its type and a mergeable
/// optional field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pokemon {
    pub id: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub ability: Option<String>,
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

    fn merge(self, previous: &Self) -> Self {
        Self {
            ability: self.ability.or_else(|| previous.ability.clone()),
            ..self
        }
    }
}

/// Dependent entity carrying a tri-state flag used by the dependent loaders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trainer {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub pokedex_loaded: Option<bool>,
}

impl StoreEntity for Trainer {
    type Key = u32;

    fn key(&self) -> u32 {
        self.id
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pokemon: EntityCollection<Pokemon>,
    pub trainers: EntityCollection<Trainer>,
}

pub fn pokemon() -> Lens<AppState, EntityCollection<Pokemon>> {
    lens!(AppState, pokemon)
}

pub fn trainers() -> Lens<AppState, EntityCollection<Trainer>> {
    lens!(AppState, trainers)
}

pub fn pikachu() -> Pokemon {
    Pokemon {
        id: 1,
        name: "Pikachu".into(),
        kind: "electric".into(),
        ability: None,
    }
}

pub fn pokemon_json(id: u32, name: &str, kind: &str) -> Value {
    json!({"id": id, "name": name, "type": kind})
}

/// Store seeded with Pikachu and one trainer, indexed on `type`.
pub fn seeded_store(transport: Arc<MockTransport>) -> Store<AppState> {
    let uids = UidGen::new();
    let initial = AppState {
        pokemon: EntityCollection::with_indices(&uids, vec![pikachu()], &["type"]),
        trainers: EntityCollection::with_values(
            &uids,
            vec![Trainer {
                id: 1,
                name: "Red".into(),
                pokedex_loaded: Some(false),
            }],
        ),
    };
    Store::new(StoreConfig::new(initial, uids).with_transport(transport))
}

/// Store with empty collections.
pub fn empty_store(transport: Arc<MockTransport>) -> Store<AppState> {
    let uids = UidGen::new();
    let initial = AppState {
        pokemon: EntityCollection::with_indices(&uids, Vec::new(), &["type"]),
        trainers: EntityCollection::new(&uids),
    };
    Store::new(StoreConfig::new(initial, uids).with_transport(transport))
}
