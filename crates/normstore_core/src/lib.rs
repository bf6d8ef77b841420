//! # normstore
//!
//! A normalized, reactive, in-memory entity store.
//!
//! `normstore` keeps client-held copies of server entities consistent,
//! deduplicates concurrent fetches, and exposes fine-grained reactive views
//! with minimal notification churn.
//!
//! This crate provides:
//! - [`EntityCollection`]: normalized storage per entity type, with a
//!   primary-key index and optional secondary indices
//! - A copy-on-write mutation engine ([`Store::update`]) producing immutable
//!   snapshots with structural sharing
//! - A query coordinator (`load_*`, `create_entity`, `update_by_key`,
//!   `delete_by_key`) with in-flight request deduplication and
//!   reference-counted busy flags
//! - A selector layer ([`View`] and the `select_*` constructors) that
//!   re-emits only on real change
//!
//! ## Architecture
//!
//! The caller defines a plain state struct whose fields are
//! `EntityCollection`s, builds it with a [`UidGen`], and hands it to the
//! store together with an optional [`Transport`] capability:
//!
//! ```rust,ignore
//! #[derive(Clone)]
//! struct AppState {
//!     pokemon: EntityCollection<Pokemon>,
//! }
//!
//! let uids = UidGen::new();
//! let initial = AppState {
//!     pokemon: EntityCollection::with_indices(&uids, Vec::new(), &["type"]),
//! };
//! let store = Store::new(
//!     StoreConfig::new(initial, uids).with_transport(Arc::new(client)),
//! );
//!
//! let pokemon = lens!(AppState, pokemon);
//! let mut electric = store.select_values_by_index(pokemon, "type", "electric");
//!
//! store.load_all("/api/pokemon", pokemon, true, false).await?;
//! while let Some(values) = electric.next().await {
//!     // re-renders only when the electric bucket really changed
//! }
//! ```
//!
//! ## Key invariants
//!
//! 1. **Single write path**: every mutation goes through [`Store::update`];
//!    writes are serialized and readers never observe a partial state
//! 2. **Structural sharing**: untouched subtrees stay reference-identical
//!    across snapshots, so change detection is pointer comparison
//! 3. **Balanced counters**: busy/loading flags are reference counts, raised
//!    and lowered on every exit path of every asynchronous operation
//! 4. **One request per key**: concurrent identical loads share a single
//!    transport call and a single settled result

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod collection;
mod config;
mod entity;
mod error;
mod lens;
mod load;
mod select;
mod store;
mod transport;
mod value;

pub use collection::EntityCollection;
pub use config::StoreConfig;
pub use entity::{Entity, EntityState, LoadState, StoreEntity, UidGen};
pub use error::{StoreError, StoreResult, TransportError};
pub use lens::{EntityFlag, Flag, Lens};
pub use select::View;
pub use store::Store;
pub use transport::{Method, MockGate, MockTransport, Transport, TransportFuture, TransportResult};
pub use value::IndexValue;
