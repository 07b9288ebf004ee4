//! # normcache
//!
//! A client-side, normalized object-graph cache for GraphQL-style query responses.
//!
//! ## Overview
//!
//! normcache decomposes server responses into uniquely identified entities, stores every field of
//! every entity in its own independently observable root cell, and keeps both sides of every
//! declared relationship consistent: receiving (or setting) `book.author` also updates
//! `author.books`, without a second round-trip or manual bookkeeping.
//!
//! ### Key Features
//!
//! - **Stable identities**: entities get a process-local `(type, sequence)` identity before any
//!   server identifier is known, and keep it for their whole lifetime
//! - **Per-field root cells**: scalar, to-one and to-many roots with persisted/current values,
//!   a `loaded` flag, value processors and attached server errors
//! - **Bond index**: reverse references from each identity to every root that points at it, so
//!   inverse updates and entity removal never scan the store
//! - **Connection windows**: pagination-scoped views over to-many roots, keyed canonically by
//!   the request variables, with local additions/removals tracked separately
//! - **Expectation-driven normalization**: response shapes are decided once at query composition
//!   time and looked up by `(response_key, level)` while normalizing
//! - **Partial-failure tolerance**: field errors attach to the addressed root, unexpected
//!   structures are logged and skipped, the rest of the response still lands
//!
//! ## Architecture
//!
//! - **[`identity`]**: `Identity`, `EntityType`, `IdentityAllocator`
//! - **[`schema`]**: Field catalogues consumed from the schema layer (`SchemaRegistry`)
//! - **[`cache`]**: Root cells, the bond index, connection windows and the `Cache` itself
//! - **[`query`]**: `QueryComposer` and the `ExpectationTable` it produces
//! - **[`normalize`]**: The response walker
//! - **[`transport`]**: The network boundary, abortable fetches
//! - **[`event`]**: Change notifications
//!
//! ## Quick Start
//!
//! ```rust
//! use normcache::{
//!     cache::{Cache, RootKey},
//!     query::{FieldSpec, OperationKind, QueryComposer},
//!     schema::{EntitySchema, FieldMeta, SchemaRegistry},
//! };
//! use serde_json::json;
//!
//! # fn main() -> Result<(), normcache::CacheError> {
//! let schemas = SchemaRegistry::new();
//! schemas.register(
//!     "author",
//!     EntitySchema::new("id").field("books", FieldMeta::to_many("book").inverse("author")),
//! );
//! schemas.register(
//!     "book",
//!     EntitySchema::new("id")
//!         .field("title", FieldMeta::attribute())
//!         .field("author", FieldMeta::to_one("author").inverse("books")),
//! );
//! let cache = Cache::new(schemas);
//!
//! let mut composer = QueryComposer::for_cache(&cache)?;
//! composer.add_operation(
//!     OperationKind::Query,
//!     "Author",
//!     vec![(
//!         "author".to_string(),
//!         FieldSpec::node("author").select(
//!             "books",
//!             FieldSpec::leaf().select(
//!                 "edges",
//!                 FieldSpec::leaf().select("node", FieldSpec::leaf().select_leaf("title")),
//!             ),
//!         ),
//!     )],
//! )?;
//! let request = composer.finish();
//!
//! let data = json!({"author": {"id": "A1", "books": {"edges": [{"node": {"id": "B1", "title": "Dune"}}]}}});
//! cache.serialize(&request.expectations, &data, &[])?;
//!
//! let book = cache.lookup_by_identifier("book", &json!("B1")).unwrap();
//! let author = cache.lookup_by_identifier("author", &json!("A1")).unwrap();
//! assert_eq!(book.node("author"), Some(&author.identity));
//! assert!(cache.root(&RootKey::field(&author.identity, "books"))?.contains(&book.identity));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod entity;
pub mod error;
pub mod event;
pub mod identity;
pub mod normalize;
pub mod query;
pub mod schema;
pub mod transport;

pub use error::*;
