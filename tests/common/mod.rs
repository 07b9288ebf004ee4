//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use normcache::{
    cache::Cache,
    query::{ComposedRequest, FieldSpec, OperationKind, QueryComposer},
    schema::{EntitySchema, FieldMeta, SchemaRegistry},
};
use serde_json::{json, Value};

/// Authors write books; books have one author; authors have one agent (no inverse).
#[allow(dead_code)]
pub fn library() -> SchemaRegistry {
    let registry = SchemaRegistry::new();
    registry.register(
        "author",
        EntitySchema::new("id")
            .field("name", FieldMeta::attribute().alias("fullName"))
            .field("books", FieldMeta::to_many("book").inverse("author"))
            .field("agent", FieldMeta::to_one("agent")),
    );
    registry.register(
        "book",
        EntitySchema::new("id")
            .field("title", FieldMeta::attribute())
            .field("author", FieldMeta::to_one("author").inverse("books")),
    );
    registry.register("agent", EntitySchema::new("id"));
    registry
}

/// `author(id) { id name books(<params>) { edges { node { id title } } } }`
#[allow(dead_code)]
pub fn author_with_books(cache: &Cache, name: &str, params: Value) -> ComposedRequest {
    let mut books = FieldSpec::leaf();
    if let Value::Object(params) = params {
        for (param, value) in params {
            books = books.param(&param, value);
        }
    }
    let books = books.select(
        "edges",
        FieldSpec::leaf().select("node", FieldSpec::leaf().select_leaf("title")),
    );
    let mut composer = QueryComposer::for_cache(cache).unwrap();
    composer
        .add_operation(
            OperationKind::Query,
            name,
            vec![(
                "author".to_string(),
                FieldSpec::node("author")
                    .param("id", "A1")
                    .select_leaf("name")
                    .select("books", books),
            )],
        )
        .unwrap();
    composer.finish()
}

/// Response payload for [author_with_books] listing `books` as `(id, title)` pairs.
#[allow(dead_code)]
pub fn author_payload(books: &[(&str, &str)]) -> Value {
    let edges: Vec<Value> = books
        .iter()
        .map(|(id, title)| json!({"node": {"id": id, "title": title}}))
        .collect();
    json!({
        "author": {
            "id": "A1",
            "name": "Ada",
            "books": {"edges": edges, "pageInfo": {"hasNextPage": false}}
        }
    })
}
