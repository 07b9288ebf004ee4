//! Performance benchmarks for response normalization
//!
//! These benchmarks feed synthetic catalogue responses through the cache to measure:
//! - First-sight normalization (entity creation, bond registration)
//! - Re-normalization of an identical response (the steady-state refresh path)
//! - Entity removal with many inbound bonds
//! - A full fetch round-trip through an in-memory transport
//!
//! Run with: cargo bench

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use normcache::{
    cache::Cache,
    query::{ComposedRequest, FieldSpec, OperationKind, QueryComposer},
    schema::{EntitySchema, FieldMeta, SchemaRegistry},
    transport::{AbortController, GraphQLResponse, Transport},
    CacheError,
};
use serde_json::{json, Value};

const AUTHORS: usize = 50;
const BOOKS_PER_AUTHOR: usize = 20;

fn library() -> SchemaRegistry {
    let registry = SchemaRegistry::new();
    registry.register(
        "author",
        EntitySchema::new("id")
            .field("name", FieldMeta::attribute())
            .field("books", FieldMeta::to_many("book").inverse("author")),
    );
    registry.register(
        "book",
        EntitySchema::new("id")
            .field("title", FieldMeta::attribute())
            .field("author", FieldMeta::to_one("author").inverse("books")),
    );
    registry
}

fn catalogue_request(cache: &Cache) -> ComposedRequest {
    let mut composer = QueryComposer::for_cache(cache).unwrap();
    composer
        .add_operation(
            OperationKind::Query,
            "Catalogue",
            vec![(
                "authors".to_string(),
                FieldSpec::list("author").select_leaf("name").select(
                    "books",
                    FieldSpec::leaf().param("first", BOOKS_PER_AUTHOR as i64).select(
                        "edges",
                        FieldSpec::leaf().select("node", FieldSpec::leaf().select_leaf("title")),
                    ),
                ),
            )],
        )
        .unwrap();
    composer.finish()
}

fn catalogue_payload() -> Value {
    let authors: Vec<Value> = (0..AUTHORS)
        .map(|a| {
            let edges: Vec<Value> = (0..BOOKS_PER_AUTHOR)
                .map(|b| json!({"node": {"id": format!("B{a}-{b}"), "title": format!("Book {b}")}}))
                .collect();
            json!({
                "id": format!("A{a}"),
                "name": format!("Author {a}"),
                "books": {"edges": edges, "pageInfo": {"hasNextPage": true}}
            })
        })
        .collect();
    json!({ "authors": authors })
}

fn bench_first_normalization(c: &mut Criterion) {
    let payload = catalogue_payload();
    c.bench_function("normalize_fresh_cache", |b| {
        b.iter_batched(
            || {
                let cache = Cache::new(library());
                let request = catalogue_request(&cache);
                (cache, request)
            },
            |(cache, request)| {
                cache
                    .serialize(&request.expectations, &payload, &[])
                    .unwrap()
                    .entities_created
                    .len()
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_repeat_normalization(c: &mut Criterion) {
    let payload = catalogue_payload();
    let cache = Cache::new(library());
    let request = catalogue_request(&cache);
    cache.serialize(&request.expectations, &payload, &[]).unwrap();

    c.bench_function("normalize_identical_response", |b| {
        b.iter(|| {
            cache
                .serialize(&request.expectations, &payload, &[])
                .unwrap()
                .roots_written
        });
    });
}

fn bench_remove_with_inbound_bonds(c: &mut Criterion) {
    let payload = catalogue_payload();
    c.bench_function("remove_author_with_books", |b| {
        b.iter_batched(
            || {
                let cache = Cache::new(library());
                let request = catalogue_request(&cache);
                cache.serialize(&request.expectations, &payload, &[]).unwrap();
                let author = cache
                    .lookup_by_identifier("author", &json!("A0"))
                    .unwrap()
                    .identity;
                (cache, author)
            },
            |(cache, author)| {
                cache.remove_pod(&author).unwrap();
                cache.entity_count()
            },
            BatchSize::SmallInput,
        );
    });
}

struct InMemoryTransport(GraphQLResponse);

impl Transport for InMemoryTransport {
    async fn execute(&self, _request: &ComposedRequest) -> Result<GraphQLResponse, CacheError> {
        Ok(self.0.clone())
    }
}

fn bench_fetch_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let transport = InMemoryTransport(GraphQLResponse {
        data: catalogue_payload(),
        errors: Vec::new(),
    });
    let cache = Cache::new(library());
    let request = catalogue_request(&cache);

    c.bench_function("fetch_round_trip", |b| {
        b.to_async(&rt).iter(|| async {
            cache
                .fetch(&transport, &request, AbortController::new().signal())
                .await
                .unwrap()
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(50);
    targets =
        bench_first_normalization,
        bench_repeat_normalization,
        bench_remove_with_inbound_bonds,
        bench_fetch_round_trip
}

criterion_main!(benches);
