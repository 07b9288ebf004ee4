//! Normalization integration tests
//!
//! Each test composes a request with [QueryComposer], feeds a canned response through
//! [Cache::serialize] and inspects the resulting entities, root cells and windows.

mod common;

use normcache::{
    cache::{Cache, RootKey, RootKind},
    event::CacheEvent,
    query::{FieldSpec, OperationKind, QueryComposer},
    transport::{GraphQLError, GraphQLResponse},
    CacheError,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use test_log::test;

use common::{author_payload, author_with_books, library};

fn vars(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn identity_of(cache: &Cache, entity_type: &str, id: &str) -> normcache::identity::Identity {
    cache
        .lookup_by_identifier(entity_type, &json!(id))
        .unwrap_or_else(|| panic!("{entity_type} {id} not cached"))
        .identity
}

#[test]
fn test_edges_populate_both_sides() {
    let cache = Cache::new(library());
    let request = author_with_books(&cache, "AuthorWithBooks", json!({"first": 2}));
    let report = cache
        .serialize(
            &request.expectations,
            &author_payload(&[("B1", "Dune"), ("B2", "Emma")]),
            &[],
        )
        .unwrap();
    assert_eq!(report.entities_created.len(), 3);
    assert!(report.skipped.is_empty());

    let author = cache.lookup_by_identifier("author", &json!("A1")).unwrap();
    let b1 = identity_of(&cache, "book", "B1");
    let b2 = identity_of(&cache, "book", "B2");
    assert_eq!(author.scalar("name"), Some(&json!("Ada")));
    assert_eq!(
        author.members("books"),
        Some(&BTreeSet::from([b1.clone(), b2.clone()]))
    );
    assert!(author.field("books").unwrap().loaded);
    assert!(!author.has_unsaved_changes());

    let book = cache.lookup_by_identity(&b1).unwrap();
    assert_eq!(book.node("author"), Some(&author.identity));
    assert_eq!(book.scalar("title"), Some(&json!("Dune")));
    assert!(book.field("author").unwrap().is_settled());

    let top = cache
        .root(&RootKey::top("author", "author", RootKind::Node))
        .unwrap();
    assert_eq!(top.node_value(), Some(&author.identity));

    let view = cache
        .window(&RootKey::field(&author.identity, "books"), &vars(json!({"first": 2})))
        .unwrap();
    assert_eq!(view.visible, vec![b1, b2]);
    assert_eq!(view.window.page_info(), &json!({"hasNextPage": false}));
    assert!(cache.check_bonds().is_empty());
}

#[test]
fn test_field_error_leaves_field_unloaded() {
    let cache = Cache::new(library());
    let request = author_with_books(&cache, "AuthorWithBooks", json!({"first": 2}));
    let response = GraphQLResponse::from_json(
        r#"{
            "data": {"author": {"id": "A1", "books": null}},
            "errors": [
                {"message": "name is private", "path": ["author", "name"]},
                {"message": "books unavailable", "path": ["author", "books"]},
                {"message": "rate limited"}
            ]
        }"#,
    )
    .unwrap();
    let report = cache
        .serialize_response(&request.expectations, &response)
        .unwrap();
    assert_eq!(report.errors_attached, 2);
    assert_eq!(report.unmatched_errors, vec!["rate limited".to_string()]);

    let author = cache.lookup_by_identifier("author", &json!("A1")).unwrap();
    let name = author.field("name").unwrap();
    assert!(!name.loaded);
    assert_eq!(name.errors, vec!["name is private".to_string()]);
    let books = author.field("books").unwrap();
    assert!(!books.loaded);
    assert_eq!(books.errors, vec!["books unavailable".to_string()]);

    let id = author.field("id").unwrap();
    assert!(id.loaded);
    assert_eq!(id.value, normcache::cache::RootValue::Scalar(json!("A1")));

    // A later successful write clears the attached errors.
    cache
        .serialize(&request.expectations, &author_payload(&[]), &[])
        .unwrap();
    let name = cache.field(&author.identity, "name").unwrap();
    assert!(name.loaded);
    assert!(name.errors.is_empty());
}

#[test]
fn test_error_inside_edge_lands_on_that_item() {
    let cache = Cache::new(library());
    let request = author_with_books(&cache, "AuthorWithBooks", json!({"first": 2}));
    let response = GraphQLResponse::from_json(
        r#"{
            "data": {"author": {"id": "A1", "name": "Ada", "books": {
                "edges": [
                    {"node": {"id": "B1", "title": "Dune"}},
                    {"node": {"id": "B2"}}
                ],
                "pageInfo": {"hasNextPage": false}
            }}},
            "errors": [
                {"message": "title withheld", "path": ["author", "books", "edges", 1, "node", "title"]}
            ]
        }"#,
    )
    .unwrap();
    let report = cache
        .serialize_response(&request.expectations, &response)
        .unwrap();
    assert_eq!(report.errors_attached, 1);
    assert!(report.unmatched_errors.is_empty());

    let b1 = identity_of(&cache, "book", "B1");
    let b2 = identity_of(&cache, "book", "B2");
    let title = cache.field(&b2, "title").unwrap();
    assert!(!title.loaded);
    assert_eq!(title.errors, vec!["title withheld".to_string()]);

    let sibling = cache.field(&b1, "title").unwrap();
    assert!(sibling.loaded);
    assert!(sibling.errors.is_empty());
    assert_eq!(sibling.scalar(), Some(&json!("Dune")));
    let author = identity_of(&cache, "author", "A1");
    assert_eq!(
        cache.field(&author, "books").unwrap().members(),
        Some(&BTreeSet::from([b1, b2]))
    );
    assert!(cache.check_bonds().is_empty());
}

#[test]
fn test_error_inside_node_list_lands_on_that_item() {
    let cache = Cache::new(library());
    let request = shelf_request(&cache);
    let response = GraphQLResponse::from_json(
        r#"{
            "data": {"author": {"id": "A1", "books": [
                {"id": "B1", "title": "Dune"},
                {"id": "B2", "title": null}
            ]}},
            "errors": [
                {"message": "title withheld", "path": ["author", "books", 1, "title"]}
            ]
        }"#,
    )
    .unwrap();
    let report = cache
        .serialize_response(&request.expectations, &response)
        .unwrap();
    assert_eq!(report.errors_attached, 1);

    let b1 = identity_of(&cache, "book", "B1");
    let b2 = identity_of(&cache, "book", "B2");
    assert_eq!(
        cache.field(&b2, "title").unwrap().errors,
        vec!["title withheld".to_string()]
    );
    assert!(!cache.field(&b2, "title").unwrap().loaded);
    assert!(cache.field(&b1, "title").unwrap().errors.is_empty());
    assert!(cache.field(&b1, "title").unwrap().loaded);
    assert!(cache.field(&b2, "author").unwrap().is_settled());
}

#[test]
fn test_windows_are_scoped_by_variables() {
    let cache = Cache::new(library());
    let first_page = author_with_books(&cache, "FirstPage", json!({"first": 2}));
    let second_page = author_with_books(&cache, "NextPage", json!({"first": 2, "after": "c2"}));
    cache
        .serialize(
            &first_page.expectations,
            &author_payload(&[("B1", "Dune"), ("B2", "Emma")]),
            &[],
        )
        .unwrap();
    cache
        .serialize(&second_page.expectations, &author_payload(&[("B3", "Ulysses")]), &[])
        .unwrap();

    let author = identity_of(&cache, "author", "A1");
    let [b1, b2, b3] = ["B1", "B2", "B3"].map(|id| identity_of(&cache, "book", id));
    let key = RootKey::field(&author, "books");
    assert_eq!(
        cache.root(&key).unwrap().members(),
        Some(&BTreeSet::from([b1.clone(), b2.clone(), b3.clone()]))
    );
    assert_eq!(cache.root(&key).unwrap().windows().len(), 2);

    let first = cache.window(&key, &vars(json!({"first": 2}))).unwrap();
    assert_eq!(first.visible, vec![b1.clone(), b2.clone()]);
    let next = cache
        .window(&key, &vars(json!({"after": "c2", "first": 2})))
        .unwrap();
    assert_eq!(next.visible, vec![b3.clone()]);
    let same = cache
        .window(&key, &vars(json!({"first": 2, "last": null})))
        .unwrap();
    assert_eq!(same.window.key(), first.window.key());

    cache.remove_pod(&b1).unwrap();
    let first = cache.window(&key, &vars(json!({"first": 2}))).unwrap();
    assert_eq!(first.visible, vec![b2]);
    assert!(!first.window.records().contains(&b1));
    assert!(cache.check_bonds().is_empty());
}

#[test]
fn test_repeated_response_is_idempotent() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let cache = Cache::new(library()).with_events(tx);
    let request = author_with_books(&cache, "AuthorWithBooks", json!({"first": 2}));
    let payload = author_payload(&[("B1", "Dune"), ("B2", "Emma")]);

    cache.serialize(&request.expectations, &payload, &[]).unwrap();
    let mut first_pass = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, CacheEvent::EntityCreated(..)) {
            first_pass += 1;
        }
    }
    assert_eq!(first_pass, 3);

    let entities = cache.entity_count();
    let roots = cache.root_count();
    let report = cache.serialize(&request.expectations, &payload, &[]).unwrap();
    assert!(report.entities_created.is_empty());
    assert_eq!(cache.entity_count(), entities);
    assert_eq!(cache.root_count(), roots);
    assert!(
        rx.try_recv().is_err(),
        "an identical response changes nothing"
    );
}

#[test]
fn test_unexpected_structure_is_skipped() {
    let cache = Cache::new(library());
    let request = author_with_books(&cache, "AuthorWithBooks", json!({"first": 2}));
    let report = cache
        .serialize(
            &request.expectations,
            &json!({"author": {"id": "A1", "name": "Ada", "books": "oops", "rank": 3}}),
            &[],
        )
        .unwrap();
    assert!(report.skipped.contains(&"author.books".to_string()));
    assert!(report.skipped.contains(&"author.rank".to_string()));

    let author = cache.lookup_by_identifier("author", &json!("A1")).unwrap();
    assert_eq!(author.scalar("name"), Some(&json!("Ada")));
    assert!(!author.field("books").unwrap().loaded);

    // Entities without an identifier are skipped, their siblings still land.
    let report = cache
        .serialize(
            &request.expectations,
            &author_payload(&[("", "Untitled"), ("B2", "Emma")]),
            &[],
        )
        .unwrap();
    assert_eq!(report.skipped, vec!["author.books.edges.0.node".to_string()]);
    assert_eq!(cache.entity_count(), 2);
}

#[test]
fn test_numeric_and_string_identifiers_match() {
    let cache = Cache::new(library());
    let request = author_with_books(&cache, "AuthorWithBooks", json!({"first": 2}));
    cache
        .serialize(&request.expectations, &author_payload(&[("7", "Dune")]), &[])
        .unwrap();
    let book = cache.lookup_by_identifier("book", &json!(7)).unwrap();
    assert_eq!(book.identifier.as_deref(), Some("7"));
    assert_eq!(book.identity, identity_of(&cache, "book", "7"));
}

fn shelf_request(cache: &Cache) -> normcache::query::ComposedRequest {
    let mut composer = QueryComposer::for_cache(cache).unwrap();
    composer
        .add_operation(
            OperationKind::Query,
            "Shelf",
            vec![(
                "author".to_string(),
                FieldSpec::node("author").select(
                    "books",
                    FieldSpec::list("book").select_leaf("title"),
                ),
            )],
        )
        .unwrap();
    composer.finish()
}

#[test]
fn test_node_list_replaces_membership() {
    let cache = Cache::new(library());
    let request = shelf_request(&cache);
    let shelf = |ids: &[&str]| {
        let books: Vec<Value> = ids.iter().map(|id| json!({"id": id, "title": id})).collect();
        json!({"author": {"id": "A1", "books": books}})
    };
    cache
        .serialize(&request.expectations, &shelf(&["B1", "B2"]), &[])
        .unwrap();
    cache
        .serialize(&request.expectations, &shelf(&["B2", "B3"]), &[])
        .unwrap();

    let author = identity_of(&cache, "author", "A1");
    let [b1, b2, b3] = ["B1", "B2", "B3"].map(|id| identity_of(&cache, "book", id));
    let books = cache.field(&author, "books").unwrap();
    assert_eq!(books.members(), Some(&BTreeSet::from([b2.clone(), b3.clone()])));
    assert!(books.is_settled());
    assert_eq!(cache.field(&b1, "author").unwrap().node(), None);
    assert_eq!(cache.field(&b3, "author").unwrap().node(), Some(&author));
    let view = cache.window(&RootKey::field(&author, "books"), &Map::new()).unwrap();
    assert_eq!(view.visible, vec![b2, b3]);
    assert!(cache.check_bonds().is_empty());
}

#[test]
fn test_null_to_one_clears_both_sides() {
    let cache = Cache::new(library());
    let mut composer = QueryComposer::for_cache(&cache).unwrap();
    composer
        .add_operation(
            OperationKind::Query,
            "BookAuthor",
            vec![(
                "book".to_string(),
                FieldSpec::node("book").select("author", FieldSpec::leaf().select_leaf("id")),
            )],
        )
        .unwrap();
    let request = composer.finish();

    cache
        .serialize(
            &request.expectations,
            &json!({"book": {"id": "B1", "author": {"id": "A1"}}}),
            &[],
        )
        .unwrap();
    let book = identity_of(&cache, "book", "B1");
    let author = identity_of(&cache, "author", "A1");
    assert!(cache.field(&author, "books").unwrap().members().unwrap().contains(&book));

    cache
        .serialize(
            &request.expectations,
            &json!({"book": {"id": "B1", "author": null}}),
            &[],
        )
        .unwrap();
    let field = cache.field(&book, "author").unwrap();
    assert_eq!(field.node(), None);
    assert!(field.is_settled());
    assert!(cache.field(&author, "books").unwrap().members().unwrap().is_empty());
    assert!(cache.check_bonds().is_empty());
}

#[test]
fn test_top_level_connection() {
    let cache = Cache::new(library());
    let mut composer = QueryComposer::for_cache(&cache).unwrap();
    composer
        .add_operation(
            OperationKind::Query,
            "Catalogue",
            vec![(
                "allBooks".to_string(),
                FieldSpec::connection("book").of("books").param("first", 5).select(
                    "edges",
                    FieldSpec::leaf().select("node", FieldSpec::leaf().select_leaf("title")),
                ),
            )],
        )
        .unwrap();
    let request = composer.finish();
    assert!(request.text.contains("allBooks: books(first: $first_0_0)"));

    cache
        .serialize(
            &request.expectations,
            &json!({"allBooks": {"edges": [
                {"node": {"id": "B1", "title": "Dune"}},
                {"node": {"id": "B2", "title": "Emma"}}
            ]}}),
            &[],
        )
        .unwrap();
    let key = RootKey::top("book", "books", RootKind::Connection);
    let root = cache.root(&key).unwrap();
    assert_eq!(root.members().map(|m| m.len()), Some(2));
    assert!(root.loaded());

    let b1 = identity_of(&cache, "book", "B1");
    cache.remove_pod(&b1).unwrap();
    let view = cache.window(&key, &vars(json!({"first": 5}))).unwrap();
    assert_eq!(view.visible, vec![identity_of(&cache, "book", "B2")]);
}

#[test]
fn test_local_edits_survive_until_synced() {
    let cache = Cache::new(library());
    let request = author_with_books(&cache, "AuthorWithBooks", json!({"first": 2}));
    cache
        .serialize(&request.expectations, &author_payload(&[("B1", "Dune")]), &[])
        .unwrap();
    let book = identity_of(&cache, "book", "B1");

    cache.set_field(&book, "title", json!("Dune Messiah")).unwrap();
    let title = cache.field(&book, "title").unwrap();
    assert!(!title.is_settled());
    assert_eq!(title.initial_value, normcache::cache::RootValue::Scalar(json!("Dune")));

    assert!(matches!(
        cache.set_field(&book, "author", json!("A1")),
        Err(CacheError::TypeMismatch { .. })
    ));

    cache
        .serialize(
            &request.expectations,
            &author_payload(&[("B1", "Dune Messiah")]),
            &[GraphQLError::new("ignored").at(["elsewhere"])],
        )
        .unwrap();
    assert!(cache.field(&book, "title").unwrap().is_settled());
}
