//! Fetch lifecycle tests
//!
//! A fixture [Transport] answers with a canned response after a delay, which lets these tests
//! abort requests in flight and interleave overlapping requests.

mod common;

use normcache::{
    cache::Cache,
    query::ComposedRequest,
    transport::{AbortController, FetchOutcome, GraphQLResponse, Transport},
    CacheError,
};
use serde_json::json;
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use test_log::test;

use common::{author_payload, author_with_books, library};

struct FixtureTransport {
    result: Result<GraphQLResponse, CacheError>,
    delay: Duration,
    calls: AtomicUsize,
}

impl FixtureTransport {
    fn new(data: serde_json::Value, delay_ms: u64) -> Self {
        FixtureTransport {
            result: Ok(GraphQLResponse {
                data,
                errors: Vec::new(),
            }),
            delay: Duration::from_millis(delay_ms),
            calls: AtomicUsize::new(0),
        }
    }

    fn failing(error: CacheError) -> Self {
        FixtureTransport {
            result: Err(error),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }
}

impl Transport for FixtureTransport {
    async fn execute(&self, _request: &ComposedRequest) -> Result<GraphQLResponse, CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.result.clone()
    }
}

#[test(tokio::test)]
async fn test_fetch_normalizes_response() {
    let cache = Cache::new(library());
    let request = author_with_books(&cache, "AuthorWithBooks", json!({"first": 2}));
    let transport = FixtureTransport::new(author_payload(&[("B1", "Dune")]), 0);

    let outcome = cache
        .fetch(&transport, &request, AbortController::new().signal())
        .await
        .unwrap();
    match outcome {
        FetchOutcome::Completed(report) => assert_eq!(report.entities_created.len(), 2),
        FetchOutcome::Aborted => panic!("request was not aborted"),
    }
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    assert!(cache.lookup_by_identifier("book", &json!("B1")).is_some());
}

#[test(tokio::test)]
async fn test_abort_in_flight_writes_nothing() {
    let cache = Cache::new(library());
    let request = author_with_books(&cache, "AuthorWithBooks", json!({"first": 2}));
    let transport = FixtureTransport::new(author_payload(&[("B1", "Dune")]), 500);
    let controller = AbortController::new();

    let (outcome, _) = tokio::join!(
        cache.fetch(&transport, &request, controller.signal()),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            controller.abort();
        }
    );
    assert_eq!(outcome.unwrap(), FetchOutcome::Aborted);
    assert_eq!(cache.entity_count(), 0);
    assert_eq!(cache.root_count(), 0);
}

#[test(tokio::test)]
async fn test_aborted_signal_skips_transport() {
    let cache = Cache::new(library());
    let request = author_with_books(&cache, "AuthorWithBooks", json!({"first": 2}));
    let transport = FixtureTransport::new(author_payload(&[]), 0);
    let controller = AbortController::new();
    controller.abort();

    let outcome = cache
        .fetch(&transport, &request, controller.signal())
        .await
        .unwrap();
    assert_eq!(outcome, FetchOutcome::Aborted);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
}

#[test(tokio::test)]
async fn test_transport_failure_propagates() {
    let cache = Cache::new(library());
    let request = author_with_books(&cache, "AuthorWithBooks", json!({"first": 2}));
    let transport = FixtureTransport::failing(CacheError::Transport("503".to_string()));

    let err = cache
        .fetch(&transport, &request, AbortController::new().signal())
        .await
        .unwrap_err();
    assert_eq!(err, CacheError::Transport("503".to_string()));
    assert!(!err.is_programmer_error());
    assert_eq!(cache.entity_count(), 0);
}

#[test(tokio::test)]
async fn test_overlapping_requests_apply_in_completion_order() {
    let cache = Cache::new(library());
    let request = author_with_books(&cache, "AuthorWithBooks", json!({"first": 2}));
    let slow = FixtureTransport::new(author_payload(&[("B1", "Old title")]), 100);
    let fast = FixtureTransport::new(author_payload(&[("B1", "New title")]), 10);

    let (first, second) = tokio::join!(
        cache.fetch(&slow, &request, AbortController::new().signal()),
        cache.fetch(&fast, &request, AbortController::new().signal()),
    );
    assert!(matches!(first.unwrap(), FetchOutcome::Completed(_)));
    assert!(matches!(second.unwrap(), FetchOutcome::Completed(_)));

    let book = cache.lookup_by_identifier("book", &json!("B1")).unwrap();
    assert_eq!(book.scalar("title"), Some(&json!("Old title")));
    assert!(cache.check_bonds().is_empty());
}
