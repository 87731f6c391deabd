//! Admission control, deadlines, cancellation, and concurrent resolution.

mod common;

use common::*;
use fathom_memory::metrics::{op, InMemoryMetrics};
use fathom_memory::store::GraphStore;
use fathom_memory::MemoryGraph;
use fathom_types::error::FathomError;
use fathom_types::memory::{EntityMention, EntityType, FactType, MemoryUnit};
use fathom_types::search::SearchRequest;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn query() -> SearchRequest {
    SearchRequest::new(BANK, "anything", vec![1.0, 0.0, 0.0, 0.0])
}

async fn gated_graph(
    config: fathom_types::config::FathomConfig,
) -> (Arc<MemoryGraph>, Arc<GatedStore>, Arc<InMemoryMetrics>, MemoryUnit) {
    let store = Arc::new(GatedStore::closed());
    let unit = MemoryUnit::new(BANK, "a fact", FactType::World, vec![1.0, 0.0, 0.0, 0.0]);
    store.insert_unit(&unit).await.unwrap();
    let metrics = Arc::new(InMemoryMetrics::new());
    let graph = MemoryGraph::builder(config)
        .store(store.clone())
        .metrics(metrics.clone())
        .build()
        .unwrap();
    (Arc::new(graph), store, metrics, unit)
}

async fn wait_for_active(graph: &MemoryGraph, n: usize) {
    for _ in 0..200 {
        if graph.occupancy().active == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("never reached {n} active searches");
}

#[tokio::test]
async fn test_saturated_admission_fails_with_capacity() {
    let mut config = config();
    config.concurrency.max_concurrent_searches = 1;
    config.concurrency.admission_timeout_ms = Some(50);
    let (graph, store, _metrics, unit) = gated_graph(config).await;

    let first = {
        let graph = graph.clone();
        tokio::spawn(async move { graph.search(&query()).await })
    };
    wait_for_active(&graph, 1).await;

    let err = graph.search(&query()).await.unwrap_err();
    assert!(matches!(err, FathomError::Capacity(_)), "got {err:?}");

    store.open();
    let resp = first.await.unwrap().unwrap();
    assert_eq!(resp.results.len(), 1);
    assert_eq!(resp.results[0].unit.id, unit.id);
    assert_eq!(graph.occupancy().active, 0);
    graph.shutdown().await;
}

#[tokio::test]
async fn test_search_deadline_leaves_no_side_effects() {
    let mut config = config();
    config.search.timeout_ms = Some(50);
    let (graph, store, metrics, unit) = gated_graph(config).await;

    let err = graph.search(&query()).await.unwrap_err();
    assert!(matches!(err, FathomError::Timeout(_)), "got {err:?}");
    let stored = store.get_unit(BANK, unit.id).await.unwrap().unwrap();
    assert_eq!(stored.access_count, 0);
    assert_eq!(graph.occupancy().active, 0);

    let stats = metrics.get(op::SEARCH, BANK).unwrap();
    assert_eq!(stats.count, 1);
    assert_eq!(stats.errors, 1);
    graph.shutdown().await;
}

#[tokio::test]
async fn test_cancel_during_search() {
    let (graph, store, _metrics, unit) = gated_graph(config()).await;
    let (tx, rx) = watch::channel(false);

    let pending = {
        let graph = graph.clone();
        tokio::spawn(async move { graph.search_with_cancel(&query(), rx).await })
    };
    wait_for_active(&graph, 1).await;
    tx.send(true).unwrap();
    store.open();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, FathomError::Cancelled));
    let stored = store.get_unit(BANK, unit.id).await.unwrap().unwrap();
    assert_eq!(stored.access_count, 0);
    graph.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_search_on_both_stores() {
    for h in harnesses(config()) {
        let unit = MemoryUnit::new(BANK, "x", FactType::World, vec![1.0, 0.0, 0.0, 0.0]);
        h.graph.store().insert_unit(&unit).await.unwrap();
        let (_tx, rx) = watch::channel(true);
        let err = h.graph.search_with_cancel(&query(), rx).await.unwrap_err();
        assert!(matches!(err, FathomError::Cancelled), "{}", h.name);

        let stored = h.graph.store().get_unit(BANK, unit.id).await.unwrap().unwrap();
        assert_eq!(stored.access_count, 0, "{}", h.name);
        h.graph.shutdown().await;
    }
}

#[tokio::test]
async fn test_concurrent_searches_within_capacity() {
    let (graph, store, _metrics, _unit) = gated_graph(config()).await;
    store.open();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let graph = graph.clone();
            tokio::spawn(async move { graph.search(&query()).await })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().results.len(), 1);
    }
    graph.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_resolution_yields_one_entity() {
    for h in harnesses(config()) {
        let graph = Arc::new(h.graph);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let graph = graph.clone();
                tokio::spawn(async move {
                    graph
                        .resolve_entity(BANK, &EntityMention::new("Alice", EntityType::Person))
                        .await
                })
            })
            .collect();
        let mut ids: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();
        ids.dedup();
        assert_eq!(ids.len(), 1, "{}", h.name);

        let entities = graph
            .store()
            .entity_candidates(BANK, EntityType::Person)
            .await
            .unwrap();
        assert_eq!(entities.len(), 1, "{}", h.name);
        assert_eq!(entities[0].mention_count, 16);
        graph.shutdown().await;
    }
}

#[tokio::test]
async fn test_search_after_shutdown_is_refused() {
    let (graph, store, _metrics, _unit) = gated_graph(config()).await;
    store.open();
    graph.shutdown().await;
    let err = graph.search(&query()).await.unwrap_err();
    assert!(matches!(err, FathomError::Capacity(_)));
}
