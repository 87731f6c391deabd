//! End-to-end retain → link → search scenarios against both stores.

mod common;

use chrono::{Duration, TimeZone, Utc};
use common::*;
use fathom_types::memory::{EntityType, FactType, LinkType, RetainRequest};
use fathom_types::search::{SearchRequest, ThinkingBudget};

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

async fn retain(h: &Harness, facts: Vec<fathom_types::memory::CandidateFact>) -> Vec<fathom_types::memory::UnitId> {
    let report = h
        .graph
        .retain(&RetainRequest {
            bank_id: BANK.to_string(),
            facts,
            causal: Vec::new(),
        })
        .await
        .unwrap();
    h.graph.wait_idle().await;
    assert_eq!(h.graph.job_stats().failed, 0, "{}", h.name);
    report.unit_ids
}

#[tokio::test]
async fn test_entity_link_bridges_dissimilar_facts() {
    for h in harnesses(config()) {
        let ids = retain(
            &h,
            vec![
                mentioning(
                    fact("Alice works at Google", [1.0, 0.0, 0.0, 0.0], t0()),
                    &[("Alice", EntityType::Person), ("Google", EntityType::Org)],
                ),
                mentioning(
                    fact("Alice loves hiking", [0.0, 0.0, 1.0, 0.0], t0() + Duration::hours(1)),
                    &[("Alice", EntityType::Person)],
                ),
            ],
        )
        .await;

        let links = h.graph.store().outgoing_links(BANK, ids[0]).await.unwrap();
        assert!(
            links
                .iter()
                .any(|l| l.to_unit_id == ids[1] && l.link_type == LinkType::Entity && l.weight == 1.0),
            "{}",
            h.name
        );

        let req = SearchRequest::new(BANK, "What does Alice do?", vec![1.0, 0.0, 0.0, 0.0])
            .with_entities()
            .at(t0() + Duration::days(1));
        let resp = h.graph.search(&req).await.unwrap();
        let found: Vec<_> = resp.results.iter().map(|r| r.unit.id).collect();
        assert!(found.contains(&ids[0]), "{}", h.name);
        assert!(found.contains(&ids[1]), "{}", h.name);
        assert_eq!(found[0], ids[0], "{}", h.name);

        let mut names: Vec<String> = resp
            .entities
            .unwrap()
            .into_iter()
            .map(|e| e.canonical_name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["Alice".to_string(), "Google".to_string()], "{}", h.name);
        h.graph.shutdown().await;
    }
}

#[tokio::test]
async fn test_entity_link_spans_years() {
    for h in harnesses(config()) {
        let ids = retain(
            &h,
            vec![
                mentioning(
                    fact("Alice joined the chess club", [1.0, 0.0, 0.0, 0.0], t0()),
                    &[("Alice", EntityType::Person)],
                ),
                mentioning(
                    fact("Alice moved to Lisbon", [0.0, 1.0, 0.0, 0.0], t0() + Duration::days(800)),
                    &[("Alice", EntityType::Person)],
                ),
            ],
        )
        .await;

        let links = h.graph.store().outgoing_links(BANK, ids[1]).await.unwrap();
        assert_eq!(links.len(), 1, "{}", h.name);
        assert_eq!(links[0].link_type, LinkType::Entity);
        assert_eq!(links[0].weight, 1.0);
        assert_eq!(links[0].to_unit_id, ids[0]);

        let req = SearchRequest::new(BANK, "Where does Alice live?", vec![0.0, 1.0, 0.0, 0.0]);
        let resp = h.graph.search(&req).await.unwrap();
        assert_eq!(resp.results.len(), 2, "{}", h.name);
        h.graph.shutdown().await;
    }
}

#[tokio::test]
async fn test_link_weight_properties() {
    for h in harnesses(config()) {
        let ids = retain(
            &h,
            vec![
                mentioning(
                    fact("a", [1.0, 0.0, 0.0, 0.0], t0()),
                    &[("Alice", EntityType::Person)],
                ),
                fact("b", [0.8, 0.6, 0.0, 0.0], t0() + Duration::hours(6)),
                mentioning(
                    fact("c", [0.0, 0.0, 1.0, 0.0], t0() + Duration::days(400)),
                    &[("Alice", EntityType::Person)],
                ),
                fact("d", [0.0, 0.0, 0.0, 1.0], t0() + Duration::hours(23)),
            ],
        )
        .await;
        let (a, b, c, d) = (ids[0], ids[1], ids[2], ids[3]);

        let from_a = h.graph.store().outgoing_links(BANK, a).await.unwrap();
        let weight = |to, kind| {
            from_a
                .iter()
                .find(|l| l.to_unit_id == to && l.link_type == kind)
                .map(|l| l.weight)
        };
        assert!((weight(b, LinkType::Temporal).unwrap() - 0.75).abs() < 1e-6, "{}", h.name);
        assert!((weight(b, LinkType::Semantic).unwrap() - 0.8).abs() < 1e-5, "{}", h.name);
        assert_eq!(weight(d, LinkType::Temporal), Some(0.3), "{}", h.name);
        assert_eq!(weight(d, LinkType::Semantic), None);
        assert_eq!(weight(c, LinkType::Entity), Some(1.0));
        assert_eq!(weight(c, LinkType::Temporal), None);

        for id in &ids {
            for link in h.graph.store().outgoing_links(BANK, *id).await.unwrap() {
                match link.link_type {
                    LinkType::Temporal => assert!((0.3..=1.0).contains(&link.weight)),
                    LinkType::Semantic => assert!(link.weight >= 0.7),
                    LinkType::Entity => assert_eq!(link.weight, 1.0),
                    other => panic!("unexpected {other} link"),
                }
            }
        }
        h.graph.shutdown().await;
    }
}

#[tokio::test]
async fn test_relink_creates_no_edges() {
    for h in harnesses(config()) {
        let facts = (0..6)
            .map(|i| {
                mentioning(
                    fact(
                        &format!("meeting {i} with Bob"),
                        [1.0, i as f32 * 0.1, 0.0, 0.0],
                        t0() + Duration::hours(i),
                    ),
                    &[("Bob", EntityType::Person)],
                )
            })
            .collect();
        let ids = retain(&h, facts).await;
        let before = h.graph.bank_stats(BANK).await.unwrap();
        assert!(before.total_links() > 0);

        let report = h.graph.relink(BANK).await.unwrap();
        assert_eq!(report.total(), 0, "{}", h.name);
        let again = h.graph.build_links(BANK, ids[3]).await.unwrap();
        assert_eq!(again.total(), 0, "{}", h.name);
        assert_eq!(
            h.graph.bank_stats(BANK).await.unwrap().total_links(),
            before.total_links()
        );
        h.graph.shutdown().await;
    }
}

#[tokio::test]
async fn test_budget_bounds_visited_facts() {
    for h in harnesses(config()) {
        let facts = (0..40)
            .map(|i| {
                mentioning(
                    fact(
                        &format!("Acme shipped release {i}"),
                        [1.0, i as f32 * 0.01, 0.0, 0.0],
                        t0() + Duration::minutes(i),
                    ),
                    &[("Acme", EntityType::Org)],
                )
            })
            .collect();
        retain(&h, facts).await;

        let req = SearchRequest::new(BANK, "What did Acme ship?", vec![1.0, 0.0, 0.0, 0.0])
            .budget(ThinkingBudget::Custom(10))
            .top_k(40)
            .with_trace();
        let first = h.graph.search(&req).await.unwrap();
        assert_eq!(first.visited, 10, "{}", h.name);
        assert_eq!(first.results.len(), 10);
        let trace = first.trace.unwrap();
        assert_eq!(trace.steps.len(), 10);
        assert!(trace.budget_exhausted);
        assert_eq!(trace.entry_points.len(), 3);
        for pair in trace.steps.windows(2) {
            assert!(pair[0].activation >= pair[1].activation, "{}", h.name);
        }

        let second = h.graph.search(&req).await.unwrap();
        let order = |t: &fathom_types::search::SearchTrace| -> Vec<_> {
            t.steps.iter().map(|s| s.unit_id).collect()
        };
        assert_eq!(order(&trace), order(&second.trace.unwrap()), "{}", h.name);
        h.graph.shutdown().await;
    }
}

#[tokio::test]
async fn test_query_below_floor_is_empty() {
    for h in harnesses(config()) {
        let ids = retain(
            &h,
            vec![
                fact("the sky is blue", [1.0, 0.0, 0.0, 0.0], t0()),
                fact("grass is green", [0.0, 1.0, 0.0, 0.0], t0()),
            ],
        )
        .await;
        let req = SearchRequest::new(BANK, "unrelated", vec![0.0, 0.0, 0.6, 0.8]).with_trace();
        let resp = h.graph.search(&req).await.unwrap();
        assert!(resp.results.is_empty(), "{}", h.name);
        assert_eq!(resp.visited, 0);
        for id in ids {
            let unit = h.graph.store().get_unit(BANK, id).await.unwrap().unwrap();
            assert_eq!(unit.access_count, 0);
        }
        h.graph.shutdown().await;
    }
}

#[tokio::test]
async fn test_more_accessed_fact_ranks_first() {
    for h in harnesses(config()) {
        let ids = retain(
            &h,
            vec![
                fact("twin one", [1.0, 0.0, 0.0, 0.0], t0()),
                fact("twin two", [1.0, 0.0, 0.0, 0.0], t0()),
            ],
        )
        .await;
        let busy = ids[1];
        h.graph
            .store()
            .record_access(BANK, &[busy], Utc::now())
            .await
            .unwrap();

        let req = SearchRequest::new(BANK, "twin", vec![1.0, 0.0, 0.0, 0.0]).at(t0());
        let resp = h.graph.search(&req).await.unwrap();
        assert_eq!(resp.results[0].unit.id, busy, "{}", h.name);
        assert_eq!(resp.results[0].score.frequency, 1.0);
        assert_eq!(resp.results[1].score.frequency, 0.0);
        assert!(resp.results[0].score.final_weight > resp.results[1].score.final_weight);

        let after = h.graph.store().get_unit(BANK, busy).await.unwrap().unwrap();
        assert_eq!(after.access_count, 2);
        assert!(after.last_accessed_at.is_some());
        h.graph.shutdown().await;
    }
}

#[tokio::test]
async fn test_type_filter_keeps_traversal() {
    for h in harnesses(config()) {
        let mut agent_fact = mentioning(
            fact("I booked Carol's flight", [0.0, 1.0, 0.0, 0.0], t0() + Duration::days(30)),
            &[("Carol", EntityType::Person)],
        );
        agent_fact.fact_type = FactType::Agent;
        let ids = retain(
            &h,
            vec![
                mentioning(
                    fact("Carol lives in Oslo", [1.0, 0.0, 0.0, 0.0], t0()),
                    &[("Carol", EntityType::Person)],
                ),
                agent_fact,
            ],
        )
        .await;

        let req = SearchRequest::new(BANK, "Carol", vec![1.0, 0.0, 0.0, 0.0])
            .fact_types(vec![FactType::Agent]);
        let resp = h.graph.search(&req).await.unwrap();
        // The world fact is not an entry point, so nothing is reached.
        assert!(resp.results.is_empty(), "{}", h.name);

        let req = SearchRequest::new(BANK, "Carol", vec![1.0, 0.0, 0.0, 0.0])
            .fact_types(vec![FactType::World]);
        let resp = h.graph.search(&req).await.unwrap();
        let found: Vec<_> = resp.results.iter().map(|r| r.unit.id).collect();
        assert_eq!(found, vec![ids[0]], "{}", h.name);
        assert_eq!(resp.visited, 2);
        h.graph.shutdown().await;
    }
}

#[tokio::test]
async fn test_mmr_prefers_diverse_results() {
    for h in harnesses(config()) {
        let ids = retain(
            &h,
            vec![
                fact("Dana likes tea", [1.0, 0.0, 0.0, 0.0], t0()),
                fact("Dana likes green tea", [1.0, 0.05, 0.0, 0.0], t0()),
                fact("Dana likes jazz", [0.7, 0.0, 0.714, 0.0], t0()),
            ],
        )
        .await;
        let req = SearchRequest::new(BANK, "Dana", vec![1.0, 0.0, 0.0, 0.0])
            .top_k(2)
            .mmr(0.3)
            .at(t0());
        let resp = h.graph.search(&req).await.unwrap();
        let found: Vec<_> = resp.results.iter().map(|r| r.unit.id).collect();
        assert_eq!(found.len(), 2);
        assert!(found.contains(&ids[2]), "{}", h.name);
        h.graph.shutdown().await;
    }
}

#[tokio::test]
async fn test_token_cap_truncates() {
    for h in harnesses(config()) {
        retain(
            &h,
            vec![
                fact(&"a".repeat(40), [1.0, 0.0, 0.0, 0.0], t0()),
                fact(&"b".repeat(40), [0.9, 0.1, 0.0, 0.0], t0()),
            ],
        )
        .await;
        let mut req = SearchRequest::new(BANK, "q", vec![1.0, 0.0, 0.0, 0.0]);
        req.max_tokens = Some(15);
        let resp = h.graph.search(&req).await.unwrap();
        assert_eq!(resp.results.len(), 1, "{}", h.name);
        h.graph.shutdown().await;
    }
}
