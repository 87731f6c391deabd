//! Budgeted spreading activation over the link graph.
//!
//! The frontier is a max-heap keyed by activation; ties pop the lower unit
//! id first, so a fixed graph and budget always expand the same facts in
//! the same order. A fact is expanded at most once, and expansions stop
//! exactly at the budget.

use crate::store::GraphStore;
use fathom_types::error::{FathomError, FathomResult};
use fathom_types::memory::{LinkType, UnitId};
use fathom_types::search::TraceStep;
use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use tokio::sync::watch;

/// Outcome of one spread.
#[derive(Debug, Default)]
pub struct Spread {
    /// Expanded facts in expansion order.
    pub visited: Vec<UnitId>,
    /// Final activation of every expanded fact.
    pub activation: HashMap<UnitId, f32>,
    /// Per-expansion trace, filled when requested.
    pub steps: Vec<TraceStep>,
    /// Whether unexpanded candidates remained when the budget ran out.
    pub budget_exhausted: bool,
}

/// Parameters of one spread.
pub struct SpreadParams<'a> {
    /// Bank to walk.
    pub bank_id: &'a str,
    /// Seed facts with their initial activation.
    pub entry_points: &'a [(UnitId, f32)],
    /// Maximum expansions.
    pub budget: usize,
    /// Per-hop multiplier.
    pub decay: f32,
    /// Record a trace step per expansion.
    pub trace: bool,
}

type FrontierEntry = (OrderedFloat<f32>, Reverse<UnitId>);

/// Run the spread. `cancel` is checked before every pop; once it reads
/// `true` the spread stops with [`FathomError::Cancelled`].
pub async fn spread(
    store: &dyn GraphStore,
    params: SpreadParams<'_>,
    cancel: Option<&watch::Receiver<bool>>,
) -> FathomResult<Spread> {
    let mut frontier: BinaryHeap<FrontierEntry> = BinaryHeap::new();
    let mut best: HashMap<UnitId, (f32, Option<(UnitId, LinkType)>)> = HashMap::new();
    let mut expanded: HashSet<UnitId> = HashSet::new();
    let mut out = Spread::default();

    for &(id, activation) in params.entry_points {
        let improves = best.get(&id).map_or(true, |(a, _)| activation > *a);
        if improves {
            best.insert(id, (activation, None));
            frontier.push((OrderedFloat(activation), Reverse(id)));
        }
    }

    loop {
        if cancel.is_some_and(|rx| *rx.borrow()) {
            return Err(FathomError::Cancelled);
        }
        if out.visited.len() >= params.budget {
            out.budget_exhausted = frontier
                .iter()
                .any(|(_, Reverse(id))| !expanded.contains(id));
            break;
        }
        let Some((OrderedFloat(activation), Reverse(id))) = frontier.pop() else {
            break;
        };
        if expanded.contains(&id) {
            continue;
        }
        let (current, via) = best.get(&id).copied().unwrap_or((activation, None));
        if activation < current {
            // Superseded by a later, stronger push.
            continue;
        }

        expanded.insert(id);
        out.visited.push(id);
        out.activation.insert(id, activation);

        let mut updated = 0;
        for link in store.outgoing_links(params.bank_id, id).await? {
            let to = link.to_unit_id;
            if expanded.contains(&to) {
                continue;
            }
            let candidate = activation * link.weight * params.decay;
            let improves = best.get(&to).map_or(true, |(a, _)| candidate > *a);
            if improves {
                best.insert(to, (candidate, Some((id, link.link_type))));
                frontier.push((OrderedFloat(candidate), Reverse(to)));
                updated += 1;
            }
        }

        if params.trace {
            out.steps.push(TraceStep {
                order: out.visited.len() - 1,
                unit_id: id,
                activation,
                via,
                neighbors_updated: updated,
            });
        }
    }
    Ok(out)
}
