//! Maximal Marginal Relevance over scored facts.

use crate::similarity::cosine_similarity;
use fathom_types::search::ScoredFact;

/// Pick up to `k` indices into `candidates`, trading relevance
/// (`final_weight`) against similarity to what is already picked:
/// `lambda * relevance - (1 - lambda) * max_similarity_to_selected`.
///
/// `candidates` must already be in rank order; ties keep the earlier one.
/// Indices come back in pick order.
pub fn mmr_select(candidates: &[ScoredFact], lambda: f32, k: usize) -> Vec<usize> {
    let k = k.min(candidates.len());
    let mut selected: Vec<usize> = Vec::with_capacity(k);
    let mut remaining: Vec<usize> = (0..candidates.len()).collect();
    // Max similarity of each candidate to the selected set.
    let mut max_sim = vec![f32::NEG_INFINITY; candidates.len()];

    while selected.len() < k {
        let mut best: Option<(usize, f32)> = None;
        for (pos, &i) in remaining.iter().enumerate() {
            let relevance = candidates[i].score.final_weight;
            let mmr = if selected.is_empty() {
                relevance
            } else {
                lambda * relevance - (1.0 - lambda) * max_sim[i]
            };
            if best.map_or(true, |(_, b)| mmr > b) {
                best = Some((pos, mmr));
            }
        }
        let Some((pos, _)) = best else { break };
        let picked = remaining.remove(pos);
        selected.push(picked);

        let picked_emb = &candidates[picked].unit.embedding;
        for &i in &remaining {
            let sim = cosine_similarity(&candidates[i].unit.embedding, picked_emb);
            if sim > max_sim[i] {
                max_sim[i] = sim;
            }
        }
    }
    selected
}
