//! Reciprocal rank fusion: each list contributes `weight / (rank + k)` per
//! item; contributions sum per id. Ordering is fully deterministic:
//! descending score, then lower first-seen rank, then lexical id.

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct RankedList {
    pub ids: Vec<String>,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub id: String,
    pub score: f64,
    first_seen_rank: usize,
}

pub fn reciprocal_rank_fusion(lists: &[RankedList], k: f64) -> Vec<FusedHit> {
    let mut scores: HashMap<String, (f64, usize)> = HashMap::new();

    for list in lists {
        for (rank, id) in list.ids.iter().enumerate() {
            let contribution = list.weight / (rank as f64 + k);
            let entry = scores.entry(id.clone()).or_insert((0.0, rank));
            entry.0 += contribution;
        }
    }

    let mut fused: Vec<FusedHit> = scores
        .into_iter()
        .map(|(id, (score, first_seen_rank))| FusedHit {
            id,
            score,
            first_seen_rank,
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.first_seen_rank.cmp(&b.first_seen_rank))
            .then_with(|| a.id.cmp(&b.id))
    });
    fused
}
