// src/search/fusion.rs
// Reciprocal Rank Fusion of lexical and semantic rankings.
//
//   score(id) = Σ w_s · 1 / (k + rank_s(id))   over sources s ∈ {vector, fts}
//
// Ranks are 1-based; an item missing from a source contributes nothing from
// it. Items present in both sources get the overlap boost after fusion.

use crate::config::RerankConfig;

/// One entry of a ranked source list, best first.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedItem {
    pub id: i64,
    /// Source-native score (cosine similarity or normalised bm25), kept for
    /// introspection only; fusion uses ranks.
    pub score: f64,
}

/// A fused result with per-source introspection fields.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedResult {
    pub id: i64,
    pub vector_rank: Option<usize>,
    pub fts_rank: Option<usize>,
    pub vector_score: Option<f64>,
    pub fts_score: Option<f64>,
    pub combined_score: f64,
}

/// Fuse two ranked lists with RRF; output sorted best-first.
pub fn reciprocal_rank_fusion(
    vector: &[RankedItem],
    fts: &[RankedItem],
    config: &RerankConfig,
) -> Vec<FusedResult> {
    let mut merged: std::collections::HashMap<i64, FusedResult> = std::collections::HashMap::new();

    for (rank0, item) in vector.iter().enumerate() {
        let rank = rank0 + 1;
        let entry = merged.entry(item.id).or_insert_with(|| FusedResult {
            id: item.id,
            vector_rank: None,
            fts_rank: None,
            vector_score: None,
            fts_score: None,
            combined_score: 0.0,
        });
        entry.vector_rank = Some(rank);
        entry.vector_score = Some(item.score);
        entry.combined_score += config.vector_weight / (config.rrf_k + rank as f64);
    }

    for (rank0, item) in fts.iter().enumerate() {
        let rank = rank0 + 1;
        let entry = merged.entry(item.id).or_insert_with(|| FusedResult {
            id: item.id,
            vector_rank: None,
            fts_rank: None,
            vector_score: None,
            fts_score: None,
            combined_score: 0.0,
        });
        entry.fts_rank = Some(rank);
        entry.fts_score = Some(item.score);
        entry.combined_score += config.fts_weight() / (config.rrf_k + rank as f64);
    }

    let mut results: Vec<FusedResult> = merged
        .into_values()
        .map(|mut r| {
            if r.vector_rank.is_some() && r.fts_rank.is_some() {
                r.combined_score *= config.overlap_boost;
            }
            r
        })
        .collect();

    // Deterministic order: score descending, id ascending on ties.
    results.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    results
}

/// Merge fused result sets from several query variants, keeping the best
/// combined score per id.
pub fn merge_variants(variant_results: Vec<Vec<FusedResult>>) -> Vec<FusedResult> {
    let mut best: std::collections::HashMap<i64, FusedResult> = std::collections::HashMap::new();
    for results in variant_results {
        for result in results {
            match best.get(&result.id) {
                Some(existing) if existing.combined_score >= result.combined_score => {}
                _ => {
                    best.insert(result.id, result);
                }
            }
        }
    }
    let mut merged: Vec<FusedResult> = best.into_values().collect();
    merged.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(items: &[(i64, f64)]) -> Vec<RankedItem> {
        items.iter().map(|&(id, score)| RankedItem { id, score }).collect()
    }

    fn default_config() -> RerankConfig {
        RerankConfig::default()
    }

    #[test]
    fn test_empty_inputs_empty_output() {
        let results = reciprocal_rank_fusion(&[], &[], &default_config());
        assert!(results.is_empty());
    }

    #[test]
    fn test_single_source_contribution_exact() {
        let config = default_config();
        let results = reciprocal_rank_fusion(&ranked(&[(7, 0.9)]), &[], &config);
        assert_eq!(results.len(), 1);
        let expected = config.vector_weight / (config.rrf_k + 1.0);
        assert!((results[0].combined_score - expected).abs() < 1e-12);
        assert_eq!(results[0].vector_rank, Some(1));
        assert_eq!(results[0].fts_rank, None);
        assert_eq!(results[0].fts_score, None);
    }

    #[test]
    fn test_fts_only_contribution_exact() {
        let config = default_config();
        let results = reciprocal_rank_fusion(&[], &ranked(&[(3, 0.5)]), &config);
        let expected = config.fts_weight() / (config.rrf_k + 1.0);
        assert!((results[0].combined_score - expected).abs() < 1e-12);
    }

    #[test]
    fn test_overlap_items_outrank_single_source() {
        // Vector: 1,2,3 — FTS: 2,1,4. Items in both sources beat items in one.
        let config = default_config();
        let results = reciprocal_rank_fusion(
            &ranked(&[(1, 0.9), (2, 0.8), (3, 0.7)]),
            &ranked(&[(2, 0.95), (1, 0.85), (4, 0.75)]),
            &config,
        );
        let position = |id: i64| results.iter().position(|r| r.id == id).expect("present");
        assert!(position(1) < position(3));
        assert!(position(1) < position(4));
        assert!(position(2) < position(3));
        assert!(position(2) < position(4));

        // Introspection fields round-trip.
        let item2 = results.iter().find(|r| r.id == 2).expect("item 2");
        assert_eq!(item2.vector_rank, Some(2));
        assert_eq!(item2.fts_rank, Some(1));
        assert_eq!(item2.vector_score, Some(0.8));
        assert_eq!(item2.fts_score, Some(0.95));
    }

    #[test]
    fn test_double_number_one_beats_single_number_one() {
        // Equal weights, k=60: #1 in both sources outranks #1 in only one.
        let config = RerankConfig {
            enabled: true,
            vector_weight: 0.5,
            rrf_k: 60.0,
            overlap_boost: 1.0,
        };
        let results = reciprocal_rank_fusion(
            &ranked(&[(1, 0.9), (2, 0.8)]),
            &ranked(&[(1, 0.9), (3, 0.8)]),
            &config,
        );
        assert_eq!(results[0].id, 1);
    }

    #[test]
    fn test_overlap_boost_applied() {
        let no_boost = RerankConfig {
            overlap_boost: 1.0,
            ..RerankConfig::default()
        };
        let boosted = RerankConfig {
            overlap_boost: 1.2,
            ..RerankConfig::default()
        };
        let vector = ranked(&[(1, 0.9)]);
        let fts = ranked(&[(1, 0.9)]);
        let plain = reciprocal_rank_fusion(&vector, &fts, &no_boost)[0].combined_score;
        let with_boost = reciprocal_rank_fusion(&vector, &fts, &boosted)[0].combined_score;
        assert!((with_boost - plain * 1.2).abs() < 1e-12);
    }

    #[test]
    fn test_deterministic_tie_break() {
        let config = default_config();
        // Two items with identical ranks in a single source tie on score;
        // id order decides.
        let a = reciprocal_rank_fusion(&ranked(&[(5, 0.9)]), &ranked(&[(2, 0.9)]), &config);
        let b = reciprocal_rank_fusion(&ranked(&[(5, 0.9)]), &ranked(&[(2, 0.9)]), &config);
        assert_eq!(a, b);
    }

    #[test]
    fn test_merge_variants_keeps_best() {
        let v1 = vec![FusedResult {
            id: 1,
            vector_rank: Some(1),
            fts_rank: None,
            vector_score: Some(0.9),
            fts_score: None,
            combined_score: 0.5,
        }];
        let v2 = vec![
            FusedResult {
                id: 1,
                vector_rank: Some(2),
                fts_rank: None,
                vector_score: Some(0.8),
                fts_score: None,
                combined_score: 0.7,
            },
            FusedResult {
                id: 2,
                vector_rank: Some(1),
                fts_rank: None,
                vector_score: Some(0.95),
                fts_score: None,
                combined_score: 0.6,
            },
        ];
        let merged = merge_variants(vec![v1, v2]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id, 1);
        assert!((merged[0].combined_score - 0.7).abs() < 1e-12);
    }
}
