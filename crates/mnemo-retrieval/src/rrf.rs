//! Weighted reciprocal-rank fusion of two ranked result lists.

use std::collections::HashMap;

use crate::types::{ItemKind, RetrievalItem};

/// Fuse a semantic (vector) list and a lexical (BM25) list.
///
/// Each document at 1-indexed rank `r` contributes `w / (k + r)`, where `w`
/// is `semantic_weight` for the vector list and `1 - semantic_weight` for
/// the BM25 list. Contributions sum across lists; the output is every
/// distinct document sorted by fused score descending, ties broken by id
/// ascending. Input scores are discarded — fused scores are unitless.
pub fn fuse(
    semantic: &[RetrievalItem],
    lexical: &[RetrievalItem],
    semantic_weight: f64,
    k: u32,
) -> Vec<RetrievalItem> {
    let mut scores: HashMap<(ItemKind, i64), f64> = HashMap::new();
    let mut docs: HashMap<(ItemKind, i64), RetrievalItem> = HashMap::new();

    for (list, weight) in [
        (semantic, semantic_weight),
        (lexical, 1.0 - semantic_weight),
    ] {
        for (i, item) in list.iter().enumerate() {
            let rank = (i + 1) as f64;
            let key = (item.kind, item.id);
            *scores.entry(key).or_insert(0.0) += weight / (k as f64 + rank);
            docs.entry(key).or_insert_with(|| item.clone());
        }
    }

    let mut fused: Vec<RetrievalItem> = docs
        .into_iter()
        .map(|(key, mut item)| {
            item.score = scores[&key];
            item
        })
        .collect();
    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: i64, score: f64) -> RetrievalItem {
        RetrievalItem {
            id,
            kind: ItemKind::Memo,
            content: format!("doc {id}"),
            score,
            evidence: None,
        }
    }

    #[test]
    fn shared_documents_accumulate_both_contributions() {
        let a = vec![item(1, 0.9), item(2, 0.8)];
        let b = vec![item(2, 5.0), item(3, 4.0)];
        let fused = fuse(&a, &b, 0.5, 60);

        assert_eq!(fused.len(), 3);
        // Doc 2 appears in both lists and must rank first.
        assert_eq!(fused[0].id, 2);
        let expected = 0.5 / 62.0 + 0.5 / 61.0;
        assert!((fused[0].score - expected).abs() < 1e-12);
    }

    #[test]
    fn fusion_is_commutative_at_equal_weight() {
        let a = vec![item(1, 0.9), item(2, 0.8), item(3, 0.7)];
        let b = vec![item(4, 3.0), item(2, 2.0)];
        let ab = fuse(&a, &b, 0.5, 60);
        let ba = fuse(&b, &a, 0.5, 60);

        let ids_ab: Vec<i64> = ab.iter().map(|i| i.id).collect();
        let ids_ba: Vec<i64> = ba.iter().map(|i| i.id).collect();
        assert_eq!(ids_ab, ids_ba);
        for (x, y) in ab.iter().zip(&ba) {
            assert!((x.score - y.score).abs() < 1e-12);
        }
    }

    #[test]
    fn ties_break_by_id_ascending() {
        // Same single-list rank on both sides → identical scores.
        let a = vec![item(7, 0.9)];
        let b = vec![item(3, 5.0)];
        let fused = fuse(&a, &b, 0.5, 60);
        assert_eq!(fused[0].id, 3);
        assert_eq!(fused[1].id, 7);
    }

    #[test]
    fn output_is_bounded_by_input_union() {
        let a = vec![item(1, 0.9), item(2, 0.8)];
        let b = vec![item(2, 5.0)];
        let fused = fuse(&a, &b, 0.3, 60);
        assert!(fused.len() <= a.len() + b.len());
        for doc in &fused {
            assert!(a.iter().chain(&b).any(|i| i.id == doc.id));
        }
    }

    #[test]
    fn empty_inputs_fuse_to_empty() {
        assert!(fuse(&[], &[], 0.5, 60).is_empty());
    }
}
