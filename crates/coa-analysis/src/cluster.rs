//! Greedy lexical clustering of aggregated queries.
//!
//! Every candidate is compared against the word set of its cluster's seed,
//! never against the growing cluster, so the result depends on input order.

use std::collections::{BTreeSet, HashMap, HashSet};

use coa_core::{AggregatedQuery, KeywordCluster};

/// Minimum Jaccard similarity against the seed for a query to join a cluster.
pub const SIMILARITY_THRESHOLD: f64 = 0.5;

/// Lowercased, whitespace-split, deduplicated word set.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// |A ∩ B| / |A ∪ B|, with two empty sets scoring 0.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    intersection as f64 / union as f64
}

/// Partition `queries` into clusters. Repeated query texts are assigned once.
pub fn cluster_queries<S: AsRef<str>>(queries: &[S]) -> Vec<KeywordCluster> {
    let texts = queries.iter().map(|q| q.as_ref()).collect::<Vec<&str>>();
    let word_sets = texts.iter().map(|q| tokenize(q)).collect::<Vec<_>>();
    let mut assigned: HashSet<&str> = HashSet::with_capacity(texts.len());
    let mut clusters = Vec::new();

    for (i, &seed) in texts.iter().enumerate() {
        if !assigned.insert(seed) {
            continue;
        }
        let mut cluster = KeywordCluster::seeded(seed);

        for (j, &candidate) in texts.iter().enumerate().skip(i + 1) {
            if assigned.contains(candidate) {
                continue;
            }
            if jaccard(&word_sets[i], &word_sets[j]) >= SIMILARITY_THRESHOLD {
                assigned.insert(candidate);
                cluster.queries.push(candidate.to_string());
            }
        }

        clusters.push(cluster);
    }

    clusters
}

/// Member with the highest impressions; ties go to the lexically smaller query.
pub fn primary_query<'a>(
    cluster: &KeywordCluster,
    aggregated: &'a [AggregatedQuery],
) -> Option<&'a AggregatedQuery> {
    let index = aggregated
        .iter()
        .map(|row| (row.query.as_str(), row))
        .collect::<HashMap<_, _>>();
    primary_of(cluster.queries.iter().filter_map(|q| index.get(q.as_str()).copied()))
}

pub(crate) fn primary_of<'a>(
    members: impl IntoIterator<Item = &'a AggregatedQuery>,
) -> Option<&'a AggregatedQuery> {
    members.into_iter().min_by(|a, b| {
        b.total_impressions
            .cmp(&a.total_impressions)
            .then_with(|| a.query.cmp(&b.query))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agg(query: &str, total_impressions: u64) -> AggregatedQuery {
        AggregatedQuery {
            query: query.to_string(),
            total_impressions,
            total_clicks: 0,
            avg_position: 10.0,
        }
    }

    #[test]
    fn tokenize_lowercases_and_dedupes() {
        let words = tokenize("  Zero WASTE zero\tskincare ");
        assert_eq!(
            words.into_iter().collect::<Vec<_>>(),
            vec!["skincare", "waste", "zero"]
        );
    }

    #[test]
    fn jaccard_handles_empty_sets() {
        let empty = BTreeSet::new();
        assert_eq!(jaccard(&empty, &empty), 0.0);
        assert_eq!(jaccard(&tokenize("a b"), &empty), 0.0);
    }

    #[test]
    fn shared_words_cluster_together() {
        let clusters = cluster_queries(&["natural deodorant", "natural deodorant nl"]);
        assert_eq!(clusters.len(), 1);
        assert_eq!(
            clusters[0].queries,
            vec!["natural deodorant", "natural deodorant nl"]
        );
    }

    #[test]
    fn similarity_is_measured_against_the_seed_only() {
        // "b c d" overlaps member "a b c" at 2/4 but the seed only at 1/4.
        let clusters = cluster_queries(&["a b", "a b c", "b c d"]);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].queries, vec!["a b", "a b c"]);
        assert_eq!(clusters[1].queries, vec!["b c d"]);
    }

    #[test]
    fn exactly_half_similarity_joins() {
        // {red shoes} vs {red boots}: 1/3. {red shoes} vs {red shoes sale sport}: 2/4.
        let clusters = cluster_queries(&["red shoes", "red boots", "red shoes sale sport"]);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].queries, vec!["red shoes", "red shoes sale sport"]);
        assert_eq!(clusters[1].queries, vec!["red boots"]);
    }

    #[test]
    fn order_changes_the_partition() {
        let forward = cluster_queries(&["a b", "a b c", "b c"]);
        let reversed = cluster_queries(&["b c", "a b c", "a b"]);
        assert_eq!(forward.len(), 2);
        assert_eq!(reversed.len(), 2);
        assert_eq!(forward[0].queries, vec!["a b", "a b c"]);
        assert_eq!(reversed[0].queries, vec!["b c", "a b c"]);
    }

    #[test]
    fn duplicate_texts_are_assigned_once() {
        let clusters = cluster_queries(&["vegan soap", "vegan soap"]);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].queries, vec!["vegan soap"]);
    }

    #[test]
    fn empty_input_has_no_clusters() {
        let none: [&str; 0] = [];
        assert!(cluster_queries(&none).is_empty());
    }

    #[test]
    fn primary_prefers_impressions_then_lexical() {
        let rows = vec![agg("b soap", 50), agg("a soap", 50), agg("c soap", 10)];
        let cluster = KeywordCluster {
            queries: vec!["c soap".into(), "b soap".into(), "a soap".into()],
        };
        assert_eq!(primary_query(&cluster, &rows).unwrap().query, "a soap");
    }
}
