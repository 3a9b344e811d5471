use std::collections::HashSet;

use coa_analysis::{cluster_queries, jaccard, opportunity_score, tokenize, ScoreInput};
use proptest::prelude::*;
use proptest::test_runner::Config;

fn query_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-e]{1,3}", 1..5).prop_map(|words| words.join(" "))
}

proptest! {
    #![proptest_config(Config::with_cases(256))]

    #[test]
    fn clusters_partition_distinct_inputs(raw in prop::collection::vec(query_strategy(), 0..40)) {
        let mut seen = HashSet::new();
        let queries = raw.into_iter().filter(|q| seen.insert(q.clone())).collect::<Vec<_>>();

        let clusters = cluster_queries(&queries);
        let flattened = clusters.iter().flat_map(|c| c.queries.iter().cloned()).collect::<Vec<_>>();

        prop_assert_eq!(flattened.len(), queries.len());
        let unique = flattened.iter().cloned().collect::<HashSet<_>>();
        prop_assert_eq!(unique.len(), flattened.len());
        prop_assert_eq!(unique, queries.iter().cloned().collect::<HashSet<_>>());
        prop_assert!(clusters.iter().all(|c| !c.is_empty()));
    }

    #[test]
    fn members_always_meet_the_threshold_against_their_seed(
        raw in prop::collection::vec(query_strategy(), 1..30)
    ) {
        for cluster in cluster_queries(&raw) {
            let seed = tokenize(cluster.seed().unwrap());
            for member in cluster.queries.iter().skip(1) {
                prop_assert!(jaccard(&seed, &tokenize(member)) >= 0.5);
            }
        }
    }

    #[test]
    fn jaccard_is_symmetric_and_bounded(a in query_strategy(), b in query_strategy()) {
        let (wa, wb) = (tokenize(&a), tokenize(&b));
        let ab = jaccard(&wa, &wb);
        prop_assert_eq!(ab, jaccard(&wb, &wa));
        prop_assert!((0.0..=1.0).contains(&ab));
        prop_assert_eq!(jaccard(&wa, &wa), 1.0);
    }

    #[test]
    fn scores_are_bounded_and_repeatable(
        total_impressions in any::<u64>(),
        avg_position in 0.0f64..500.0,
        has_catalog_match in any::<bool>()
    ) {
        let input = ScoreInput { total_impressions, avg_position, has_catalog_match };
        let score = opportunity_score(input);
        prop_assert!((0.0..=100.0).contains(&score));
        prop_assert_eq!(score, opportunity_score(input));
    }
}
