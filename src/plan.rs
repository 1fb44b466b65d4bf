//! Remediation plan construction.
//!
//! A plan is an ordered list of batches. Canaries that still need work lead
//! the plan as singleton batches in spec order; the remaining non-compliant
//! clusters follow in sorted order, grouped by the computed concurrency.

use std::collections::BTreeSet;

/// Build the ordered batch list.
///
/// `all_clusters` is the resolved target set in its contractual sorted
/// order; `non_compliant` the clusters violating at least one managed
/// policy. Clusters already compliant with everything are left out entirely,
/// so an all-compliant target set produces an empty plan.
pub fn build_remediation_plan(
    all_clusters: &[String],
    non_compliant: &BTreeSet<String>,
    canaries: &[String],
    max_concurrency: usize,
) -> Vec<Vec<String>> {
    let mut plan: Vec<Vec<String>> = Vec::new();
    let mut is_canary: BTreeSet<&str> = BTreeSet::new();

    for canary in canaries {
        if non_compliant.contains(canary) {
            plan.push(vec![canary.clone()]);
            is_canary.insert(canary.as_str());
        }
    }

    let concurrency = max_concurrency.max(1);
    let mut batch: Vec<String> = Vec::new();
    for cluster in all_clusters {
        if is_canary.contains(cluster.as_str()) || !non_compliant.contains(cluster) {
            continue;
        }
        batch.push(cluster.clone());
        if batch.len() == concurrency {
            plan.push(std::mem::take(&mut batch));
        }
    }
    if !batch.is_empty() {
        plan.push(batch);
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn groups_by_concurrency_with_partial_tail() {
        let plan = build_remediation_plan(
            &names(&["a", "b", "c", "d", "e"]),
            &set(&["a", "b", "c", "d", "e"]),
            &[],
            2,
        );
        assert_eq!(plan, vec![names(&["a", "b"]), names(&["c", "d"]), names(&["e"])]);
    }

    #[test]
    fn canaries_lead_as_singleton_batches_in_spec_order() {
        let plan = build_remediation_plan(
            &names(&["a", "b", "c", "d"]),
            &set(&["a", "b", "c", "d"]),
            &names(&["c", "a"]),
            10,
        );
        assert_eq!(plan, vec![names(&["c"]), names(&["a"]), names(&["b", "d"])]);
    }

    #[test]
    fn compliant_clusters_are_excluded() {
        let plan = build_remediation_plan(
            &names(&["a", "b", "c"]),
            &set(&["b"]),
            &[],
            2,
        );
        assert_eq!(plan, vec![names(&["b"])]);
    }

    #[test]
    fn compliant_canary_does_not_get_a_batch() {
        let plan = build_remediation_plan(
            &names(&["a", "b"]),
            &set(&["b"]),
            &names(&["a"]),
            1,
        );
        assert_eq!(plan, vec![names(&["b"])]);
    }

    #[test]
    fn all_compliant_produces_empty_plan() {
        let plan = build_remediation_plan(&names(&["a", "b"]), &BTreeSet::new(), &names(&["a"]), 2);
        assert!(plan.is_empty());
    }

    proptest! {
        /// Every non-compliant cluster lands in exactly one batch and the
        /// batch sizes sum to the non-compliant count.
        #[test]
        fn plan_partitions_the_non_compliant_set(
            cluster_bits in proptest::collection::vec(any::<bool>(), 1..40),
            canary_count in 0usize..5,
            concurrency in 1usize..10,
        ) {
            let all: Vec<String> = (0..cluster_bits.len()).map(|i| format!("spoke{i:02}")).collect();
            let non_compliant: BTreeSet<String> = all
                .iter()
                .zip(&cluster_bits)
                .filter(|(_, nc)| **nc)
                .map(|(name, _)| name.clone())
                .collect();
            let canaries: Vec<String> = all.iter().take(canary_count).cloned().collect();

            let plan = build_remediation_plan(&all, &non_compliant, &canaries, concurrency);

            let total: usize = plan.iter().map(|b| b.len()).sum();
            prop_assert_eq!(total, non_compliant.len());

            let mut seen = BTreeSet::new();
            for batch in &plan {
                prop_assert!(!batch.is_empty());
                prop_assert!(batch.len() <= concurrency.max(1));
                for cluster in batch {
                    prop_assert!(non_compliant.contains(cluster));
                    prop_assert!(seen.insert(cluster.clone()));
                }
            }
        }

        /// Canary batches have size 1 and sit at the head of the plan.
        #[test]
        fn canary_batches_are_singletons_at_the_head(
            cluster_count in 1usize..30,
            canary_count in 1usize..5,
            concurrency in 1usize..8,
        ) {
            let all: Vec<String> = (0..cluster_count).map(|i| format!("spoke{i:02}")).collect();
            let non_compliant: BTreeSet<String> = all.iter().cloned().collect();
            let canaries: Vec<String> = all.iter().take(canary_count).cloned().collect();

            let plan = build_remediation_plan(&all, &non_compliant, &canaries, concurrency);

            let lead = canary_count.min(cluster_count);
            for (i, canary) in canaries.iter().take(lead).enumerate() {
                prop_assert_eq!(&plan[i], &vec![canary.clone()]);
            }
            for batch in plan.iter().skip(lead) {
                for cluster in batch {
                    prop_assert!(!canaries.contains(cluster));
                }
            }
        }
    }
}
