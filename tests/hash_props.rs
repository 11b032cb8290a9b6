// ============================================================================
// spark-query - Key Hashing Property Tests
// ============================================================================

use proptest::prelude::*;

use spark_query::{hash_key, QueryKey};

fn key_from(parts: &[String]) -> QueryKey {
    parts.iter().cloned().collect()
}

proptest! {
    #[test]
    fn structurally_equal_keys_hash_equal(parts in proptest::collection::vec(".*", 0..6)) {
        let a = key_from(&parts);
        let b = key_from(&parts);
        prop_assert_eq!(hash_key(&a), hash_key(&b));
    }

    #[test]
    fn distinct_keys_hash_distinct(
        a in proptest::collection::vec(".*", 0..6),
        b in proptest::collection::vec(".*", 0..6),
    ) {
        prop_assume!(a != b);
        prop_assert_ne!(hash_key(&key_from(&a)), hash_key(&key_from(&b)));
    }

    #[test]
    fn numeric_and_string_parts_never_collide(n in any::<i64>()) {
        let numeric: QueryKey = [n].into_iter().collect();
        let stringy: QueryKey = [n.to_string()].into_iter().collect();
        prop_assert_ne!(hash_key(&numeric), hash_key(&stringy));
    }

    #[test]
    fn prefix_relation_is_reflected_in_values(
        prefix in proptest::collection::vec(".*", 0..4),
        suffix in proptest::collection::vec(".*", 1..4),
    ) {
        let full: Vec<String> = prefix.iter().chain(suffix.iter()).cloned().collect();
        prop_assert!(key_from(&prefix).is_prefix_of(&key_from(&full)));
        prop_assert!(!key_from(&full).is_prefix_of(&key_from(&prefix)));
    }
}
