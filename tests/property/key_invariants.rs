//! Property-based tests for key equality/hash laws and the retry backoff
//! sequence.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use proptest::prelude::*;
use query_core_rs::{QueryKey, RetryPolicy};
use serde_json::{json, Value};

fn std_hash(key: &QueryKey) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Arbitrary JSON values of bounded depth for key parts.
fn arb_part() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-z0-9]{0,12}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

fn arb_parts() -> impl Strategy<Value = Vec<Value>> {
    prop::collection::vec(arb_part(), 0..5)
}

proptest! {
    #[test]
    fn test_equality_implies_hash_equality(parts in arb_parts()) {
        let a = QueryKey::new(parts.clone());
        let b = QueryKey::new(parts);
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(std_hash(&a), std_hash(&b));
    }

    #[test]
    fn test_starts_with_is_reflexive(parts in arb_parts()) {
        let key = QueryKey::new(parts);
        prop_assert!(key.starts_with(&key));
    }

    #[test]
    fn test_prefix_always_matches(
        prefix in arb_parts(),
        suffix in arb_parts()
    ) {
        let prefix_key = QueryKey::new(prefix.clone());
        let mut full = prefix;
        full.extend(suffix);
        let full_key = QueryKey::new(full);
        prop_assert!(full_key.starts_with(&prefix_key));
    }

    #[test]
    fn test_mutual_prefix_implies_equality(
        a in arb_parts(),
        b in arb_parts()
    ) {
        let ka = QueryKey::new(a);
        let kb = QueryKey::new(b);
        if ka.starts_with(&kb) && kb.starts_with(&ka) {
            prop_assert_eq!(&ka, &kb);
            prop_assert_eq!(std_hash(&ka), std_hash(&kb));
        }
    }

    #[test]
    fn test_null_object_properties_never_distinguish_keys(
        base in prop::collection::btree_map("[a-z]{1,6}", any::<i64>().prop_map(Value::from), 0..4),
        null_keys in prop::collection::vec("[A-Z]{1,6}", 0..3)
    ) {
        let plain: Value = Value::Object(base.clone().into_iter().collect());
        let mut padded = base;
        for key in null_keys {
            padded.insert(key, Value::Null);
        }
        let padded: Value = Value::Object(padded.into_iter().collect());

        let a = QueryKey::new([plain]);
        let b = QueryKey::new([padded]);
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(std_hash(&a), std_hash(&b));
    }

    #[test]
    fn test_serde_round_trip_preserves_equality_and_hash(parts in arb_parts()) {
        let key = QueryKey::new(parts);
        let encoded = serde_json::to_string(&key).unwrap();
        let decoded: QueryKey = serde_json::from_str(&encoded).unwrap();
        prop_assert_eq!(&key, &decoded);
        prop_assert_eq!(std_hash(&key), std_hash(&decoded));
    }

    #[test]
    fn test_default_backoff_doubles_until_cap(attempt in 0u32..16) {
        let policy = RetryPolicy::default();
        let expected = 1000u64
            .saturating_mul(1 << attempt)
            .min(30_000);
        prop_assert_eq!(
            policy.delay_for(attempt),
            Duration::from_millis(expected)
        );
    }

    #[test]
    fn test_backoff_never_exceeds_max_delay(
        attempt in 0u32..64,
        max_ms in 1u64..60_000
    ) {
        let policy = RetryPolicy::default().with_max_delay(Duration::from_millis(max_ms));
        prop_assert!(policy.delay_for(attempt) <= Duration::from_millis(max_ms));
    }
}

#[test]
fn test_documented_null_property_example() {
    // `{a:1}` equals `{a:1,b:null}` for both equality and hash.
    let a = QueryKey::new([json!({"a": 1})]);
    let b = QueryKey::new([json!({"a": 1, "b": null})]);
    assert_eq!(a, b);
    assert_eq!(std_hash(&a), std_hash(&b));
}
