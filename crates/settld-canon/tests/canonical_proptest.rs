// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property tests for the canonicalization pipeline.

use proptest::prelude::*;
use serde_json::Value;
use settld_canon::{canonical_bytes, canonical_hash, normalize};

/// Strategy producing arbitrary JSON values of bounded depth.
fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        "[a-zA-Z0-9 _-]{0,12}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 24, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..6)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

proptest! {
    /// parse(canonical(x)) deep-equals normalize(x).
    #[test]
    fn parse_canonical_roundtrip(v in arb_json()) {
        let bytes = canonical_bytes(&v).unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        prop_assert_eq!(parsed, normalize(&v).unwrap());
    }

    /// Canonicalizing twice is a fixed point.
    #[test]
    fn canonicalization_is_idempotent(v in arb_json()) {
        let once = canonical_bytes(&v).unwrap();
        let reparsed: Value = serde_json::from_slice(&once).unwrap();
        let twice = canonical_bytes(&reparsed).unwrap();
        prop_assert_eq!(once, twice);
    }

    /// Hashing is deterministic across calls.
    #[test]
    fn hashing_is_deterministic(v in arb_json()) {
        prop_assert_eq!(canonical_hash(&v).unwrap(), canonical_hash(&v).unwrap());
    }
}
