//! Property-based tests for the key-space.
//!
//! Uses proptest to generate random tag sets and names and verify the
//! namespace hash is deterministic, order independent and distinct, and that
//! validation never panics.
//!
//! Run with: `cargo test --test proptest_keyspace`

use proptest::prelude::*;

use tag_cache::{KeySpace, TagMode};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Valid tag names like "users" or "org:42"
fn tag_strategy() -> impl Strategy<Value = String> {
    "[a-z]{1,8}(:[a-z0-9]{1,6}){0,2}"
}

fn tag_set_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set(tag_strategy(), 1..6).prop_map(|s| s.into_iter().collect())
}

fn all_mode() -> KeySpace {
    KeySpace::new("app:", TagMode::All)
}

fn tag_ids(keyspace: &KeySpace, tags: &[String]) -> Vec<String> {
    tags.iter().map(|t| keyspace.tag_id(t, 0)).collect()
}

// =============================================================================
// Namespace properties
// =============================================================================

proptest! {
    #[test]
    fn prop_namespace_is_order_independent(
        (tags, shuffled) in tag_set_strategy().prop_flat_map(|tags| {
            let shuffled = Just(tags.clone()).prop_shuffle();
            (Just(tags), shuffled)
        }),
        key in "[a-z0-9:]{1,20}",
    ) {
        let ks = all_mode();
        prop_assert_eq!(
            ks.namespaced_key(&tag_ids(&ks, &tags), &key),
            ks.namespaced_key(&tag_ids(&ks, &shuffled), &key)
        );
    }

    #[test]
    fn prop_namespace_is_deterministic(tags in tag_set_strategy(), key in "[a-z0-9:]{1,20}") {
        let ids = tag_ids(&all_mode(), &tags);
        // independent KeySpace values agree
        prop_assert_eq!(all_mode().namespaced_key(&ids, &key), all_mode().namespaced_key(&ids, &key));
    }

    #[test]
    fn prop_distinct_tag_sets_give_distinct_keys(
        a in tag_set_strategy(),
        b in tag_set_strategy(),
        key in "[a-z0-9:]{1,20}",
    ) {
        prop_assume!(a != b);
        let ks = all_mode();
        prop_assert_ne!(
            ks.namespaced_key(&tag_ids(&ks, &a), &key),
            ks.namespaced_key(&tag_ids(&ks, &b), &key)
        );
    }

    #[test]
    fn prop_generation_changes_namespace(tags in tag_set_strategy(), generation in 0u64..1000) {
        let ks = all_mode();
        let mut bumped = tag_ids(&ks, &tags);
        let before = ks.namespace(&bumped);
        bumped[0] = ks.tag_id(&tags[0], generation + 1);
        prop_assert_ne!(before, ks.namespace(&bumped));
    }

    #[test]
    fn prop_namespace_is_forty_hex_chars(tags in tag_set_strategy()) {
        let ks = all_mode();
        let ns = ks.namespace(&tag_ids(&ks, &tags));
        prop_assert_eq!(ns.len(), 40);
        prop_assert!(ns.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}

// =============================================================================
// Validation never panics
// =============================================================================

proptest! {
    #[test]
    fn fuzz_validate_tag(tag in ".*") {
        let _ = KeySpace::validate_tag(&tag);
    }

    #[test]
    fn fuzz_validate_key(key in ".*") {
        let _ = KeySpace::validate_key(&key);
    }

    #[test]
    fn prop_generated_tags_are_valid(tags in tag_set_strategy()) {
        let normalized = KeySpace::normalize_tags(&tags).unwrap();
        prop_assert_eq!(normalized, tags);
    }

    #[test]
    fn prop_glob_chars_rejected(base in "[a-z]{1,8}", glob in prop::sample::select(vec!['*', '?', '[', ']', '\\'])) {
        let tag = format!("{}{}", base, glob);
        prop_assert!(KeySpace::validate_tag(&tag).is_err());
    }
}
