//! Property-based tests for the sync pipeline.
//!
//! - Schema inference and cell coercion are total and deterministic
//! - Reconciling any sequence of record sets leaves the index equal to the
//!   index built from scratch for the last set
//! - Group merges are pure under every rule, ignore input order once the
//!   priority list names every subtype, and honor subtype priority

use proptest::prelude::*;
use serde_json::{json, Value};
use sheetsync::index::{IndexBuilder, IndexState};
use sheetsync::schema::SchemaOverride;
use sheetsync::transform::coerce_cell;
use sheetsync::{
    infer_schema, merge_group, ConflictStrategy, FieldKind, KeySpace, KvStore, MemoryStore,
    MergeMode, MergeRule, Record, RecordSet, TableRecords,
};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// HELPER STRATEGIES
// =============================================================================

fn header_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set("[A-Za-z][A-Za-z0-9_]{0,8}", 0..6).prop_map(|names| {
        let mut header = vec!["ID".to_string()];
        header.extend(names.into_iter().filter(|n| n != "ID"));
        header
    })
}

fn kind_strategy() -> impl Strategy<Value = FieldKind> {
    prop_oneof![
        Just(FieldKind::Int),
        Just(FieldKind::Float),
        Just(FieldKind::Bool),
        Just(FieldKind::String),
        Just(FieldKind::Array),
        Just(FieldKind::Json),
    ]
}

/// Records keyed `0..12` whose `Subtype` is one of three values or null.
fn record_set_strategy() -> impl Strategy<Value = RecordSet> {
    let subtype = prop_oneof![
        Just(Value::Null),
        Just(json!("hero")),
        Just(json!("soldier")),
        Just(json!("mage")),
    ];
    prop::collection::btree_map(0u8..12, (subtype, 0u32..3), 0..10).prop_map(|rows| {
        rows.into_iter()
            .map(|(id, (subtype, level))| {
                let mut record = Record::new();
                record.insert("ID".into(), json!(id));
                record.insert("Subtype".into(), subtype);
                record.insert("Level".into(), json!(level));
                (id.to_string(), record)
            })
            .collect()
    })
}

fn names_strategy() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map("[0-9]{1,2}", "[a-z]{1,4}", 0..8)
}

fn subtypes(names: Vec<&'static str>) -> Vec<String> {
    names.into_iter().map(String::from).collect()
}

/// Any conflict strategy and merge mode, with a priority list that is a
/// shuffled prefix of the subtypes `a`, `b`, `c`.
fn rule_strategy() -> impl Strategy<Value = MergeRule> {
    let conflict = prop_oneof![
        Just(ConflictStrategy::FirstWin),
        Just(ConflictStrategy::LastWin),
        Just(ConflictStrategy::MergeFields),
    ];
    let mode = prop_oneof![Just(MergeMode::BySubtype), Just(MergeMode::Concat)];
    let priority = Just(vec!["a", "b", "c"])
        .prop_shuffle()
        .prop_flat_map(|order| (0..=order.len()).prop_map(move |n| subtypes(order[..n].to_vec())));
    (conflict, mode, priority).prop_map(|(conflict_strategy, merge_mode, priority_order)| MergeRule {
        conflict_strategy,
        priority_order,
        merge_mode,
    })
}

fn without_zero_counts(state: &IndexState) -> BTreeMap<String, BTreeMap<String, i64>> {
    state
        .group_count
        .iter()
        .map(|(field, counts)| {
            let counts: BTreeMap<String, i64> = counts
                .iter()
                .filter(|(_, n)| **n != 0)
                .map(|(v, n)| (v.clone(), *n))
                .collect();
            (field.clone(), counts)
        })
        .filter(|(_, counts)| !counts.is_empty())
        .collect()
}

fn table(subtype_names: &BTreeMap<String, String>) -> TableRecords {
    let header = vec!["ID".to_string(), "Name".to_string()];
    let schema = infer_schema(&header, &SchemaOverride::default(), "ID").unwrap();
    let records = subtype_names
        .iter()
        .map(|(id, name)| {
            let mut record = Record::new();
            record.insert("ID".into(), json!(id));
            record.insert("Name".into(), json!(name));
            (id.clone(), record)
        })
        .collect();
    TableRecords::from_parts(schema, records)
}

// =============================================================================
// SCHEMA AND COERCION
// =============================================================================

mod schema_properties {
    use super::*;

    proptest! {
        /// The same header and overrides always yield the same schema.
        #[test]
        fn inference_is_deterministic(header in header_strategy(), hinted in any::<prop::sample::Index>(), kind in kind_strategy()) {
            let mut overrides = SchemaOverride::default();
            let column = hinted.get(&header).clone();
            overrides.type_hints.insert(column.clone(), kind);

            let first = infer_schema(&header, &overrides, "ID").unwrap();
            let second = infer_schema(&header, &overrides, "ID").unwrap();

            prop_assert_eq!(first.fingerprint(), second.fingerprint());
            prop_assert_eq!(first.len(), header.len());
            prop_assert_eq!(first.key_field().name.as_str(), "ID");
            prop_assert_eq!(first.kind_of(&column), Some(kind));
        }

        /// Coercion never panics; a failure keeps the raw cell as a string.
        #[test]
        fn coercion_is_total(raw in "\\PC{0,16}", kind in kind_strategy()) {
            let (value, failure) = coerce_cell(&raw, kind);
            if failure.is_some() {
                prop_assert_eq!(value, Value::String(raw));
            } else if raw.trim().is_empty() && kind != FieldKind::Array {
                prop_assert_eq!(value, Value::Null);
            }
        }
    }
}

// =============================================================================
// INDEX RECONCILIATION
// =============================================================================

mod index_properties {
    use super::*;

    proptest! {
        /// Any sequence of syncs converges to the from-scratch index of the
        /// last record set.
        #[test]
        fn reconcile_converges(sets in prop::collection::vec(record_set_strategy(), 1..5)) {
            let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
            let builder = IndexBuilder::new(store, KeySpace::new("prop"));
            let fields = vec!["Subtype".to_string()];

            for records in &sets {
                builder.reconcile("T", records, &fields).unwrap();
            }

            let last = sets.last().unwrap();
            let expected = IndexState::from_records(last, &fields);
            let stored = builder.load_state("T", &fields).unwrap();

            prop_assert_eq!(&stored.ids, &expected.ids);
            prop_assert_eq!(&stored.grouped_ids, &expected.grouped_ids);
            prop_assert_eq!(&stored.row_group_state, &expected.row_group_state);
            prop_assert_eq!(without_zero_counts(&stored), without_zero_counts(&expected));
            prop_assert!(stored.violations().is_empty(), "{:?}", stored.violations());
        }

        /// Every bucket count equals the number of keys in the bucket.
        #[test]
        fn counts_match_bucket_sizes(first in record_set_strategy(), second in record_set_strategy()) {
            let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
            let builder = IndexBuilder::new(store, KeySpace::new("prop"));
            let fields = vec!["Subtype".to_string()];

            builder.reconcile("T", &first, &fields).unwrap();
            builder.reconcile("T", &second, &fields).unwrap();

            for value in ["hero", "soldier", "mage"] {
                let ids = builder.group_ids("T", "Subtype", value).unwrap();
                let counts = builder.group_counts("T", "Subtype").unwrap();
                prop_assert_eq!(counts.get(value).copied().unwrap_or(0), ids.len() as i64);
            }
        }

        /// Reconciling the same records twice reports no changes.
        #[test]
        fn reconcile_is_idempotent(records in record_set_strategy()) {
            let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
            let builder = IndexBuilder::new(store, KeySpace::new("prop"));
            let fields = vec!["Subtype".to_string()];

            builder.reconcile("T", &records, &fields).unwrap();
            let again = builder.reconcile("T", &records, &fields).unwrap();

            prop_assert!(!again.changed());
            prop_assert_eq!(again.unchanged, records.len());
        }
    }
}

// =============================================================================
// GROUP MERGE
// =============================================================================

mod merge_properties {
    use super::*;

    proptest! {
        /// Merging identical inputs yields identical output, errors included.
        #[test]
        fn merge_is_pure(a in names_strategy(), b in names_strategy(), c in names_strategy(), rule in rule_strategy()) {
            let (ta, tb, tc) = (table(&a), table(&b), table(&c));
            let inputs = vec![("a".to_string(), &ta), ("b".to_string(), &tb), ("c".to_string(), &tc)];
            let (ta2, tb2, tc2) = (table(&a), table(&b), table(&c));
            let rebuilt = vec![("a".to_string(), &ta2), ("b".to_string(), &tb2), ("c".to_string(), &tc2)];

            let first = merge_group(&inputs, &rule);
            prop_assert_eq!(&first, &merge_group(&inputs, &rule));
            prop_assert_eq!(&first, &merge_group(&rebuilt, &rule));

            if let Ok(merged) = &first {
                let mut expected: std::collections::BTreeSet<&String> = a.keys().collect();
                expected.extend(b.keys().chain(c.keys()));
                prop_assert_eq!(merged.records.keys().collect::<std::collections::BTreeSet<_>>(), expected);
                prop_assert_eq!(merged.subtype_order.len(), 3);
            }
        }

        /// With every subtype in the priority list the input order is
        /// irrelevant.
        #[test]
        fn merge_ignores_input_order(
            a in names_strategy(),
            b in names_strategy(),
            c in names_strategy(),
            rule in rule_strategy(),
            order in Just(vec![0usize, 1, 2]).prop_shuffle(),
        ) {
            let rule = MergeRule {
                priority_order: subtypes(vec!["c", "a", "b"]),
                ..rule
            };
            let (ta, tb, tc) = (table(&a), table(&b), table(&c));
            let inputs = vec![("a".to_string(), &ta), ("b".to_string(), &tb), ("c".to_string(), &tc)];
            let shuffled: Vec<(String, &TableRecords)> =
                order.iter().map(|&i| inputs[i].clone()).collect();

            prop_assert_eq!(merge_group(&inputs, &rule), merge_group(&shuffled, &rule));
        }

        /// Under first_win the earliest subtype in priority order holding a
        /// key wins it, and every input key survives.
        #[test]
        fn first_win_follows_priority(a in names_strategy(), b in names_strategy()) {
            let (ta, tb) = (table(&a), table(&b));
            let inputs = vec![("a".to_string(), &ta), ("b".to_string(), &tb)];
            let rule = MergeRule {
                conflict_strategy: ConflictStrategy::FirstWin,
                priority_order: vec!["b".into(), "a".into()],
                ..MergeRule::default()
            };

            let merged = merge_group(&inputs, &rule).unwrap();
            prop_assert_eq!(&merged.subtype_order, &vec!["b".to_string(), "a".to_string()]);

            for key in a.keys().chain(b.keys()) {
                let expected = if b.contains_key(key) { "b" } else { "a" };
                prop_assert_eq!(merged.provenance[key].winner.as_str(), expected);
                let name = b.get(key).or_else(|| a.get(key)).unwrap();
                prop_assert_eq!(&merged.records[key]["Name"], &json!(name));
            }
            prop_assert_eq!(merged.records.len(), a.keys().chain(b.keys()).collect::<std::collections::BTreeSet<_>>().len());
        }
    }
}
