//! Property-based test generators using proptest.
//!
//! Ids are drawn from a small alphabet so that generated operation
//! sequences hit the same documents repeatedly.

use docmirror_core::{Change, Document};
use proptest::prelude::*;
use serde_json::Value;

/// Strategy for generating document ids.
pub fn doc_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-f]{1,2}").expect("Invalid regex")
}

/// Strategy for generating field names that do not collide with the
/// reserved `_id`, `_rev` and `_deleted` keys.
pub fn field_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex")
}

/// Strategy for generating scalar JSON values.
pub fn field_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        "[a-z ]{0,12}".prop_map(Value::from),
    ]
}

/// Strategy for generating live documents.
pub fn document_strategy() -> impl Strategy<Value = Document> {
    (
        doc_id_strategy(),
        prop::collection::btree_map(field_name_strategy(), field_value_strategy(), 0..4),
    )
        .prop_map(|(id, fields)| {
            fields
                .into_iter()
                .fold(Document::new(id), |doc, (key, value)| doc.with_field(key, value))
        })
}

/// An operation applied to a cache.
#[derive(Debug, Clone)]
pub enum CacheOp {
    /// Insert or replace a document
    Upsert(Document),
    /// Remove a document by id
    Remove(String),
}

/// Strategy for generating cache operations.
pub fn cache_op_strategy() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        3 => document_strategy().prop_map(CacheOp::Upsert),
        1 => doc_id_strategy().prop_map(CacheOp::Remove),
    ]
}

/// Strategy for generating a sequence of cache operations.
pub fn cache_op_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<CacheOp>> {
    prop::collection::vec(cache_op_strategy(), min_ops..max_ops)
}

/// Strategy for generating change feed entries.
pub fn change_strategy() -> impl Strategy<Value = Change> {
    (1u64..1_000, cache_op_strategy()).prop_map(|(seq, op)| match op {
        CacheOp::Upsert(doc) => Change::upsert(seq, doc),
        CacheOp::Remove(id) => Change::delete(seq, id),
    })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
