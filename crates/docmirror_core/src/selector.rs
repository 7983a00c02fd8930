//! Document predicates.
//!
//! A [`Selector`] is a Mango-style JSON expression compiled into a clause
//! tree once and evaluated against each document on every read:
//!
//! ```
//! use docmirror_core::{Document, Predicate, Selector};
//! use serde_json::json;
//!
//! let selector = Selector::parse(json!({"_deleted": false, "year": {"$gte": 2020}})).unwrap();
//! assert!(selector.matches(&Document::new("a").with_field("year", 2021)));
//! assert!(!selector.matches(&Document::new("b").with_field("year", 1999)));
//! ```
//!
//! Field names may be dotted paths into nested objects. A bare value is an
//! implicit `$eq`. Operators the selector does not understand are kept as
//! unsupported clauses. A selector containing one never matches, also under
//! `$not` and `$nor`, so the affected documents are left out of results
//! instead of failing the read.

use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use tracing::debug;

/// Something that decides whether a document belongs to a view.
pub trait Predicate: Send + Sync {
    /// Returns true if `doc` matches.
    fn matches(&self, doc: &Document) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&Document) -> bool + Send + Sync,
{
    fn matches(&self, doc: &Document) -> bool {
        self(doc)
    }
}

/// A compiled Mango-style selector.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    source: Value,
    root: Clause,
}

#[derive(Debug, Clone, PartialEq)]
enum Clause {
    And(Vec<Clause>),
    Or(Vec<Clause>),
    Nor(Vec<Clause>),
    Not(Box<Clause>),
    Field {
        path: Vec<String>,
        conditions: Vec<Condition>,
    },
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Size(usize),
    All(Vec<Value>),
    Not(Vec<Condition>),
    Unsupported(String),
}

impl Selector {
    /// Compiles a selector from a JSON object.
    pub fn parse(source: Value) -> CoreResult<Self> {
        let object = source
            .as_object()
            .ok_or_else(|| CoreError::invalid_selector("selector must be a JSON object"))?;
        let root = compile_object(object)?;
        Ok(Self { source, root })
    }

    /// A selector matching every document.
    pub fn all() -> Self {
        Self {
            source: Value::Object(Map::new()),
            root: Clause::And(Vec::new()),
        }
    }

    /// Returns the JSON the selector was compiled from.
    pub fn source(&self) -> &Value {
        &self.source
    }

    /// Evaluates the selector against a JSON value.
    pub fn matches_value(&self, value: &Value) -> bool {
        eval_clause(&self.root, value).unwrap_or(false)
    }
}

impl Predicate for Selector {
    fn matches(&self, doc: &Document) -> bool {
        self.matches_value(&doc.to_value())
    }
}

impl TryFrom<Value> for Selector {
    type Error = CoreError;

    fn try_from(value: Value) -> CoreResult<Self> {
        Self::parse(value)
    }
}

fn compile_object(object: &Map<String, Value>) -> CoreResult<Clause> {
    let mut clauses = Vec::with_capacity(object.len());
    for (key, value) in object {
        clauses.push(compile_entry(key, value)?);
    }
    Ok(match clauses.len() {
        1 => clauses.remove(0),
        _ => Clause::And(clauses),
    })
}

fn compile_list(key: &str, value: &Value) -> CoreResult<Vec<Clause>> {
    let items = value
        .as_array()
        .ok_or_else(|| CoreError::invalid_selector(format!("{key} expects an array")))?;
    items
        .iter()
        .map(|item| {
            item.as_object()
                .ok_or_else(|| CoreError::invalid_selector(format!("{key} items must be objects")))
                .and_then(compile_object)
        })
        .collect()
}

fn compile_entry(key: &str, value: &Value) -> CoreResult<Clause> {
    match key {
        "$and" => Ok(Clause::And(compile_list(key, value)?)),
        "$or" => Ok(Clause::Or(compile_list(key, value)?)),
        "$nor" => Ok(Clause::Nor(compile_list(key, value)?)),
        "$not" => {
            let object = value
                .as_object()
                .ok_or_else(|| CoreError::invalid_selector("$not expects an object"))?;
            Ok(Clause::Not(Box::new(compile_object(object)?)))
        }
        op if op.starts_with('$') => {
            debug!(operator = op, "unsupported selector combinator");
            Ok(Clause::Unsupported(op.to_string()))
        }
        field => Ok(Clause::Field {
            path: field.split('.').map(str::to_string).collect(),
            conditions: compile_conditions(value),
        }),
    }
}

fn is_operator_object(value: &Value) -> bool {
    match value.as_object() {
        Some(object) if !object.is_empty() => object.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn compile_conditions(value: &Value) -> Vec<Condition> {
    if !is_operator_object(value) {
        return vec![Condition::Eq(value.clone())];
    }
    let Some(object) = value.as_object() else {
        return Vec::new();
    };
    object
        .iter()
        .map(|(op, operand)| compile_condition(op, operand))
        .collect()
}

fn compile_condition(op: &str, operand: &Value) -> Condition {
    let list = |operand: &Value| operand.as_array().cloned();
    match op {
        "$eq" => Condition::Eq(operand.clone()),
        "$ne" => Condition::Ne(operand.clone()),
        "$gt" => Condition::Gt(operand.clone()),
        "$gte" => Condition::Gte(operand.clone()),
        "$lt" => Condition::Lt(operand.clone()),
        "$lte" => Condition::Lte(operand.clone()),
        "$in" => list(operand).map_or(Condition::Unsupported(op.into()), Condition::In),
        "$nin" => list(operand).map_or(Condition::Unsupported(op.into()), Condition::Nin),
        "$all" => list(operand).map_or(Condition::Unsupported(op.into()), Condition::All),
        "$exists" => operand
            .as_bool()
            .map_or(Condition::Unsupported(op.into()), Condition::Exists),
        "$size" => operand
            .as_u64()
            .map_or(Condition::Unsupported(op.into()), |n| {
                Condition::Size(n as usize)
            }),
        "$not" => Condition::Not(compile_conditions(operand)),
        other => {
            debug!(operator = other, "unsupported selector operator");
            Condition::Unsupported(other.to_string())
        }
    }
}

fn lookup<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter()
        .try_fold(value, |current, part| current.as_object()?.get(part))
}

/// Evaluates every clause. `None` if any of them is unsupported.
fn eval_all(clauses: &[Clause], value: &Value) -> Option<Vec<bool>> {
    clauses.iter().map(|c| eval_clause(c, value)).collect()
}

/// Three-valued evaluation: `None` marks a clause that contains an
/// unsupported operator. It stays `None` under negation.
fn eval_clause(clause: &Clause, value: &Value) -> Option<bool> {
    match clause {
        Clause::And(clauses) => Some(eval_all(clauses, value)?.into_iter().all(|m| m)),
        Clause::Or(clauses) => Some(eval_all(clauses, value)?.into_iter().any(|m| m)),
        Clause::Nor(clauses) => Some(!eval_all(clauses, value)?.into_iter().any(|m| m)),
        Clause::Not(inner) => eval_clause(inner, value).map(|m| !m),
        Clause::Field { path, conditions } => {
            let field = lookup(value, path);
            let results: Option<Vec<bool>> =
                conditions.iter().map(|c| eval_condition(c, field)).collect();
            Some(results?.into_iter().all(|m| m))
        }
        Clause::Unsupported(_) => None,
    }
}

/// Orders numbers, strings and booleans of the same kind.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn eval_condition(condition: &Condition, field: Option<&Value>) -> Option<bool> {
    Some(match condition {
        Condition::Exists(expected) => field.is_some() == *expected,
        Condition::Ne(operand) => field != Some(operand),
        Condition::Nin(items) => field.map_or(true, |v| !items.contains(v)),
        Condition::Not(conditions) => {
            let results: Option<Vec<bool>> =
                conditions.iter().map(|c| eval_condition(c, field)).collect();
            !results?.into_iter().all(|m| m)
        }
        Condition::Unsupported(_) => return None,
        _ => match field {
            Some(value) => eval_present(condition, value),
            None => false,
        },
    })
}

fn eval_present(condition: &Condition, value: &Value) -> bool {
    let ordered = |operand: &Value, accept: fn(Ordering) -> bool| {
        compare(value, operand).is_some_and(accept)
    };
    match condition {
        Condition::Eq(operand) => value == operand,
        Condition::Gt(operand) => ordered(operand, Ordering::is_gt),
        Condition::Gte(operand) => ordered(operand, Ordering::is_ge),
        Condition::Lt(operand) => ordered(operand, Ordering::is_lt),
        Condition::Lte(operand) => ordered(operand, Ordering::is_le),
        Condition::In(items) => items.contains(value),
        Condition::Size(n) => value.as_array().is_some_and(|a| a.len() == *n),
        Condition::All(items) => value
            .as_array()
            .is_some_and(|a| items.iter().all(|item| a.contains(item))),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sel(value: Value) -> Selector {
        Selector::parse(value).unwrap()
    }

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn implicit_equality() {
        let s = sel(json!({"type": "project"}));
        assert!(s.matches(&doc(json!({"_id": "a", "type": "project"}))));
        assert!(!s.matches(&doc(json!({"_id": "b", "type": "user"}))));
        assert!(!s.matches(&doc(json!({"_id": "c"}))));
    }

    #[test]
    fn deleted_flag() {
        let s = sel(json!({"_deleted": false}));
        assert!(s.matches(&Document::new("a")));
        assert!(!s.matches(&Document::new("b").deleted()));
    }

    #[test]
    fn comparisons() {
        let s = sel(json!({"n": {"$gt": 1, "$lte": 3}}));
        assert!(!s.matches(&doc(json!({"_id": "a", "n": 1}))));
        assert!(s.matches(&doc(json!({"_id": "a", "n": 2}))));
        assert!(s.matches(&doc(json!({"_id": "a", "n": 3}))));
        assert!(!s.matches(&doc(json!({"_id": "a", "n": "3"}))));
    }

    #[test]
    fn membership_and_existence() {
        let s = sel(json!({"tag": {"$in": ["x", "y"]}, "owner": {"$exists": false}}));
        assert!(s.matches(&doc(json!({"_id": "a", "tag": "y"}))));
        assert!(!s.matches(&doc(json!({"_id": "a", "tag": "y", "owner": "bob"}))));

        let s = sel(json!({"tag": {"$nin": ["x"]}}));
        assert!(s.matches(&doc(json!({"_id": "a"}))));
        assert!(!s.matches(&doc(json!({"_id": "a", "tag": "x"}))));
    }

    #[test]
    fn nested_paths_and_arrays() {
        let s = sel(json!({"meta.owner": "ann", "labels": {"$all": ["a"], "$size": 2}}));
        assert!(s.matches(&doc(json!({"_id": "a", "meta": {"owner": "ann"}, "labels": ["a", "b"]}))));
        assert!(!s.matches(&doc(json!({"_id": "a", "meta": {"owner": "ann"}, "labels": ["a"]}))));
    }

    #[test]
    fn logical_operators() {
        let s = sel(json!({"$or": [{"n": 1}, {"n": 2}], "$not": {"hidden": true}}));
        assert!(s.matches(&doc(json!({"_id": "a", "n": 2}))));
        assert!(!s.matches(&doc(json!({"_id": "a", "n": 2, "hidden": true}))));
        assert!(!s.matches(&doc(json!({"_id": "a", "n": 3}))));

        let s = sel(json!({"$nor": [{"n": 1}]}));
        assert!(s.matches(&doc(json!({"_id": "a", "n": 2}))));
    }

    #[test]
    fn field_level_not() {
        let s = sel(json!({"n": {"$not": {"$gt": 5}}}));
        assert!(s.matches(&doc(json!({"_id": "a", "n": 2}))));
        assert!(!s.matches(&doc(json!({"_id": "a", "n": 9}))));
    }

    #[test]
    fn unsupported_operators_never_match() {
        let s = sel(json!({"title": {"$regex": "^a"}}));
        assert!(!s.matches(&doc(json!({"_id": "a", "title": "abc"}))));
        let s = sel(json!({"$text": "abc"}));
        assert!(!s.matches(&doc(json!({"_id": "a"}))));
    }

    #[test]
    fn negated_unsupported_operators_never_match() {
        let d = Document::new("a").with_field("title", "abc");
        let negated = [
            json!({"title": {"$not": {"$regex": "^x"}}}),
            json!({"$not": {"$where": "true"}}),
            json!({"$nor": [{"title": {"$regex": "^x"}}]}),
            json!({"$or": [{"title": "abc"}, {"title": {"$regex": "^a"}}]}),
        ];
        for source in negated {
            assert!(!sel(source.clone()).matches(&d), "{source} matched");
        }
    }

    #[test]
    fn deleted_filter_over_cache_ignores_insertion_order() {
        use crate::cache::OrderedCache;

        let live_a = Document::new("a").with_field("n", 1);
        let gone = Document::tombstone("b", Some("2-x".into()));
        let live_c = Document::new("c").with_field("n", 3);
        let s = sel(json!({"_deleted": false}));

        for order in [
            vec![live_a.clone(), gone.clone(), live_c.clone()],
            vec![gone.clone(), live_c.clone(), live_a.clone()],
        ] {
            let mut cache = OrderedCache::new();
            cache.extend(order);
            assert_eq!(cache.len(), 3);
            let ids: Vec<&str> = cache
                .iter()
                .filter(|doc| s.matches(doc))
                .map(|doc| doc.id.as_str())
                .collect();
            assert_eq!(ids, vec!["a", "c"]);
        }
    }

    #[test]
    fn rejects_non_objects() {
        assert!(Selector::parse(json!([1])).is_err());
        assert!(Selector::parse(json!({"$or": {"n": 1}})).is_err());
    }

    #[test]
    fn empty_selector_matches_everything() {
        assert!(Selector::all().matches(&Document::new("x")));
        assert!(sel(json!({})).matches(&Document::new("x")));
    }

    #[test]
    fn closures_are_predicates() {
        let p = |d: &Document| d.id.starts_with('p');
        assert!(Predicate::matches(&p, &Document::new("proj")));
        assert!(!Predicate::matches(&p, &Document::new("user")));
    }
}
