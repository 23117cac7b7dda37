//! Mango-style filter/sort/project/paginate evaluator. Pure: no I/O, no
//! knowledge of where documents come from.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::error::{Result, StoreError};

/// A query against an in-memory sequence of documents.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub filter: Option<Value>,
    pub sort: Option<Vec<(String, SortDirection)>>,
    pub projection: Option<Map<String, Value>>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Whether a resolved dotted path was present (possibly `null`) or absent.
enum FieldValue<'a> {
    Undefined,
    Value(&'a Value),
}

/// Runs `spec` over `documents` in filter → sort → paginate → project order.
pub fn evaluate(documents: &[Value], spec: &QuerySpec) -> Result<Vec<Value>> {
    let mut matched: Vec<&Value> = Vec::new();
    for doc in documents {
        if spec
            .filter
            .as_ref()
            .map(|f| match_filter(doc, f))
            .transpose()?
            .unwrap_or(true)
        {
            matched.push(doc);
        }
    }

    if let Some(sort) = &spec.sort {
        matched.sort_by(|a, b| compare_by_sort(a, b, sort));
    }

    let skip = spec.skip.unwrap_or(0);
    let paginated: Vec<&Value> = if skip >= matched.len() {
        Vec::new()
    } else {
        match spec.limit {
            Some(limit) => matched[skip..].iter().take(limit).copied().collect(),
            None => matched[skip..].to_vec(),
        }
    };

    paginated
        .into_iter()
        .map(|doc| project(doc, spec.projection.as_ref()))
        .collect()
}

/// Evaluates `filter` against a single `document`.
pub fn match_filter(document: &Value, filter: &Value) -> Result<bool> {
    let map = filter
        .as_object()
        .ok_or_else(|| StoreError::validation("filter must be an object"))?;

    for (key, condition) in map {
        let matches = match key.as_str() {
            "$and" => {
                let clauses = condition
                    .as_array()
                    .ok_or_else(|| StoreError::validation("$and requires an array of filters"))?;
                let mut ok = true;
                for clause in clauses {
                    if !match_filter(document, clause)? {
                        ok = false;
                        break;
                    }
                }
                ok
            }
            "$or" => {
                let clauses = condition
                    .as_array()
                    .ok_or_else(|| StoreError::validation("$or requires an array of filters"))?;
                let mut ok = false;
                for clause in clauses {
                    if match_filter(document, clause)? {
                        ok = true;
                        break;
                    }
                }
                ok
            }
            "$not" => !match_filter(document, condition)?,
            field_path => {
                let resolved = resolve_field(document, field_path);
                match_condition(&resolved, condition)?
            }
        };
        if !matches {
            return Ok(false);
        }
    }
    Ok(true)
}

fn match_condition(field: &FieldValue, condition: &Value) -> Result<bool> {
    match condition {
        Value::Object(ops) if ops.keys().all(|k| k.starts_with('$')) && !ops.is_empty() => {
            for (op, operand) in ops {
                if !apply_operator(field, op, operand)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        literal => Ok(field_equals(field, literal)),
    }
}

fn apply_operator(field: &FieldValue, op: &str, operand: &Value) -> Result<bool> {
    Ok(match op {
        "$eq" => field_equals(field, operand),
        "$ne" => !field_equals(field, operand),
        "$in" => {
            let options = operand
                .as_array()
                .ok_or_else(|| StoreError::validation("$in requires an array"))?;
            options.iter().any(|o| field_equals(field, o))
        }
        "$nin" => {
            let options = operand
                .as_array()
                .ok_or_else(|| StoreError::validation("$nin requires an array"))?;
            !options.iter().any(|o| field_equals(field, o))
        }
        "$gt" => field_compare(field, operand) == Some(Ordering::Greater),
        "$gte" => matches!(field_compare(field, operand), Some(Ordering::Greater | Ordering::Equal)),
        "$lt" => field_compare(field, operand) == Some(Ordering::Less),
        "$lte" => matches!(field_compare(field, operand), Some(Ordering::Less | Ordering::Equal)),
        "$exists" => {
            let want = operand
                .as_bool()
                .ok_or_else(|| StoreError::validation("$exists requires a boolean"))?;
            let exists = !matches!(field, FieldValue::Undefined);
            exists == want
        }
        "$type" => {
            let want = operand
                .as_str()
                .ok_or_else(|| StoreError::validation("$type requires a string"))?;
            type_name(field) == want
        }
        other => return Err(StoreError::validation(format!("unknown query operator {other:?}"))),
    })
}

fn type_name(field: &FieldValue) -> &'static str {
    match field {
        FieldValue::Undefined => "undefined",
        FieldValue::Value(Value::Null) => "null",
        FieldValue::Value(Value::Bool(_)) => "boolean",
        FieldValue::Value(Value::Number(_)) => "number",
        FieldValue::Value(Value::String(_)) => "string",
        FieldValue::Value(Value::Array(_)) => "array",
        FieldValue::Value(Value::Object(_)) => "object",
    }
}

/// Equality with array-containment semantics: if the field resolves to an
/// array, the condition matches when any element equals the operand.
fn field_equals(field: &FieldValue, operand: &Value) -> bool {
    match field {
        FieldValue::Undefined => operand.is_null(),
        FieldValue::Value(Value::Array(items)) => items.iter().any(|item| item == operand),
        FieldValue::Value(value) => *value == operand,
    }
}

fn field_compare(field: &FieldValue, operand: &Value) -> Option<Ordering> {
    match field {
        FieldValue::Undefined => compare_values(&Value::Null, operand),
        FieldValue::Value(value) => compare_values(value, operand),
    }
}

/// Type-precedence ordering: undefined/null < boolean < number < string < object.
/// Arrays are ordered with objects (neither appears in the spec's precedence
/// list as a distinct tier, so both fall back to tier 4).
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Object(_) | Value::Array(_) => 4,
    }
}

pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    let rank_a = type_rank(a);
    let rank_b = type_rank(b);
    if rank_a != rank_b {
        return Some(rank_a.cmp(&rank_b));
    }
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => x.as_f64().partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Resolves a dotted field path against `document`, distinguishing an
/// explicit `null` from an absent field.
fn resolve_field<'a>(document: &'a Value, path: &str) -> FieldValue<'a> {
    let mut current = document;
    for segment in path.split('.') {
        match current.as_object().and_then(|m| m.get(segment)) {
            Some(next) => current = next,
            None => return FieldValue::Undefined,
        }
    }
    FieldValue::Value(current)
}

fn compare_by_sort(a: &Value, b: &Value, sort: &[(String, SortDirection)]) -> Ordering {
    for (field, direction) in sort {
        let fa = resolve_field(a, field);
        let fb = resolve_field(b, field);
        let ordering = field_compare_pair(&fa, &fb).unwrap_or(Ordering::Equal);
        let ordering = match direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn field_compare_pair(a: &FieldValue, b: &FieldValue) -> Option<Ordering> {
    let av = match a {
        FieldValue::Undefined => Value::Null,
        FieldValue::Value(v) => (*v).clone(),
    };
    let bv = match b {
        FieldValue::Undefined => Value::Null,
        FieldValue::Value(v) => (*v).clone(),
    };
    compare_values(&av, &bv)
}

/// Applies a projection spec to a single document. Inclusion mode (any
/// value truthy as `1`) retains the literal dotted-path keys requested,
/// flat, without expanding them into nested structure. Exclusion mode
/// (every value `0`) removes the named dotted paths from a deep clone.
/// An empty or absent projection spec passes the document through as-is.
pub fn project(document: &Value, projection: Option<&Map<String, Value>>) -> Result<Value> {
    let Some(projection) = projection else {
        return Ok(document.clone());
    };
    if projection.is_empty() {
        return Ok(document.clone());
    }

    let is_inclusion = projection.values().any(|v| truthy(v));
    let is_exclusion = projection.values().all(|v| !truthy(v));
    if !is_inclusion && !is_exclusion {
        return Err(StoreError::validation(
            "projection cannot mix inclusion and exclusion",
        ));
    }

    if is_inclusion {
        let mut out = Map::new();
        for key in projection.keys() {
            if let FieldValue::Value(value) = resolve_field(document, key) {
                out.insert(key.clone(), value.clone());
            }
        }
        Ok(Value::Object(out))
    } else {
        let mut out = document.clone();
        for key in projection.keys() {
            remove_dotted_path(&mut out, key);
        }
        Ok(out)
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::Bool(b) => *b,
        Value::Null => false,
        _ => true,
    }
}

fn remove_dotted_path(value: &mut Value, path: &str) {
    let mut segments = path.split('.').peekable();
    let mut current = value;
    while let Some(segment) = segments.next() {
        let Some(map) = current.as_object_mut() else { return };
        if segments.peek().is_none() {
            map.remove(segment);
            return;
        }
        match map.get_mut(segment) {
            Some(next) => current = next,
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equality_and_array_containment() {
        let doc = json!({"tags": ["a", "b"], "status": "open"});
        assert!(match_filter(&doc, &json!({"status": "open"})).unwrap());
        assert!(match_filter(&doc, &json!({"tags": "a"})).unwrap());
        assert!(!match_filter(&doc, &json!({"tags": "z"})).unwrap());
    }

    #[test]
    fn logical_operators() {
        let doc = json!({"a": 1, "b": 2});
        assert!(match_filter(&doc, &json!({"$and": [{"a": 1}, {"b": 2}]})).unwrap());
        assert!(!match_filter(&doc, &json!({"$and": [{"a": 1}, {"b": 3}]})).unwrap());
        assert!(match_filter(&doc, &json!({"$or": [{"a": 9}, {"b": 2}]})).unwrap());
        assert!(match_filter(&doc, &json!({"$not": {"a": 9}})).unwrap());
    }

    #[test]
    fn exists_distinguishes_absent_from_null() {
        let doc = json!({"a": null});
        assert!(match_filter(&doc, &json!({"a": {"$exists": true}})).unwrap());
        assert!(match_filter(&doc, &json!({"b": {"$exists": false}})).unwrap());
        assert!(!match_filter(&doc, &json!({"a": {"$exists": false}})).unwrap());
    }

    #[test]
    fn unknown_operator_is_an_error() {
        let doc = json!({"a": 1});
        assert!(match_filter(&doc, &json!({"a": {"$bogus": 1}})).is_err());
    }

    #[test]
    fn ordering_precedence_across_mixed_types() {
        assert_eq!(compare_values(&json!(null), &json!(true)), Some(Ordering::Less));
        assert_eq!(compare_values(&json!(true), &json!(1)), Some(Ordering::Less));
        assert_eq!(compare_values(&json!(1), &json!("x")), Some(Ordering::Less));
        assert_eq!(compare_values(&json!("x"), &json!({"a": 1})), Some(Ordering::Less));
    }

    #[test]
    fn evaluate_pipeline_sorts_paginates_and_projects() {
        let docs = vec![
            json!({"name": "c", "rank": 3}),
            json!({"name": "a", "rank": 1}),
            json!({"name": "b", "rank": 2}),
        ];
        let spec = QuerySpec {
            filter: None,
            sort: Some(vec![("rank".to_string(), SortDirection::Ascending)]),
            projection: Some({
                let mut m = Map::new();
                m.insert("name".to_string(), json!(1));
                m
            }),
            skip: Some(1),
            limit: Some(1),
        };
        let result = evaluate(&docs, &spec).unwrap();
        assert_eq!(result, vec![json!({"name": "b"})]);
    }

    #[test]
    fn exclusion_projection_removes_dotted_paths() {
        let doc = json!({"name": "a", "meta": {"secret": 1, "public": 2}});
        let mut projection = Map::new();
        projection.insert("meta.secret".to_string(), json!(0));
        let result = project(&doc, Some(&projection)).unwrap();
        assert_eq!(result, json!({"name": "a", "meta": {"public": 2}}));
    }

    #[test]
    fn mixed_projection_is_rejected() {
        let doc = json!({"a": 1, "b": 2});
        let mut projection = Map::new();
        projection.insert("a".to_string(), json!(1));
        projection.insert("b".to_string(), json!(0));
        assert!(project(&doc, Some(&projection)).is_err());
    }

    /// A bounded pool of documents carrying a single sortable `rank`, used
    /// by the property tests below to check pipeline invariants that must
    /// hold no matter how the ranks happen to be distributed (ties
    /// included, since `proptest` draws from a small range on purpose).
    fn arb_ranked_docs() -> impl proptest::strategy::Strategy<Value = Vec<Value>> {
        use proptest::prelude::*;
        prop::collection::vec(0i32..5, 0..12)
            .prop_map(|ranks| ranks.into_iter().map(|r| json!({"rank": r})).collect())
    }

    proptest::proptest! {
        /// `skip`/`limit` never produce more rows than requested, and never
        /// more than the number of matching documents.
        #[test]
        fn pagination_respects_skip_and_limit_bounds(
            docs in arb_ranked_docs(),
            skip in 0usize..8,
            limit in 0usize..8,
        ) {
            let spec = QuerySpec {
                skip: Some(skip),
                limit: Some(limit),
                ..QuerySpec::default()
            };
            let result = evaluate(&docs, &spec).unwrap();
            assert!(result.len() <= limit);
            assert!(result.len() <= docs.len().saturating_sub(skip));
        }

        /// An ascending sort by `rank` never leaves two adjacent results out
        /// of order, whether or not the pool contains ties.
        #[test]
        fn ascending_sort_never_produces_an_inversion(docs in arb_ranked_docs()) {
            let spec = QuerySpec {
                sort: Some(vec![("rank".to_string(), SortDirection::Ascending)]),
                ..QuerySpec::default()
            };
            let result = evaluate(&docs, &spec).unwrap();
            for window in result.windows(2) {
                let a = window[0]["rank"].as_i64().unwrap();
                let b = window[1]["rank"].as_i64().unwrap();
                assert!(a <= b, "inversion: {a} appeared before {b}");
            }
        }

        /// Sorting descending is exactly the reverse comparison of sorting
        /// ascending: same multiset of ranks, opposite order.
        #[test]
        fn descending_sort_is_ascending_reversed(docs in arb_ranked_docs()) {
            let asc_spec = QuerySpec {
                sort: Some(vec![("rank".to_string(), SortDirection::Ascending)]),
                ..QuerySpec::default()
            };
            let desc_spec = QuerySpec {
                sort: Some(vec![("rank".to_string(), SortDirection::Descending)]),
                ..QuerySpec::default()
            };
            let mut ascending: Vec<i64> = evaluate(&docs, &asc_spec)
                .unwrap()
                .iter()
                .map(|d| d["rank"].as_i64().unwrap())
                .collect();
            let descending: Vec<i64> = evaluate(&docs, &desc_spec)
                .unwrap()
                .iter()
                .map(|d| d["rank"].as_i64().unwrap())
                .collect();
            ascending.reverse();
            assert_eq!(ascending, descending);
        }

        /// Filtering can only shrink the result set: every document that
        /// survives an `$eq` filter actually carries that rank.
        #[test]
        fn eq_filter_only_keeps_matching_documents(docs in arb_ranked_docs(), target in 0i32..5) {
            let spec = QuerySpec {
                filter: Some(json!({"rank": target})),
                ..QuerySpec::default()
            };
            let result = evaluate(&docs, &spec).unwrap();
            for doc in &result {
                assert_eq!(doc["rank"].as_i64().unwrap(), target as i64);
            }
            let expected = docs.iter().filter(|d| d["rank"] == json!(target)).count();
            assert_eq!(result.len(), expected);
        }
    }
}
