/// Mango-style selector matching, shared by the change feed's `_selector`
/// filter (§4.2/§6) and `rouchdb-query`'s `find`.
///
/// A selector is an ordinary JSON object. Each top-level field either names
/// a document field with an implicit `$eq`, or a `$and`/`$or`/`$nor` of
/// sub-selectors, or an object of operators (`{"$gt": 5, "$lt": 10}`).
use regex::Regex;
use serde_json::Value;

/// Evaluate `selector` against `doc` (the document body, without the
/// reserved `_id`/`_rev`/... fields stripped or added back — callers
/// decide what `doc` contains).
pub fn matches(doc: &Value, selector: &Value) -> bool {
    let Some(obj) = selector.as_object() else {
        return true;
    };
    if obj.is_empty() {
        return true;
    }
    obj.iter().all(|(key, cond)| match key.as_str() {
        "$and" => as_array(cond).iter().all(|s| matches(doc, s)),
        "$or" => as_array(cond).iter().any(|s| matches(doc, s)),
        "$nor" => !as_array(cond).iter().any(|s| matches(doc, s)),
        "$not" => !matches(doc, cond),
        _ => field_matches(get_field(doc, key), cond),
    })
}

fn as_array(v: &Value) -> Vec<Value> {
    v.as_array().cloned().unwrap_or_default()
}

/// Dotted-path field lookup (`"a.b.c"`), matching Mango selector field
/// addressing.
fn get_field<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn field_matches(value: Option<&Value>, cond: &Value) -> bool {
    match cond {
        Value::Object(ops) if ops.keys().all(|k| k.starts_with('$')) && !ops.is_empty() => ops
            .iter()
            .all(|(op, operand)| apply_operator(value, op, operand)),
        other => value == Some(other),
    }
}

fn apply_operator(value: Option<&Value>, op: &str, operand: &Value) -> bool {
    match op {
        "$eq" => value == Some(operand),
        "$ne" => value != Some(operand),
        "$gt" => compare(value, operand).is_some_and(|o| o.is_gt()),
        "$gte" => compare(value, operand).is_some_and(|o| o.is_ge()),
        "$lt" => compare(value, operand).is_some_and(|o| o.is_lt()),
        "$lte" => compare(value, operand).is_some_and(|o| o.is_le()),
        "$exists" => {
            let want = operand.as_bool().unwrap_or(true);
            value.is_some() == want
        }
        "$in" => operand
            .as_array()
            .is_some_and(|arr| value.is_some_and(|v| arr.contains(v))),
        "$nin" => !operand
            .as_array()
            .is_some_and(|arr| value.is_some_and(|v| arr.contains(v))),
        "$all" => operand.as_array().is_some_and(|wanted| {
            value
                .and_then(|v| v.as_array())
                .is_some_and(|have| wanted.iter().all(|w| have.contains(w)))
        }),
        "$size" => value
            .and_then(|v| v.as_array())
            .is_some_and(|arr| Some(arr.len() as u64) == operand.as_u64()),
        "$type" => value.is_some_and(|v| json_type_name(v) == operand.as_str().unwrap_or("")),
        "$regex" => value
            .and_then(|v| v.as_str())
            .zip(operand.as_str())
            .and_then(|(s, pat)| Regex::new(pat).ok().map(|re| re.is_match(s)))
            .unwrap_or(false),
        "$not" => !field_matches(value, operand),
        _ => false, // unknown operators never match (fail closed)
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Order two JSON scalars the way CouchDB/Mango does: numbers and strings
/// compare natively; anything else is incomparable.
pub fn compare(a: Option<&Value>, b: &Value) -> Option<std::cmp::Ordering> {
    let a = a?;
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn implicit_eq_and_explicit_operators() {
        let doc = json!({"name": "Bob", "age": 25});
        assert!(matches(&doc, &json!({"name": "Bob"})));
        assert!(!matches(&doc, &json!({"name": "Alice"})));
        assert!(matches(&doc, &json!({"age": {"$gt": 20}})));
        assert!(!matches(&doc, &json!({"age": {"$gt": 30}})));
    }

    #[test]
    fn logical_combinators() {
        let doc = json!({"type": "user", "age": 30});
        assert!(matches(
            &doc,
            &json!({"$and": [{"type": "user"}, {"age": {"$gte": 18}}]})
        ));
        assert!(!matches(
            &doc,
            &json!({"$and": [{"type": "user"}, {"age": {"$gte": 40}}]})
        ));
        assert!(matches(
            &doc,
            &json!({"$or": [{"type": "admin"}, {"age": 30}]})
        ));
        assert!(matches(&doc, &json!({"$nor": [{"type": "admin"}]})));
    }

    #[test]
    fn empty_selector_matches_everything() {
        assert!(matches(&json!({"a": 1}), &json!({})));
    }

    #[test]
    fn exists_in_nin_and_regex() {
        let doc = json!({"tags": ["a", "b"], "name": "widget-42"});
        assert!(matches(&doc, &json!({"tags": {"$all": ["a", "b"]}})));
        assert!(matches(&doc, &json!({"tags": {"$size": 2}})));
        assert!(matches(&doc, &json!({"missing": {"$exists": false}})));
        assert!(matches(&doc, &json!({"name": {"$regex": "^widget-"}})));
        assert!(matches(&doc, &json!({"name": {"$in": ["widget-42", "x"]}})));
        assert!(matches(&doc, &json!({"name": {"$nin": ["other"]}})));
    }

    #[test]
    fn dotted_field_path() {
        let doc = json!({"a": {"b": 5}});
        assert!(matches(&doc, &json!({"a.b": 5})));
    }
}
