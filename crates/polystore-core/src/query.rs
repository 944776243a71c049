//! Structured query evaluator: a Mongo-style condition object parsed into a
//! tagged AST, evaluated against decoded values and envelope tags.
//!
//! Field paths use dot notation into the value; the literal path `tags`
//! addresses the envelope tag set. `$and`/`$or` short-circuit left to right.
//! Cross-type comparisons are false, never an error.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde_json::Value;

use crate::error::StoreError;
use crate::options::{QueryOptions, SortOrder};

/// Where a clause's field path points.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldPath {
    /// The envelope tag set, exposed as an array of strings.
    Tags,
    /// Dot-notation path into the stored value.
    Value(Vec<String>),
}

impl FieldPath {
    fn parse(raw: &str) -> Self {
        if raw == "tags" {
            FieldPath::Tags
        } else {
            FieldPath::Value(raw.split('.').map(String::from).collect())
        }
    }
}

/// A single comparison operator with its operand.
#[derive(Debug, Clone)]
pub enum Operator {
    /// `$eq`: equality; on array fields, also matches element containment.
    Eq(Value),
    /// `$ne`: negation of `$eq`.
    Ne(Value),
    /// `$gt`
    Gt(Value),
    /// `$gte`
    Gte(Value),
    /// `$lt`
    Lt(Value),
    /// `$lte`
    Lte(Value),
    /// `$in`: field (or any element of an array field) is in the operand list.
    In(Vec<Value>),
    /// `$nin`: negation of `$in`.
    Nin(Vec<Value>),
    /// `$regex`: field is a string matching the pattern.
    Regex(regex::Regex),
    /// `$exists`: field presence; `$exists: false` is true for missing fields.
    Exists(bool),
    /// `$type`: JSON type name (null, boolean, number, string, array, object).
    Type(String),
}

/// Parsed condition AST.
#[derive(Debug, Clone)]
pub enum Condition {
    /// All sub-conditions hold. Short-circuits on the first false.
    And(Vec<Condition>),
    /// Any sub-condition holds. Short-circuits on the first true.
    Or(Vec<Condition>),
    /// Sub-condition does not hold.
    Not(Box<Condition>),
    /// One field clause.
    Clause(FieldPath, Operator),
}

impl Condition {
    /// Parses a raw condition object into the AST. Malformed grammar fails
    /// with [`StoreError::Query`] before any backend is touched.
    pub fn parse(raw: &Value) -> Result<Self, StoreError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| StoreError::Query("condition must be an object".into()))?;

        let mut parts = Vec::with_capacity(obj.len());
        for (field, spec) in obj {
            match field.as_str() {
                "$and" => parts.push(Condition::And(Self::parse_list(spec, "$and")?)),
                "$or" => parts.push(Condition::Or(Self::parse_list(spec, "$or")?)),
                "$not" => parts.push(Condition::Not(Box::new(Self::parse(spec)?))),
                op if op.starts_with('$') => {
                    return Err(StoreError::Query(format!(
                        "operator '{op}' is not valid at the top level"
                    )));
                }
                _ => {
                    let path = FieldPath::parse(field);
                    for op in Self::parse_operators(spec)? {
                        parts.push(Condition::Clause(path.clone(), op));
                    }
                }
            }
        }
        match parts.len() {
            0 => Ok(Condition::And(vec![])), // empty condition matches everything
            1 => Ok(parts.into_iter().next().expect("len checked")),
            _ => Ok(Condition::And(parts)),
        }
    }

    fn parse_list(spec: &Value, op: &str) -> Result<Vec<Condition>, StoreError> {
        let arr = spec
            .as_array()
            .ok_or_else(|| StoreError::Query(format!("{op} takes an array of conditions")))?;
        arr.iter().map(Self::parse).collect()
    }

    /// A field spec is either a literal (implicit `$eq`) or an operator object.
    fn parse_operators(spec: &Value) -> Result<Vec<Operator>, StoreError> {
        let Some(obj) = spec.as_object() else {
            return Ok(vec![Operator::Eq(spec.clone())]);
        };
        if obj.is_empty() || !obj.keys().any(|k| k.starts_with('$')) {
            // A plain object literal compares by equality.
            return Ok(vec![Operator::Eq(spec.clone())]);
        }

        let mut ops = Vec::with_capacity(obj.len());
        for (name, operand) in obj {
            let op = match name.as_str() {
                "$eq" => Operator::Eq(operand.clone()),
                "$ne" => Operator::Ne(operand.clone()),
                "$gt" => Operator::Gt(operand.clone()),
                "$gte" => Operator::Gte(operand.clone()),
                "$lt" => Operator::Lt(operand.clone()),
                "$lte" => Operator::Lte(operand.clone()),
                "$in" => Operator::In(Self::operand_list(operand, "$in")?),
                "$nin" => Operator::Nin(Self::operand_list(operand, "$nin")?),
                "$regex" => {
                    let pattern = operand.as_str().ok_or_else(|| {
                        StoreError::Query("$regex takes a string pattern".into())
                    })?;
                    let re = regex::Regex::new(pattern).map_err(|e| {
                        StoreError::Query(format!("invalid $regex pattern: {e}"))
                    })?;
                    Operator::Regex(re)
                }
                "$exists" => {
                    let flag = operand
                        .as_bool()
                        .ok_or_else(|| StoreError::Query("$exists takes a boolean".into()))?;
                    Operator::Exists(flag)
                }
                "$type" => {
                    let name = operand
                        .as_str()
                        .ok_or_else(|| StoreError::Query("$type takes a type name".into()))?;
                    Operator::Type(name.to_string())
                }
                other => {
                    return Err(StoreError::Query(format!("unknown operator '{other}'")));
                }
            };
            ops.push(op);
        }
        Ok(ops)
    }

    fn operand_list(operand: &Value, op: &str) -> Result<Vec<Value>, StoreError> {
        operand
            .as_array()
            .cloned()
            .ok_or_else(|| StoreError::Query(format!("{op} takes an array")))
    }

    /// Evaluates the condition against one entry's decoded value and tags.
    pub fn matches(&self, value: &Value, tags: &BTreeSet<String>) -> bool {
        match self {
            Condition::And(parts) => parts.iter().all(|c| c.matches(value, tags)),
            Condition::Or(parts) => parts.iter().any(|c| c.matches(value, tags)),
            Condition::Not(inner) => !inner.matches(value, tags),
            Condition::Clause(path, op) => {
                let tags_value;
                let field = match path {
                    FieldPath::Tags => {
                        tags_value =
                            Value::Array(tags.iter().map(|t| Value::String(t.clone())).collect());
                        Some(&tags_value)
                    }
                    FieldPath::Value(segments) => resolve_path(value, segments),
                };
                eval_operator(op, field)
            }
        }
    }

    /// If a tag membership clause is a required conjunct of this condition
    /// (not under `$or`/`$not`), returns the tag list for backend pushdown.
    pub fn required_tags_any(&self) -> Option<Vec<String>> {
        match self {
            Condition::Clause(FieldPath::Tags, Operator::In(list)) => Some(
                list.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect(),
            ),
            Condition::Clause(FieldPath::Tags, Operator::Eq(Value::String(tag))) => {
                Some(vec![tag.clone()])
            }
            Condition::And(parts) => parts.iter().find_map(|c| c.required_tags_any()),
            _ => None,
        }
    }
}

/// Walks a dot-notation path. Missing intermediate segments resolve to `None`.
fn resolve_path<'a>(value: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut current = value;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Orders two values of compatible types. Numbers and strings order natively;
/// booleans order false < true; everything else is incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn eval_operator(op: &Operator, field: Option<&Value>) -> bool {
    // Missing fields fail every clause except $exists: false.
    let Some(field) = field else {
        return matches!(op, Operator::Exists(false));
    };
    match op {
        Operator::Eq(operand) => eq_matches(field, operand),
        Operator::Ne(operand) => !eq_matches(field, operand),
        Operator::Gt(operand) => {
            compare_values(field, operand) == Some(Ordering::Greater)
        }
        Operator::Gte(operand) => matches!(
            compare_values(field, operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::Lt(operand) => compare_values(field, operand) == Some(Ordering::Less),
        Operator::Lte(operand) => matches!(
            compare_values(field, operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Operator::In(list) => in_matches(field, list),
        Operator::Nin(list) => !in_matches(field, list),
        Operator::Regex(re) => field.as_str().map(|s| re.is_match(s)).unwrap_or(false),
        Operator::Exists(flag) => *flag,
        Operator::Type(name) => type_name(field) == name,
    }
}

/// Equality, with Mongo-style containment on array fields.
fn eq_matches(field: &Value, operand: &Value) -> bool {
    if field == operand {
        return true;
    }
    match field {
        Value::Array(items) if !operand.is_array() => items.contains(operand),
        _ => false,
    }
}

/// `$in`: the field, or any element of an array field, equals a list member.
fn in_matches(field: &Value, list: &[Value]) -> bool {
    match field {
        Value::Array(items) => items.iter().any(|item| list.contains(item)),
        scalar => list.contains(scalar),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One matching entry from a query, before deserialization into a caller type.
#[derive(Debug, Clone)]
pub struct QueryHit {
    /// Caller-visible key.
    pub key: String,
    /// Decoded value. `Null` when the payload could not be decoded (encrypted
    /// without a usable password); such entries only match tag clauses.
    pub value: Value,
    /// Backend the entry was taken from (first writer wins on duplicates).
    pub backend: String,
}

/// Applies sort, skip and limit exactly once, on the unioned result set.
pub fn sort_and_page(mut hits: Vec<QueryHit>, opts: &QueryOptions) -> Vec<QueryHit> {
    if let Some(field) = &opts.sort_by {
        let segments: Vec<String> = field.split('.').map(String::from).collect();
        hits.sort_by(|a, b| {
            let va = resolve_path(&a.value, &segments);
            let vb = resolve_path(&b.value, &segments);
            let ord = match (va, vb) {
                (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                // Entries missing the sort field go last regardless of direction.
                (Some(_), None) => return Ordering::Less,
                (None, Some(_)) => return Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            match opts.order {
                SortOrder::Ascending => ord,
                SortOrder::Descending => ord.reverse(),
            }
        });
    }
    let skipped = hits.into_iter().skip(opts.skip);
    match opts.limit {
        Some(limit) => skipped.take(limit).collect(),
        None => skipped.collect(),
    }
}
