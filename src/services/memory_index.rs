//! src/services/memory_index.rs
//!
//! In-process index backend. Documents are held as JSON and queries are
//! evaluated against them directly, covering the subset of the query DSL the
//! query compiler emits: `bool` (must, filter, should, must_not,
//! minimum_should_match), `match` with fuzziness, `term`, `terms`, `range` and
//! `match_all`, plus `from`, `size`, `sort` and `search_after`.

use super::index_gateway::{IndexError, IndexGateway, IndexResult, SearchHits, ensure_indexable};
use crate::models::search::SearchDocument;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::{cmp::Ordering, collections::BTreeMap};
use tokio::sync::RwLock;

const DEFAULT_SIZE: u64 = 10;

#[derive(Default)]
pub struct MemoryIndex {
    documents: RwLock<BTreeMap<String, Value>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    /// Fetch a stored document by id.
    pub async fn get(&self, id: &str) -> IndexResult<Option<SearchDocument>> {
        let documents = self.documents.read().await;
        documents.get(id).map(decode).transpose()
    }
}

#[async_trait]
impl IndexGateway for MemoryIndex {
    async fn upsert(&self, id: &str, document: &SearchDocument) -> IndexResult<()> {
        ensure_indexable(id, document)?;
        let body =
            serde_json::to_value(document).map_err(|err| IndexError::Malformed(err.to_string()))?;
        self.documents.write().await.insert(id.to_string(), body);
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> IndexResult<()> {
        self.documents.write().await.remove(id);
        Ok(())
    }

    async fn search(&self, query: &Value) -> IndexResult<SearchHits> {
        let from = query.get("from").and_then(Value::as_u64).unwrap_or(0) as usize;
        let size = query
            .get("size")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_SIZE) as usize;
        let sort = sort_keys(query.get("sort"))?;

        let documents = self.documents.read().await;
        let mut hits = Vec::new();
        for body in documents.values() {
            let matched = match query.get("query") {
                Some(clause) => matches(clause, body)?,
                None => true,
            };
            if matched {
                hits.push(body);
            }
        }

        hits.sort_by(|a, b| {
            for (field, descending) in &sort {
                let ordering = compare_field(lookup(a, field), lookup(b, field), *descending);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            compare_field(lookup(a, "id"), lookup(b, "id"), false)
        });

        let total = hits.len() as u64;
        if let Some(cursor) = query.get("search_after") {
            let cursor = cursor.as_array().ok_or_else(|| {
                IndexError::UnsupportedQuery("`search_after` needs an array".into())
            })?;
            hits.retain(|hit| sorts_after(hit, &sort, cursor));
        }
        let documents = hits
            .into_iter()
            .skip(from)
            .take(size)
            .map(decode)
            .collect::<IndexResult<Vec<_>>>()?;
        Ok(SearchHits { documents, total })
    }

    async fn ping(&self) -> IndexResult<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

fn decode(body: &Value) -> IndexResult<SearchDocument> {
    serde_json::from_value(body.clone()).map_err(|err| IndexError::Malformed(err.to_string()))
}

/// Resolve a dotted field path, ignoring a trailing `.keyword` sub-field.
fn lookup<'a>(doc: &'a Value, field: &str) -> Option<&'a Value> {
    let path = field.strip_suffix(".keyword").unwrap_or(field);
    path.split('.')
        .try_fold(doc, |node, segment| node.get(segment))
        .filter(|value| !value.is_null())
}

/// Scalar values held by a field. Arrays contribute each element.
fn leaves(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().filter(|v| !v.is_null()).collect(),
        Some(other) => vec![other],
        None => Vec::new(),
    }
}

fn single_entry<'a>(clause: &'a Value, kind: &str) -> IndexResult<(&'a String, &'a Value)> {
    clause
        .as_object()
        .and_then(|map| map.iter().next())
        .ok_or_else(|| IndexError::UnsupportedQuery(format!("`{}` needs one field", kind)))
}

fn matches(clause: &Value, doc: &Value) -> IndexResult<bool> {
    let (kind, body) = single_entry(clause, "clause")?;
    match kind.as_str() {
        "match_all" => Ok(true),
        "bool" => {
            let spec = body
                .as_object()
                .ok_or_else(|| IndexError::UnsupportedQuery("`bool` must be an object".into()))?;
            eval_bool(spec, doc)
        }
        "term" => {
            let (field, wanted) = single_entry(body, "term")?;
            let wanted = wanted.get("value").unwrap_or(wanted);
            Ok(leaves(lookup(doc, field))
                .into_iter()
                .any(|value| scalar_eq(value, wanted)))
        }
        "terms" => {
            let (field, wanted) = single_entry(body, "terms")?;
            let wanted = wanted
                .as_array()
                .ok_or_else(|| IndexError::UnsupportedQuery("`terms` needs an array".into()))?;
            Ok(leaves(lookup(doc, field))
                .into_iter()
                .any(|value| wanted.iter().any(|w| scalar_eq(value, w))))
        }
        "range" => {
            let (field, bounds) = single_entry(body, "range")?;
            eval_range(field, bounds, doc)
        }
        "match" => {
            let (field, spec) = single_entry(body, "match")?;
            eval_match(field, spec, doc)
        }
        other => Err(IndexError::UnsupportedQuery(format!(
            "clause `{}` is not supported",
            other
        ))),
    }
}

fn eval_bool(spec: &Map<String, Value>, doc: &Value) -> IndexResult<bool> {
    let clauses = |key: &str| -> Vec<&Value> {
        match spec.get(key) {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(single) => vec![single],
            None => Vec::new(),
        }
    };

    let must = clauses("must");
    let filter = clauses("filter");
    for clause in must.iter().chain(filter.iter()) {
        if !matches(clause, doc)? {
            return Ok(false);
        }
    }
    for clause in clauses("must_not") {
        if matches(clause, doc)? {
            return Ok(false);
        }
    }

    let should = clauses("should");
    let default_minimum = if !should.is_empty() && must.is_empty() && filter.is_empty() {
        1
    } else {
        0
    };
    let minimum = match spec.get("minimum_should_match") {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(default_minimum),
        Some(Value::String(s)) => s.parse().unwrap_or(default_minimum),
        _ => default_minimum,
    };

    let mut satisfied = 0;
    for clause in should {
        if matches(clause, doc)? {
            satisfied += 1;
        }
    }
    Ok(satisfied >= minimum)
}

fn eval_range(field: &str, bounds: &Value, doc: &Value) -> IndexResult<bool> {
    let bounds = bounds
        .as_object()
        .ok_or_else(|| IndexError::UnsupportedQuery("`range` needs bounds".into()))?;
    let mut checks: Vec<(&str, f64)> = Vec::new();
    for (op, bound) in bounds {
        let bound = bound.as_f64().ok_or_else(|| {
            IndexError::UnsupportedQuery(format!("range bound `{}` must be numeric", op))
        })?;
        checks.push((op.as_str(), bound));
    }

    Ok(leaves(lookup(doc, field)).into_iter().any(|value| {
        let Some(value) = as_number(value) else {
            return false;
        };
        checks.iter().all(|(op, bound)| match *op {
            "gte" => value >= *bound,
            "gt" => value > *bound,
            "lte" => value <= *bound,
            "lt" => value < *bound,
            _ => true,
        })
    }))
}

fn eval_match(field: &str, spec: &Value, doc: &Value) -> IndexResult<bool> {
    let (text, fuzziness) = match spec {
        Value::String(text) => (text.as_str(), None),
        Value::Object(map) => {
            let text = map.get("query").and_then(Value::as_str).ok_or_else(|| {
                IndexError::UnsupportedQuery("`match` needs a string query".into())
            })?;
            (text, map.get("fuzziness"))
        }
        _ => {
            return Err(IndexError::UnsupportedQuery(
                "`match` needs a string query".into(),
            ));
        }
    };

    let doc_tokens: Vec<String> = leaves(lookup(doc, field))
        .into_iter()
        .filter_map(Value::as_str)
        .flat_map(tokenize)
        .collect();

    Ok(tokenize(text).iter().any(|term| {
        let allowed = allowed_edits(term, fuzziness);
        doc_tokens
            .iter()
            .any(|token| edit_distance(term, token) <= allowed)
    }))
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Edits permitted for a term under the given fuzziness setting.
fn allowed_edits(term: &str, fuzziness: Option<&Value>) -> usize {
    match fuzziness {
        Some(Value::String(s)) if s.eq_ignore_ascii_case("auto") => {
            match term.chars().count() {
                0..=2 => 0,
                3..=5 => 1,
                _ => 2,
            }
        }
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0) as usize,
        _ => 0,
    }
}

/// Edit distance counting insertions, deletions, substitutions and adjacent
/// transpositions.
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut rows = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for (i, row) in rows.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=b.len() {
        rows[0][j] = j;
    }

    for i in 1..=a.len() {
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            let mut best = (rows[i - 1][j] + 1)
                .min(rows[i][j - 1] + 1)
                .min(rows[i - 1][j - 1] + cost);
            if i > 1 && j > 1 && a[i - 1] == b[j - 2] && a[i - 2] == b[j - 1] {
                best = best.min(rows[i - 2][j - 2] + 1);
            }
            rows[i][j] = best;
        }
    }
    rows[a.len()][b.len()]
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn scalar_eq(doc: &Value, wanted: &Value) -> bool {
    match (doc, wanted) {
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(_), _) | (_, Value::Number(_)) => match (as_number(doc), as_number(wanted)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        _ => false,
    }
}

fn sort_keys(sort: Option<&Value>) -> IndexResult<Vec<(String, bool)>> {
    let entries = match sort {
        None => return Ok(Vec::new()),
        Some(Value::Array(entries)) => entries.iter().collect::<Vec<_>>(),
        Some(single) => vec![single],
    };

    let mut keys = Vec::new();
    for entry in entries {
        match entry {
            Value::String(field) => keys.push((field.clone(), false)),
            Value::Object(map) => {
                for (field, spec) in map {
                    let order = spec.get("order").unwrap_or(spec);
                    let descending = order
                        .as_str()
                        .is_some_and(|o| o.eq_ignore_ascii_case("desc"));
                    keys.push((field.clone(), descending));
                }
            }
            _ => return Err(IndexError::UnsupportedQuery("malformed sort entry".into())),
        }
    }
    Ok(keys)
}

/// Whether `hit` sorts strictly after the `search_after` cursor.
fn sorts_after(hit: &Value, sort: &[(String, bool)], cursor: &[Value]) -> bool {
    for (i, (field, descending)) in sort.iter().enumerate() {
        match compare_field(lookup(hit, field), cursor.get(i), *descending) {
            Ordering::Equal => continue,
            ordering => return ordering == Ordering::Greater,
        }
    }
    false
}

/// Order two field values. Missing values always sort last.
fn compare_field(a: Option<&Value>, b: Option<&Value>, descending: bool) -> Ordering {
    fn first(v: Option<&Value>) -> Option<&Value> {
        match v {
            Some(Value::Array(items)) => items.first().filter(|v| !v.is_null()),
            other => other,
        }
    }
    match (first(a), first(b)) {
        (None, None) => Ordering::Equal,
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (Some(a), Some(b)) => {
            let ordering = match (a, b) {
                (Value::String(x), Value::String(y)) => x.cmp(y),
                _ => match (as_number(a), as_number(b)) {
                    (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                    _ => Ordering::Equal,
                },
            };
            if descending {
                ordering.reverse()
            } else {
                ordering
            }
        }
    }
}
