//! src/services/query_compiler.rs
//!
//! Pure translation of a structured `SearchRequest` into an index query
//! document. Nothing here performs I/O. Output objects are `serde_json::Map`s,
//! which keep keys sorted, so the same request always serializes to the same
//! bytes.

use crate::models::{
    page::PageRequest,
    search::{SearchRequest, SortOrder, SortSpec},
};
use serde_json::{Map, Value, json};

const DEFAULT_SORT_FIELD: &str = "price";

/// Compile a search request into a query document.
pub fn compile(request: &SearchRequest) -> Value {
    let page = PageRequest::new(request.page, request.limit);

    let mut filter = Vec::new();
    if !request.categories.is_empty() {
        filter.push(json!({"terms": {"category.keyword": request.categories}}));
    }
    match request.brands.as_slice() {
        [] => {}
        [brand] => filter.push(json!({"term": {"brand.keyword": brand}})),
        brands => filter.push(json!({"terms": {"brand.keyword": brands}})),
    }
    if !request.colors.is_empty() {
        filter.push(json!({"terms": {"color.keyword": request.colors}}));
    }
    if let Some(price) = request.price_exact {
        filter.push(json!({"term": {"price": price}}));
    }
    if request.min_price.is_some() || request.max_price.is_some() {
        let mut bounds = Map::new();
        if let Some(min) = request.min_price {
            bounds.insert("gte".into(), json!(min));
        }
        if let Some(max) = request.max_price {
            bounds.insert("lte".into(), json!(max));
        }
        filter.push(json!({"range": {"price": bounds}}));
    }
    for (key, value) in &request.specs {
        let key = sanitize_field(key);
        if key.is_empty() {
            continue;
        }
        let mut term = Map::new();
        term.insert(format!("specs.{}.keyword", key), value.clone());
        filter.push(json!({"term": term}));
    }

    let mut clauses = Map::new();
    if !filter.is_empty() {
        clauses.insert("filter".into(), Value::Array(filter));
    }
    if let Some(name) = &request.name_text {
        clauses.insert(
            "should".into(),
            json!([{"match": {"name": {"query": name, "fuzziness": "AUTO"}}}]),
        );
        clauses.insert("minimum_should_match".into(), json!(1));
    }
    let query = if clauses.is_empty() {
        json!({"match_all": {}})
    } else {
        json!({"bool": clauses})
    };

    let sort = request.sort.clone().unwrap_or_default();
    let mut field = sanitize_field(&sort.field);
    if field.is_empty() {
        field = DEFAULT_SORT_FIELD.to_string();
    }
    let mut sort_clause = Map::new();
    sort_clause.insert(field, json!({"order": sort.order.as_str()}));

    json!({
        "from": page.offset(),
        "size": page.limit,
        "query": query,
        "sort": [sort_clause],
    })
}

/// Query used by the reconciler to walk every index document in id order.
///
/// Pages resume after the id of the previous page's last hit, so the walk is
/// not bounded by the index result window and ignores pending deletes.
pub fn id_scan(after: Option<&str>, size: u64) -> Value {
    let mut scan = json!({
        "size": size,
        "query": {"match_all": {}},
        "sort": [{"id.keyword": {"order": "asc"}}],
    });
    if let Some(after) = after {
        scan["search_after"] = json!([after]);
    }
    scan
}

/// Build a search request from raw query-string pairs.
///
/// Numbers are parsed leniently: the longest numeric prefix is used and a
/// value without one counts as zero. List filters accept comma-separated or
/// repeated parameters. Unknown keys are ignored.
pub fn parse_params(params: &[(String, String)]) -> SearchRequest {
    let mut request = SearchRequest::default();
    for (key, raw) in params {
        match key.as_str() {
            "page" => request.page = Some(lenient_int(raw)),
            "limit" => request.limit = Some(lenient_int(raw)),
            "name" => {
                let name = raw.trim();
                if !name.is_empty() {
                    request.name_text = Some(name.to_string());
                }
            }
            "category" => request.categories.extend(split_list(raw)),
            "brand" => {
                let brand = raw.trim();
                if !brand.is_empty() {
                    request.brands.push(brand.to_string());
                }
            }
            "color" => request.colors.extend(split_list(raw)),
            "price" => request.price_exact = Some(lenient_float(raw)),
            "min_price" => request.min_price = Some(lenient_float(raw)),
            "max_price" => request.max_price = Some(lenient_float(raw)),
            "specs" => {
                if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) {
                    request.specs.extend(map);
                }
            }
            "sort" => {
                if let Some(sort) = parse_sort(raw) {
                    request.sort = Some(sort);
                }
            }
            _ => {}
        }
    }
    request
}

/// `field:direction`, exactly two parts. Unknown directions fall back to ascending.
fn parse_sort(raw: &str) -> Option<SortSpec> {
    let parts: Vec<&str> = raw.split(':').collect();
    let [field, direction] = parts.as_slice() else {
        return None;
    };
    let field = sanitize_field(field);
    if field.is_empty() {
        return None;
    }
    let order = if direction.trim().eq_ignore_ascii_case("desc") {
        SortOrder::Desc
    } else {
        SortOrder::Asc
    };
    Some(SortSpec { field, order })
}

/// Keep only `[A-Za-z0-9_-]`.
pub fn sanitize_field(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(*c, '_' | '-'))
        .collect()
}

fn split_list(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Integer value of the longest leading `[+-]digits` run, or 0.
fn lenient_int(raw: &str) -> i64 {
    let trimmed = raw.trim();
    let digits_start = usize::from(trimmed.starts_with(['+', '-']));
    let digits_len = trimmed[digits_start..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits_len == 0 {
        return 0;
    }
    trimmed[..digits_start + digits_len].parse().unwrap_or(0)
}

/// Float value of the longest leading prefix that parses, or 0.
fn lenient_float(raw: &str) -> f64 {
    let trimmed = raw.trim();
    let candidate_len = trimmed
        .bytes()
        .take_while(|b| b.is_ascii_digit() || matches!(*b, b'+' | b'-' | b'.' | b'e' | b'E'))
        .count();
    (1..=candidate_len)
        .rev()
        .find_map(|len| trimmed[..len].parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
}
