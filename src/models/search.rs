//! Index-side projection of a product and the structured search request.

use super::product::Product;
use super::validation::{json_object, non_negative_decimal, not_blank, uuid_text};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;
use validator::Validate;

/// Denormalized product document stored in the search index, keyed by the
/// product id string. Carries the same structural rules the relational write
/// path enforces.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Validate)]
pub struct SearchDocument {
    #[validate(custom(function = "uuid_text"))]
    pub id: String,
    #[validate(custom(function = "not_blank"), length(max = 255, code = "max_length"))]
    pub name: String,
    #[validate(length(max = 2000, code = "max_length"))]
    pub description: String,
    pub category: Value,
    #[validate(custom(function = "not_blank"), length(max = 100, code = "max_length"))]
    pub brand: String,
    pub color: Value,
    #[validate(custom(function = "json_object"))]
    pub specs: Value,
    #[serde(with = "rust_decimal::serde::float")]
    #[validate(custom(function = "non_negative_decimal"))]
    pub price: Decimal,
    #[validate(range(min = 0, code = "non_negative"))]
    pub quantity: i64,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Product> for SearchDocument {
    fn from(product: &Product) -> Self {
        Self {
            id: product.id.to_string(),
            name: product.name.clone(),
            description: product.description.clone(),
            category: product.category.clone(),
            brand: product.brand.clone(),
            color: product.color.clone(),
            specs: product.specs.clone(),
            price: product.price,
            quantity: product.quantity,
            created_by: product.created_by,
            created_at: product.created_at,
            updated_at: product.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub field: String,
    pub order: SortOrder,
}

impl Default for SortSpec {
    fn default() -> Self {
        Self {
            field: "price".into(),
            order: SortOrder::Asc,
        }
    }
}

/// Structured filter request consumed by the query compiler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchRequest {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub name_text: Option<String>,
    pub categories: Vec<String>,
    pub brands: Vec<String>,
    pub colors: Vec<String>,
    pub price_exact: Option<f64>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub specs: BTreeMap<String, Value>,
    pub sort: Option<SortSpec>,
}

/// One page of index-resident results.
#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub items: Vec<SearchDocument>,
    pub total: u64,
    pub page: i64,
    pub size: i64,
}
