//! Relational-side product entities and the request shapes that mutate them.

use super::validation::{json_object, non_negative_decimal, not_blank};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use validator::Validate;

/// A catalog product as held by the record store.
///
/// `images` is always populated when the product is read back through the
/// record store; it is empty right after creation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    /// Opaque structured category blob.
    pub category: Value,
    pub brand: String,
    pub color: Value,
    pub specs: Value,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub quantity: i64,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub images: Vec<ProductImage>,
}

impl Product {
    /// Build a brand-new product from a validated create request.
    pub fn from_request(request: CreateProductRequest, created_by: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: request.name,
            description: request.description.unwrap_or_default(),
            category: request.category.unwrap_or(Value::Null),
            brand: request.brand,
            color: request.color.unwrap_or(Value::Null),
            specs: request.specs.unwrap_or(Value::Null),
            price: request.price.unwrap_or_default(),
            quantity: request.quantity.unwrap_or(0),
            created_by,
            created_at: now,
            updated_at: now,
            images: Vec::new(),
        }
    }
}

/// An image row referencing an object stored outside the relational store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct ProductImage {
    pub id: Uuid,
    pub product_id: Uuid,
    /// Object key inside the product bucket.
    pub image_object: String,
    pub position: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Body of `POST /api/products`.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct CreateProductRequest {
    #[serde(default)]
    #[validate(custom(function = "not_blank"), length(max = 255, code = "max_length"))]
    pub name: String,
    #[validate(length(max = 2000, code = "max_length"))]
    pub description: Option<String>,
    pub category: Option<Value>,
    #[serde(default)]
    #[validate(custom(function = "not_blank"), length(max = 100, code = "max_length"))]
    pub brand: String,
    pub color: Option<Value>,
    #[validate(custom(function = "json_object"))]
    pub specs: Option<Value>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    #[validate(required, custom(function = "non_negative_decimal"))]
    pub price: Option<Decimal>,
    #[validate(range(min = 0, code = "non_negative"))]
    pub quantity: Option<i64>,
}

/// Body of `PUT /api/products/{id}`. Every field is optional; omitted fields
/// keep their stored value and only present fields are validated.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateProductRequest {
    #[validate(custom(function = "not_blank"), length(max = 255, code = "max_length"))]
    pub name: Option<String>,
    #[validate(length(max = 2000, code = "max_length"))]
    pub description: Option<String>,
    pub category: Option<Value>,
    #[validate(custom(function = "not_blank"), length(max = 100, code = "max_length"))]
    pub brand: Option<String>,
    pub color: Option<Value>,
    #[validate(custom(function = "json_object"))]
    pub specs: Option<Value>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    #[validate(custom(function = "non_negative_decimal"))]
    pub price: Option<Decimal>,
    #[validate(range(min = 0, code = "non_negative"))]
    pub quantity: Option<i64>,
}

/// Overwrite each listed field of `$target` whose counterpart in `$patch` is `Some`.
macro_rules! overwrite_present {
    ($target:expr, $patch:expr; $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $patch.$field {
                $target.$field = value;
            }
        )+
    };
}

impl UpdateProductRequest {
    /// Apply the present fields to `product` and bump `updated_at`.
    pub fn apply_to(self, product: &mut Product) {
        overwrite_present!(
            product, self;
            name, description, category, brand, color, specs, price, quantity,
        );
        product.updated_at = Utc::now();
    }
}
