//! Internal service-to-service RPC surface, JSON over HTTP under
//! `/rpc/product.ProductService/<Method>`.
//!
//! Product messages carry the JSON blobs as strings and the price as a float.
//! Every failure maps to an `RpcCode` through the fixed kind table.

use crate::{
    errors::{CatalogError, RpcCode, RpcError},
    models::{product::Product, validation::parse_uuid},
    services::product_service::QuantityChange,
    state::AppState,
};
use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
pub struct GetProductByIdRequest {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct GetProductByIdsRequest {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecreaseQuantityRequest {
    #[serde(default)]
    pub product_id: String,
    #[serde(default)]
    pub quantity: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct DecreaseQuantityByIdsRequest {
    #[serde(default)]
    pub items: Vec<DecreaseQuantityRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductMessage {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub brand: String,
    pub color: String,
    pub specs: String,
    pub price: f64,
    pub quantity: i64,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Product> for ProductMessage {
    fn from(product: Product) -> Self {
        Self {
            id: product.id.to_string(),
            name: product.name,
            description: product.description,
            category: blob(&product.category),
            brand: product.brand,
            color: blob(&product.color),
            specs: blob(&product.specs),
            price: product.price.to_f64().unwrap_or_default(),
            quantity: product.quantity,
            created_by: product.created_by.to_string(),
            created_at: product.created_at.to_rfc3339(),
            updated_at: product.updated_at.to_rfc3339(),
        }
    }
}

/// Serialized JSON, or an empty string for an absent blob.
fn blob(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Serialize)]
pub struct GetProductByIdsResponse {
    pub products: Vec<ProductMessage>,
}

#[derive(Debug, Serialize)]
pub struct DecreaseQuantityResponse {
    pub success: bool,
    pub message: String,
    pub new_quantity: i64,
}

#[derive(Debug, Serialize)]
pub struct DecreaseQuantityResult {
    pub product_id: String,
    pub success: bool,
    pub new_quantity: i64,
    pub message: String,
    pub code: RpcCode,
}

#[derive(Debug, Serialize)]
pub struct DecreaseQuantityByIdsResponse {
    pub success: bool,
    pub message: String,
    pub results: Vec<DecreaseQuantityResult>,
}

fn rpc_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, RpcError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| RpcError::new(RpcCode::InvalidArgument, rejection.body_text()))
}

fn rpc_id(field: &'static str, raw: &str) -> Result<Uuid, RpcError> {
    parse_uuid(field, raw).map_err(|v| CatalogError::from(v).into())
}

#[instrument(skip(state, payload))]
pub async fn get_product_by_id(
    State(state): State<AppState>,
    payload: Result<Json<GetProductByIdRequest>, JsonRejection>,
) -> Result<Json<ProductMessage>, RpcError> {
    let request = rpc_body(payload)?;
    let id = rpc_id("id", &request.id)?;
    let product = state.products.get(&state.context(), id).await?;
    Ok(Json(product.into()))
}

/// Unknown ids are omitted from the response; a malformed id fails the call.
#[instrument(skip(state, payload))]
pub async fn get_product_by_ids(
    State(state): State<AppState>,
    payload: Result<Json<GetProductByIdsRequest>, JsonRejection>,
) -> Result<Json<GetProductByIdsResponse>, RpcError> {
    let request = rpc_body(payload)?;
    let ids = request
        .ids
        .iter()
        .map(|raw| rpc_id("ids", raw))
        .collect::<Result<Vec<_>, _>>()?;
    let products = state.products.get_many(&state.context(), &ids).await?;
    Ok(Json(GetProductByIdsResponse {
        products: products.into_iter().map(ProductMessage::from).collect(),
    }))
}

#[instrument(skip(state, payload))]
pub async fn decrease_quantity(
    State(state): State<AppState>,
    payload: Result<Json<DecreaseQuantityRequest>, JsonRejection>,
) -> Result<Json<DecreaseQuantityResponse>, RpcError> {
    let request = rpc_body(payload)?;
    let id = rpc_id("product_id", &request.product_id)?;
    let new_quantity = state
        .products
        .decrease_quantity(&state.context(), id, request.quantity)
        .await?;
    Ok(Json(DecreaseQuantityResponse {
        success: true,
        message: "product quantity decreased".into(),
        new_quantity,
    }))
}

/// Each item succeeds or fails on its own; earlier successes stay applied.
#[instrument(skip(state, payload))]
pub async fn decrease_quantity_by_ids(
    State(state): State<AppState>,
    payload: Result<Json<DecreaseQuantityByIdsRequest>, JsonRejection>,
) -> Result<Json<DecreaseQuantityByIdsResponse>, RpcError> {
    let request = rpc_body(payload)?;
    let changes = request
        .items
        .into_iter()
        .map(|item| QuantityChange {
            product_id: item.product_id,
            quantity: item.quantity,
        })
        .collect();
    let batch = state
        .products
        .decrease_quantity_batch(&state.context(), changes)
        .await?;

    let results = batch
        .outcomes
        .into_iter()
        .map(|outcome| match outcome.result {
            Ok(new_quantity) => DecreaseQuantityResult {
                product_id: outcome.product_id,
                success: true,
                new_quantity,
                message: "quantity decreased".into(),
                code: RpcCode::Ok,
            },
            Err(err) => DecreaseQuantityResult {
                product_id: outcome.product_id,
                success: false,
                new_quantity: 0,
                message: err.to_string(),
                code: err.kind().rpc_code(),
            },
        })
        .collect();

    let message = if batch.all_success {
        "all quantities decreased"
    } else {
        "some quantities failed to decrease"
    };
    Ok(Json(DecreaseQuantityByIdsResponse {
        success: batch.all_success,
        message: message.into(),
        results,
    }))
}
