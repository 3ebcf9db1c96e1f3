//! HTTP handlers for product reads, search and admin-gated writes.

use super::{auth::Caller, json_body};
use crate::{
    errors::{AppError, CatalogError},
    models::{
        page::{PageMetadata, PageRequest},
        product::{CreateProductRequest, Product, UpdateProductRequest},
        response::ApiResponse,
        search::SearchDocument,
        validation::parse_uuid,
    },
    services::query_compiler,
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::instrument;

/// Query params of `GET /api/products`.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub page: Option<String>,
    pub limit: Option<String>,
}

/// `GET /api/products`
#[instrument(skip(state))]
pub async fn list_products(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<Vec<Product>>>, AppError> {
    let page = PageRequest::parse(query.page.as_deref(), query.limit.as_deref());
    let (items, pagination) = state.products.list(&state.context(), page).await?;
    Ok(Json(ApiResponse::paged(
        "products retrieved",
        items,
        pagination,
    )))
}

/// `GET /api/products/search`
///
/// Params are kept as raw pairs so repeated keys and lenient numbers reach
/// the query compiler untouched.
#[instrument(skip(state))]
pub async fn search_products(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<ApiResponse<Vec<SearchDocument>>>, AppError> {
    let request = query_compiler::parse_params(&params);
    let page = state.products.search(&state.context(), &request).await?;
    let pagination = PageMetadata::new(
        PageRequest::new(Some(page.page), Some(page.size)),
        i64::try_from(page.total).unwrap_or(i64::MAX),
    );
    Ok(Json(ApiResponse::paged(
        "products found",
        page.items,
        pagination,
    )))
}

/// `GET /api/products/{id}`
#[instrument(skip(state))]
pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Product>>, AppError> {
    let id = parse_uuid("id", &id).map_err(CatalogError::from)?;
    let product = state.products.get(&state.context(), id).await?;
    Ok(Json(ApiResponse::new("product retrieved", product)))
}

/// `POST /api/products` (admin)
#[instrument(skip(state, caller, payload))]
pub async fn create_product(
    State(state): State<AppState>,
    caller: Caller,
    payload: Result<Json<CreateProductRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let created_by = caller.require_role(&state.admin_role)?;
    let request = json_body(payload)?;
    let product = state
        .products
        .create(&state.context(), created_by, request)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::new("product created", product)),
    ))
}

/// `PUT /api/products/{id}` (admin)
#[instrument(skip(state, caller, payload))]
pub async fn update_product(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    payload: Result<Json<UpdateProductRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<Product>>, AppError> {
    caller.require_role(&state.admin_role)?;
    let id = parse_uuid("id", &id).map_err(CatalogError::from)?;
    let request = json_body(payload)?;
    let product = state.products.update(&state.context(), id, request).await?;
    Ok(Json(ApiResponse::new("product updated", product)))
}

/// `DELETE /api/products/{id}` (admin). Cascades to the product's images.
#[instrument(skip(state, caller))]
pub async fn delete_product(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Product>>, AppError> {
    caller.require_role(&state.admin_role)?;
    let id = parse_uuid("id", &id).map_err(CatalogError::from)?;
    let product = state.products.delete(&state.context(), id).await?;
    Ok(Json(ApiResponse::new("product deleted", product)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::ErrorKind,
        services::testing::{Harness, harness, sample_request},
    };
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn admin(h: &Harness) -> Caller {
        Caller {
            id: Some(h.admin),
            roles: vec!["admin".into()],
        }
    }

    fn pairs(raw: &[(&str, &str)]) -> Query<Vec<(String, String)>> {
        Query(
            raw.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn writes_require_the_admin_role() {
        let h = harness().await;
        let state = AppState::for_harness(&h);
        let user = Caller {
            id: Some(Uuid::new_v4()),
            roles: vec!["user".into()],
        };

        let err = create_product(
            State(state.clone()),
            user,
            Ok(Json(sample_request("Desk", 1))),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.kind, Some(ErrorKind::AccessDenied));
        assert_eq!(err.status, StatusCode::FORBIDDEN);

        let err = delete_product(State(state), Caller::default(), Path(Uuid::new_v4().to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);

        let (items, _) = h.products.list(&h.ctx(), PageRequest::default()).await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn create_then_fetch_and_list() {
        let h = harness().await;
        let state = AppState::for_harness(&h);

        let response = create_product(
            State(state.clone()),
            admin(&h),
            Ok(Json(sample_request("Desk", 4))),
        )
        .await
        .unwrap()
        .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);

        let Json(listed) = list_products(
            State(state.clone()),
            Query(ListQuery {
                page: Some("1".into()),
                limit: Some("abc".into()),
            }),
        )
        .await
        .unwrap();
        let pagination = listed.pagination.unwrap();
        assert_eq!(pagination.page_size, 10);
        assert_eq!(pagination.total_item, 1);
        let created = &listed.data[0];
        assert_eq!(created.created_by, h.admin);

        let Json(fetched) = get_product(State(state), Path(created.id.to_string()))
            .await
            .unwrap();
        assert_eq!(&fetched.data, created);
    }

    #[tokio::test]
    async fn malformed_ids_are_validation_errors() {
        let h = harness().await;
        let state = AppState::for_harness(&h);
        let err = get_product(State(state), Path("not-a-uuid".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.details.unwrap()["violations"][0]["rule"], "uuid");
    }

    #[tokio::test]
    async fn missing_product_is_not_found() {
        let h = harness().await;
        let state = AppState::for_harness(&h);
        let err = update_product(
            State(state),
            admin(&h),
            Path(Uuid::new_v4().to_string()),
            Ok(Json(UpdateProductRequest::default())),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn failed_index_write_answers_accepted_with_the_product() {
        let h = harness().await;
        let state = AppState::for_harness(&h);
        h.index.fail_next_upserts(1);

        let err = create_product(
            State(state),
            admin(&h),
            Ok(Json(sample_request("Lamp", 2))),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.status, StatusCode::ACCEPTED);
        let details = err.details.unwrap();
        assert_eq!(details["indexed"], false);
        assert_eq!(details["product"]["name"], "Lamp");
    }

    #[tokio::test]
    async fn search_reports_index_pagination() {
        let h = harness().await;
        let state = AppState::for_harness(&h);
        for name in ["Chair", "Table", "Chair Pad"] {
            let mut request = sample_request(name, 1);
            request.price = Some(Decimal::new(500, 2));
            h.products.create(&h.ctx(), h.admin, request).await.unwrap();
        }

        let Json(found) = search_products(
            State(state),
            pairs(&[("name", "chair"), ("limit", "1"), ("sort", "name:asc")]),
        )
        .await
        .unwrap();
        let pagination = found.pagination.unwrap();
        assert_eq!(pagination.total_item, 2);
        assert_eq!(pagination.total_page, 2);
        assert!(pagination.has_next);
        assert_eq!(found.data.len(), 1);
    }

    #[tokio::test]
    async fn unavailable_index_fails_search_as_transport() {
        let h = harness().await;
        let state = AppState::for_harness(&h);
        h.index.fail_searches(true);
        let err = search_products(State(state), pairs(&[]))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
    }
}
