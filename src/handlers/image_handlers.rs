//! HTTP handlers for product images: attach, upload, presign, stream, delete.

use super::{auth::Caller, json_body, object_handlers::stream_object};
use crate::{
    errors::{AppError, CatalogError},
    models::{
        image::{AttachImagesRequest, PresignedImage, UploadedImage},
        product::ProductImage,
        response::ApiResponse,
        validation::parse_uuid,
    },
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::{debug, instrument};

/// `POST /api/products/{id}/images` (admin). Attaches already-uploaded objects.
#[instrument(skip(state, caller, payload))]
pub async fn attach_images(
    State(state): State<AppState>,
    caller: Caller,
    Path(product_id): Path<String>,
    payload: Result<Json<AttachImagesRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    caller.require_role(&state.admin_role)?;
    let product_id = parse_uuid("id", &product_id).map_err(CatalogError::from)?;
    let request = json_body(payload)?;
    let images = state
        .images
        .attach_images(&state.context(), product_id, &request.images)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::new("images attached", images)),
    ))
}

/// `POST /api/products/{id}/images/upload` (admin, multipart).
///
/// Every part that carries a file name is stored in the product bucket and
/// attached in the order received; other parts are ignored.
#[instrument(skip(state, caller, multipart))]
pub async fn upload_images(
    State(state): State<AppState>,
    caller: Caller,
    Path(product_id): Path<String>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    caller.require_role(&state.admin_role)?;
    let product_id = parse_uuid("id", &product_id).map_err(CatalogError::from)?;

    let mut uploads = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(err.body_text()))?
    {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            debug!(field = ?field.name(), "skipping multipart field without a file");
            continue;
        };
        let body = field
            .bytes()
            .await
            .map_err(|err| AppError::bad_request(err.body_text()))?;
        uploads.push(UploadedImage { file_name, body });
    }

    let images = state
        .images
        .upload_images(&state.context(), product_id, uploads)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::new("images uploaded", images)),
    ))
}

/// `GET /api/images/{id}/url`
#[instrument(skip(state))]
pub async fn image_url(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<PresignedImage>>, AppError> {
    let id = parse_uuid("id", &id).map_err(CatalogError::from)?;
    let presigned = state.images.presigned_url(&state.context(), id).await?;
    Ok(Json(ApiResponse::new("image url generated", presigned)))
}

/// `GET /api/images/{id}` streams the stored bytes inline.
#[instrument(skip(state))]
pub async fn stream_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = parse_uuid("id", &id).map_err(CatalogError::from)?;
    let (image, reader) = state.images.open_image(&state.context(), id).await?;
    let file_name = image
        .image_object
        .rsplit('/')
        .next()
        .unwrap_or(&image.image_object)
        .replace('"', "");
    Ok(stream_object(
        reader,
        Some(format!("inline; filename=\"{}\"", file_name)),
    ))
}

/// `DELETE /api/images/{id}` (admin)
#[instrument(skip(state, caller))]
pub async fn delete_image(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<ProductImage>>, AppError> {
    caller.require_role(&state.admin_role)?;
    let id = parse_uuid("id", &id).map_err(CatalogError::from)?;
    let image = state.images.delete_image(&state.context(), id).await?;
    Ok(Json(ApiResponse::new("image deleted", image)))
}
