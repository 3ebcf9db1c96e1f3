//! Presigned object downloads.
//! Streams object bodies to avoid buffering in memory; the signature is
//! checked by the object storage backend before anything is opened.

use crate::{
    errors::{AppError, CatalogError},
    services::object_store::ObjectReader,
    state::AppState,
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use serde::Deserialize;
use tracing::instrument;

/// Query params carried by a presigned URL.
#[derive(Debug, Default, Deserialize)]
pub struct PresignedQuery {
    pub expires: Option<String>,
    pub signature: Option<String>,
}

/// `GET /objects/{bucket}/{*key}?expires=&signature=`
#[instrument(skip(state, query))]
pub async fn get_presigned_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<PresignedQuery>,
) -> Result<Response, AppError> {
    let denied = || CatalogError::AccessDenied("missing or malformed presigned url".into());
    let expires = query
        .expires
        .as_deref()
        .and_then(|raw| raw.parse::<i64>().ok())
        .ok_or_else(denied)?;
    let signature = query.signature.as_deref().ok_or_else(denied)?;

    state
        .objects
        .verify(&bucket, &key, expires, signature)
        .map_err(CatalogError::object("verifying presigned url"))?;
    let reader = state
        .objects
        .open(&bucket, &key)
        .await
        .map_err(CatalogError::object("opening object"))?;

    Ok(stream_object(reader, None))
}

/// Build a streaming response carrying the object's type, length and etag.
pub fn stream_object(reader: ObjectReader, disposition: Option<String>) -> Response {
    let ObjectReader { object, body } = reader;
    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    set_header(headers, header::CONTENT_TYPE, &object.content_type);
    set_header(headers, header::CONTENT_LENGTH, &object.size_bytes.to_string());
    if !object.etag.is_empty() {
        set_header(headers, header::ETAG, &format!("\"{}\"", object.etag));
    }
    if let Some(disposition) = disposition {
        set_header(headers, header::CONTENT_DISPOSITION, &disposition);
    }
    response
}

fn set_header(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
