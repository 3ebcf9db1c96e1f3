pub mod admin_handlers;
pub mod auth;
pub mod health_handlers;
pub mod image_handlers;
pub mod object_handlers;
pub mod product_handlers;
pub mod rpc_handlers;

use crate::errors::AppError;
use axum::{Json, extract::rejection::JsonRejection};

/// Unwrap a JSON body, turning a malformed payload into a 400.
pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| AppError::bad_request(rejection.body_text()))
}
