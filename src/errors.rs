use crate::{
    models::{product::Product, validation::Violations},
    services::{index_gateway::IndexError, object_store::ObjectStorageError},
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::{Value, json};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;
use validator::ValidationErrors;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outward classification of every failure the service can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Constraint,
    IndexDesync,
    InsufficientQuantity,
    AccessDenied,
    Transport,
    Cancelled,
    Storage,
}

impl ErrorKind {
    pub fn http_status(self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Constraint => StatusCode::CONFLICT,
            ErrorKind::IndexDesync => StatusCode::ACCEPTED,
            ErrorKind::InsufficientQuantity => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::AccessDenied => StatusCode::FORBIDDEN,
            ErrorKind::Transport => StatusCode::BAD_GATEWAY,
            ErrorKind::Cancelled => StatusCode::REQUEST_TIMEOUT,
            ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn rpc_code(self) -> RpcCode {
        match self {
            ErrorKind::Validation => RpcCode::InvalidArgument,
            ErrorKind::NotFound => RpcCode::NotFound,
            ErrorKind::Constraint => RpcCode::AlreadyExists,
            ErrorKind::IndexDesync => RpcCode::Unavailable,
            ErrorKind::InsufficientQuantity => RpcCode::FailedPrecondition,
            ErrorKind::AccessDenied => RpcCode::PermissionDenied,
            ErrorKind::Transport => RpcCode::Unavailable,
            ErrorKind::Cancelled => RpcCode::Cancelled,
            ErrorKind::Storage => RpcCode::Internal,
        }
    }
}

/// Status codes of the internal RPC surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcCode {
    Ok,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    PermissionDenied,
    Unavailable,
    Cancelled,
    Internal,
}

impl RpcCode {
    fn http_status(self) -> StatusCode {
        match self {
            RpcCode::Ok => StatusCode::OK,
            RpcCode::InvalidArgument => StatusCode::BAD_REQUEST,
            RpcCode::NotFound => StatusCode::NOT_FOUND,
            RpcCode::AlreadyExists => StatusCode::CONFLICT,
            RpcCode::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
            RpcCode::PermissionDenied => StatusCode::FORBIDDEN,
            RpcCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            RpcCode::Cancelled => StatusCode::REQUEST_TIMEOUT,
            RpcCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Which relational write committed ahead of a failed index write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => f.write_str("created"),
            Operation::Update => f.write_str("updated"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("validation failed: {0}")]
    Validation(Violations),
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{context}: {source}")]
    Constraint {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },
    /// The record store committed but the index write failed. Carries the
    /// committed product so a repair job can re-upsert it.
    #[error("product `{}` {operation} but the search index was not updated: {source}", .product.id)]
    IndexDesync {
        operation: Operation,
        product: Box<Product>,
        #[source]
        source: IndexError,
    },
    #[error("insufficient quantity for product `{product_id}` (requested {requested})")]
    InsufficientQuantity { product_id: Uuid, requested: i64 },
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("{context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("operation cancelled before commit")]
    Cancelled,
    #[error("{context}: {source}")]
    Storage {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

pub type CatalogResult<T> = Result<T, CatalogError>;

impl CatalogError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CatalogError::Validation(_) => ErrorKind::Validation,
            CatalogError::NotFound { .. } => ErrorKind::NotFound,
            CatalogError::Constraint { .. } => ErrorKind::Constraint,
            CatalogError::IndexDesync { .. } => ErrorKind::IndexDesync,
            CatalogError::InsufficientQuantity { .. } => ErrorKind::InsufficientQuantity,
            CatalogError::AccessDenied(_) => ErrorKind::AccessDenied,
            CatalogError::Transport { .. } => ErrorKind::Transport,
            CatalogError::Cancelled => ErrorKind::Cancelled,
            CatalogError::Storage { .. } => ErrorKind::Storage,
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CatalogError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Wrap a relational failure, classifying constraint violations apart
    /// from everything else.
    pub fn storage(context: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| {
            if is_constraint_violation(&source) {
                CatalogError::Constraint { context, source }
            } else {
                CatalogError::Storage { context, source }
            }
        }
    }

    /// Wrap a collaborator failure (index, object storage).
    pub fn transport<E>(context: &'static str) -> impl FnOnce(E) -> Self
    where
        E: Into<BoxError>,
    {
        move |source| CatalogError::Transport {
            context,
            source: source.into(),
        }
    }
}

impl CatalogError {
    /// Wrap an object storage failure. Missing objects become NotFound and
    /// rejected presigned URLs become AccessDenied.
    pub fn object(context: &'static str) -> impl FnOnce(ObjectStorageError) -> Self {
        move |err| match err {
            ObjectStorageError::NotFound { key, .. } => CatalogError::NotFound {
                entity: "object",
                id: key,
            },
            ObjectStorageError::Expired | ObjectStorageError::BadSignature => {
                CatalogError::AccessDenied(err.to_string())
            }
            other => CatalogError::Transport {
                context,
                source: Box::new(other),
            },
        }
    }
}

impl From<Violations> for CatalogError {
    fn from(violations: Violations) -> Self {
        CatalogError::Validation(violations)
    }
}

impl From<ValidationErrors> for CatalogError {
    fn from(errors: ValidationErrors) -> Self {
        CatalogError::Validation(errors.into())
    }
}

/// Return true if SQLx reports a uniqueness, foreign-key, not-null or check violation.
fn is_constraint_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => !matches!(db_err.kind(), sqlx::error::ErrorKind::Other),
        _ => false,
    }
}

/// HTTP-facing error. Status is always derived from the fixed kind table.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub kind: Option<ErrorKind>,
    pub details: Option<Value>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            kind: None,
            details: None,
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.message,
            "status": self.status.as_u16()
        });
        if let Some(kind) = self.kind {
            body["kind"] = json!(kind);
        }
        if let Some(details) = self.details {
            body["details"] = details;
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<CatalogError> for AppError {
    fn from(err: CatalogError) -> Self {
        let kind = err.kind();
        let status = kind.http_status();
        if status.is_server_error() {
            tracing::error!(error = %err, ?kind, "request failed");
        } else {
            tracing::debug!(error = %err, ?kind, "request rejected");
        }

        let details = match &err {
            CatalogError::Validation(violations) => Some(json!({ "violations": violations })),
            CatalogError::IndexDesync {
                operation, product, ..
            } => Some(json!({
                "operation": operation,
                "indexed": false,
                "product": product,
            })),
            _ => None,
        };

        AppError {
            status,
            message: err.to_string(),
            kind: Some(kind),
            details,
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

/// Error returned by the internal RPC surface.
#[derive(Debug)]
pub struct RpcError {
    pub code: RpcCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: RpcCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: msg.into(),
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "code": self.code,
            "message": self.message,
        }));
        (self.code.http_status(), body).into_response()
    }
}

impl From<CatalogError> for RpcError {
    fn from(err: CatalogError) -> Self {
        let code = err.kind().rpc_code();
        if code == RpcCode::Internal {
            tracing::error!(error = %err, "rpc call failed");
        }
        RpcError::new(code, err.to_string())
    }
}
