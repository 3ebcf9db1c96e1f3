//! Operator endpoints.

use super::auth::Caller;
use crate::{
    errors::AppError, models::response::ApiResponse, services::reconciler::SweepReport,
    state::AppState,
};
use axum::{Json, extract::State};
use tracing::{info, instrument};

/// `POST /api/admin/reindex` (admin). Runs one full index sweep.
#[instrument(skip(state, caller))]
pub async fn reindex(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<ApiResponse<SweepReport>>, AppError> {
    let operator = caller.require_role(&state.admin_role)?;
    info!(%operator, "manual index sweep requested");
    let report = state.reconciler.sweep().await?;
    Ok(Json(ApiResponse::new("index sweep finished", report)))
}
