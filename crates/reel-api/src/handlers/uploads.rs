//! Presigned multipart upload planning.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use reel_models::{PlanUploadRequest, PlanUploadResponse};
use tracing::info;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::handlers::{ok, ApiJson, Envelope};
use crate::state::AppState;

/// `POST /api/uploads/plan`
///
/// Authentication is checked by the planner so that an anonymous request
/// with an incomplete body still reports 401 first.
pub async fn plan_upload(
    State(state): State<AppState>,
    user: Option<AuthUser>,
    ApiJson(request): ApiJson<PlanUploadRequest>,
) -> ApiResult<Json<Envelope<PlanUploadResponse>>> {
    let uid = user.as_ref().map(|u| u.uid.as_str());
    let plan = state.planner.plan_upload(uid, &request).await?;

    info!(
        upload_id = %plan.upload_id,
        total_parts = plan.total_parts,
        "Upload plan issued"
    );

    Ok(ok(PlanUploadResponse::from_plan(&plan, Utc::now().timestamp())))
}
