// 认证 API

use axum::{extract::State, Json};
use serde::Deserialize;
use tracing::info;

use super::ApiResponse;
use crate::auth::{AuthState, Credentials};
use crate::server::{ApiResult, AppState};

/// 登录请求
#[derive(Debug, Deserialize)]
pub struct SignInRequest {
    pub token: String,
    #[serde(default)]
    pub expires_in_secs: Option<u64>,
    #[serde(default)]
    pub user_email: Option<String>,
}

/// GET /api/v1/auth/state
pub async fn get_auth_state(
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<AuthState>>> {
    Ok(Json(ApiResponse::success(state.auth.auth_state())))
}

/// POST /api/v1/auth/sign-in
/// 登录后自动启用备份
pub async fn sign_in(
    State(state): State<AppState>,
    Json(request): Json<SignInRequest>,
) -> ApiResult<Json<ApiResponse<AuthState>>> {
    let auth_state = state
        .auth
        .sign_in(Credentials {
            access_token: request.token,
            expires_in_secs: request.expires_in_secs,
            user_email: request.user_email,
        })
        .await?;

    state.orchestrator.on_signed_in()?;
    info!("登录完成，自动备份已启用");

    Ok(Json(ApiResponse::success(auth_state)))
}

/// POST /api/v1/auth/sign-out
/// 登出并清除全部备份状态
pub async fn sign_out(State(state): State<AppState>) -> ApiResult<Json<ApiResponse<String>>> {
    state.auth.sign_out().await?;
    state.orchestrator.reset()?;
    Ok(Json(ApiResponse::success("已登出".to_string())))
}
