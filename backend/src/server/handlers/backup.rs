//! 快照备份 API 处理器

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::ApiResponse;
use crate::backup::{
    BackupConfig, BackupReceipt, DrainReport, RestoreOptions, RestoreResult, SystemState,
    UpdateBackupConfigRequest,
};
use crate::remote::RemoteSnapshot;
use crate::server::{ApiResult, AppState};

/// 创建备份请求
#[derive(Debug, Default, Deserialize)]
pub struct CreateBackupRequest {
    #[serde(default)]
    pub description: Option<String>,
}

/// 网络状态上报
#[derive(Debug, Deserialize)]
pub struct NetworkStatusRequest {
    pub online: bool,
}

#[derive(Debug, Serialize)]
pub struct NetworkStatusResponse {
    pub online: bool,
    pub changed: bool,
}

#[derive(Debug, Serialize)]
pub struct MarkDirtyResponse {
    /// 是否启动了防抖定时器
    pub debounce_armed: bool,
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: usize,
}

// ==================== 状态与备份 ====================

/// GET /api/v1/backup/state
pub async fn get_backup_state(
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<SystemState>>> {
    Ok(Json(ApiResponse::success(state.orchestrator.state()?)))
}

/// POST /api/v1/backup
pub async fn create_backup(
    State(state): State<AppState>,
    body: Option<Json<CreateBackupRequest>>,
) -> ApiResult<Json<ApiResponse<BackupReceipt>>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    info!("手动创建备份: description={:?}", request.description);

    let receipt = state.orchestrator.create_backup(request.description).await?;
    Ok(Json(ApiResponse::success(receipt)))
}

/// POST /api/v1/backup/dirty
/// 本地数据变更通知
pub async fn mark_dirty(
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<MarkDirtyResponse>>> {
    let debounce_armed = state.orchestrator.mark_dirty()?;
    Ok(Json(ApiResponse::success(MarkDirtyResponse { debounce_armed })))
}

// ==================== 远程快照 ====================

/// GET /api/v1/backup/snapshots
pub async fn list_snapshots(
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<Vec<RemoteSnapshot>>>> {
    let snapshots = state.orchestrator.list_snapshots().await?;
    Ok(Json(ApiResponse::success(snapshots)))
}

/// POST /api/v1/backup/snapshots/:id/restore
pub async fn restore_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RestoreOptions>>,
) -> ApiResult<Json<ApiResponse<RestoreResult>>> {
    let options = body.map(|Json(o)| o).unwrap_or_default();
    info!("恢复快照: id={}, options={:?}", id, options);

    let result = state.orchestrator.restore_backup(&id, options).await?;
    Ok(Json(ApiResponse::success(result)))
}

/// DELETE /api/v1/backup/snapshots/:id
pub async fn delete_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<String>>> {
    state.orchestrator.delete_snapshot(&id).await?;
    Ok(Json(ApiResponse::success(id)))
}

/// POST /api/v1/backup/prune
pub async fn prune_snapshots(
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<CountResponse>>> {
    let count = state.orchestrator.prune_old_snapshots(None).await?;
    Ok(Json(ApiResponse::success(CountResponse { count })))
}

// ==================== 配置 ====================

/// GET /api/v1/backup/config
pub async fn get_backup_config(
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<BackupConfig>>> {
    Ok(Json(ApiResponse::success(state.orchestrator.config()?)))
}

/// PUT /api/v1/backup/config
pub async fn update_backup_config(
    State(state): State<AppState>,
    Json(request): Json<UpdateBackupConfigRequest>,
) -> ApiResult<Json<ApiResponse<BackupConfig>>> {
    let config = state.orchestrator.update_config(request)?;
    Ok(Json(ApiResponse::success(config)))
}

// ==================== 队列与网络 ====================

/// POST /api/v1/backup/queue/process
pub async fn process_queue(
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<DrainReport>>> {
    let report = state.orchestrator.process_queue().await;
    Ok(Json(ApiResponse::success(report)))
}

/// DELETE /api/v1/backup/queue
pub async fn clear_queue(
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<CountResponse>>> {
    let count = state.orchestrator.clear_queue()?;
    Ok(Json(ApiResponse::success(CountResponse { count })))
}

/// PUT /api/v1/network
pub async fn set_network_status(
    State(state): State<AppState>,
    Json(request): Json<NetworkStatusRequest>,
) -> ApiResult<Json<ApiResponse<NetworkStatusResponse>>> {
    let changed = state.orchestrator.set_online(request.online);
    Ok(Json(ApiResponse::success(NetworkStatusResponse {
        online: request.online,
        changed,
    })))
}
