// 本地数据 API

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::Value;

use super::ApiResponse;
use crate::server::{ApiError, ApiResult, AppState};
use crate::store::SNAPSHOT_COLLECTIONS;

fn check_collection(collection: &str) -> Result<(), ApiError> {
    if SNAPSHOT_COLLECTIONS.contains(&collection) {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("未知集合: {}", collection)))
    }
}

/// GET /api/v1/data/:collection
pub async fn list_records(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> ApiResult<Json<ApiResponse<Vec<Value>>>> {
    check_collection(&collection)?;
    let records = state.store.list(&collection)?;
    Ok(Json(ApiResponse::success(records)))
}

/// PUT /api/v1/data/:collection
/// 写入记录并标记数据已修改
pub async fn put_record(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(record): Json<Value>,
) -> ApiResult<Json<ApiResponse<Value>>> {
    check_collection(&collection)?;
    if !record.is_object() {
        return Err(ApiError::BadRequest("记录必须是 JSON 对象".to_string()));
    }

    state.store.put(&collection, &record)?;
    state.orchestrator.mark_dirty()?;
    Ok(Json(ApiResponse::success(record)))
}
