// Web服务器模块

pub mod error;
pub mod handlers;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// 构建完整路由
pub fn router(app_state: AppState) -> Router {
    // 配置中间件层
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http()) // HTTP 请求日志
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // API 路由
    let api_routes = Router::new()
        // 认证API
        .route("/auth/state", get(handlers::get_auth_state))
        .route("/auth/sign-in", post(handlers::sign_in))
        .route("/auth/sign-out", post(handlers::sign_out))
        // 备份API
        .route("/backup", post(handlers::create_backup))
        .route("/backup/state", get(handlers::get_backup_state))
        .route("/backup/dirty", post(handlers::mark_dirty))
        .route("/backup/snapshots", get(handlers::list_snapshots))
        .route("/backup/snapshots/:id", delete(handlers::delete_snapshot))
        .route(
            "/backup/snapshots/:id/restore",
            post(handlers::restore_snapshot),
        )
        .route("/backup/prune", post(handlers::prune_snapshots))
        .route("/backup/config", get(handlers::get_backup_config))
        .route("/backup/config", put(handlers::update_backup_config))
        .route("/backup/queue/process", post(handlers::process_queue))
        .route("/backup/queue", delete(handlers::clear_queue))
        // 网络状态
        .route("/network", put(handlers::set_network_status))
        // 本地数据
        .route("/data/:collection", get(handlers::list_records))
        .route("/data/:collection", put(handlers::put_record))
        .with_state(app_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(|| async { "OK" }))
        .layer(middleware)
}
