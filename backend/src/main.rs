use snapshot_backup::{server, AppConfig, AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// 配置文件路径
const CONFIG_PATH: &str = "config/app.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统（RUST_LOG 控制级别）
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    info!("Snapshot Backup v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config_path =
        std::env::var("SNAPSHOT_BACKUP_CONFIG").unwrap_or_else(|_| CONFIG_PATH.to_string());
    let config = AppConfig::load_or_default(&config_path).await;
    let addr = format!("{}:{}", config.server.host, config.server.port);

    // 创建应用状态
    let app_state = AppState::new(config).await?;
    let orchestrator = app_state.orchestrator.clone();

    if orchestrator.start()? {
        info!("自动备份已启动");
    }
    info!("应用状态初始化完成");

    let app = server::router(app_state);

    // 启动服务器
    info!("服务器启动在: http://{}", addr);
    info!("API 基础路径: http://{}/api/v1", addr);
    info!("健康检查: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("监听退出信号失败: {}", e);
            }
            info!("收到退出信号，正在关闭...");
        })
        .await?;

    // 关闭前把未备份的修改放入队列
    match orchestrator.on_app_close().await {
        Ok(Some(receipt)) => info!("关闭前备份已加入队列: {}", receipt.file_name()),
        Ok(None) => {}
        Err(e) => tracing::warn!("关闭前备份失败: {}", e),
    }
    orchestrator.shutdown();

    info!("已退出");
    Ok(())
}
