use std::sync::Arc;
use invoice_match_rust::config::StoreBackend;
use invoice_match_rust::{
    create_pool, router, AppConfig, AppState, DocumentStore, MatchService, MemoryStore, PgStore,
    ReportWriter, UploadStore,
};
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志 - 使用本地时间格式 (类似Java格式)
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_target(true)
        .with_level(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 加载配置 (非法的匹配参数直接终止启动)
    let config = AppConfig::load()?;
    info!("Starting server with config: {:?}", config);

    let timeout = config.storage.timeout();
    let store: Arc<dyn DocumentStore> = match config.database.backend {
        StoreBackend::Postgres => {
            let pool = create_pool(&config.database, timeout).await?;
            info!("Database pool created");
            let store = PgStore::new(pool);
            store.ensure_schema().await?;
            Arc::new(store)
        }
        StoreBackend::Memory => {
            info!("Using in-memory document store");
            Arc::new(MemoryStore::new())
        }
    };

    let reports = ReportWriter::new(&config.storage.report_dir);
    let uploads = UploadStore::new(&config.storage.upload_dir, config.storage.max_upload_bytes());
    let matcher = MatchService::new(store.clone(), reports, config.matching.clone(), timeout);

    let app = router(AppState::new(store, matcher, uploads));

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);
    info!("API Endpoints:");
    info!("  GET   /health");
    info!("  POST  /api/companies              - 注册公司");
    info!("  GET   /api/companies              - 公司列表");
    info!("  PATCH /api/companies/:id/contact  - 更新联系人");
    info!("  POST  /api/upload                 - 上传单据");
    info!("  GET   /api/documents?company_id=  - 单据列表");
    info!("  GET   /api/documents/:id          - 单据详情");
    info!("  PUT   /api/documents/:id/parsed   - 回写解析结果");
    info!("  POST  /api/match                  - PO/发票匹配");
    info!("  GET   /api/match/:id              - 匹配结果");
    info!("  GET   /api/matches/latest         - 最近一次匹配");
    info!("  GET   /api/reports/:name          - 下载报告");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
