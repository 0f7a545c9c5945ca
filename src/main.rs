//! 会话认证服务主入口

use session_auth::{
    config::{AppConfig, StorageBackend},
    db,
    middleware::AppState,
    repository::{MemoryRepository, Storage},
    routes, telemetry,
};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ===== CLI 参数处理 =====
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "--version" => {
                println!("session-auth {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" => {
                print_help();
                return Ok(());
            }
            _ => {
                eprintln!("未知参数: {}", args[1]);
                print_help();
                std::process::exit(1);
            }
        }
    }

    // 加载 .env 文件（开发环境）
    // 生产环境应该直接设置环境变量，不依赖 .env 文件
    if let Ok(env) = std::env::var("AUTH_ENV") {
        dotenv::from_filename(format!(".env.{}", env)).ok();
    } else {
        dotenv::from_filename(".env.local").ok();
        dotenv::dotenv().ok();
    }

    // 1. 加载配置
    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        anyhow::anyhow!("Failed to load configuration: {}", e)
    })?;

    // 2. 初始化日志与指标
    telemetry::init_telemetry(&config);
    telemetry::init_metrics();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Session auth service starting...");

    // 3. 存储后端
    let storage = match config.database.backend {
        StorageBackend::Postgres => {
            let pool = db::create_pool(&config.database).await?;
            db::run_migrations(&pool).await?;
            tracing::info!("Database initialized");
            Storage::postgres(pool)
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage, all data is lost on restart");
            Storage::memory(Arc::new(MemoryRepository::new()))
        }
    };

    // 4. 构建应用状态
    let app_state = Arc::new(AppState::new(config.clone(), storage)?);

    // 5. 后台清理任务
    spawn_maintenance(app_state.clone());

    // 6. 构建路由
    let app = routes::create_router(app_state);

    // 7. 启动服务器
    let addr = &config.server.addr;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(addr = %listener.local_addr()?, "Server listening");

    // 8. 优雅关闭：收到信号后停止接收新连接，超时后强制退出
    let (signal_tx, signal_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(());
    })
    .into_future();

    let timeout = Duration::from_secs(config.server.graceful_shutdown_timeout_secs);
    tokio::select! {
        result = server => result?,
        _ = async {
            if signal_rx.await.is_ok() {
                tokio::time::sleep(timeout).await;
            } else {
                std::future::pending::<()>().await;
            }
        } => {
            tracing::warn!("Graceful shutdown timeout reached, forcing exit");
        }
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// 定期清理过期刷新令牌和限流记录
fn spawn_maintenance(state: Arc<AppState>) {
    let interval_secs = state.config.security.session_cleanup_interval_secs;
    if interval_secs == 0 {
        tracing::info!("Expired session cleanup disabled");
        return;
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            if let Err(e) = state.auth_service.purge_expired_sessions().await {
                tracing::error!(error = %e, "Failed to purge expired sessions");
            }

            let tracked = state.rate_limiter.prune();
            tracing::debug!(tracked_ips = tracked, "Rate limiter pruned");

            if let Some(pool) = &state.storage.pool {
                db::record_pool_metrics(pool);
            }
        }
    });
}

/// 优雅关闭信号处理
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C received, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Terminate signal received, starting graceful shutdown");
        },
    }
}

/// 打印帮助信息
fn print_help() {
    println!("session-auth {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("用法: session-auth [选项]");
    println!();
    println!("选项:");
    println!("  --version     打印版本信息并退出");
    println!("  --help        打印此帮助信息并退出");
    println!();
    println!("环境变量:");
    println!("  所有配置通过 AUTH_ 前缀的环境变量完成，例如:");
    println!("  AUTH_DATABASE__URL, AUTH_SECURITY__JWT_SECRET, AUTH_SECURITY__SESSION_POLICY");
    println!("  可用选项请参考 .env.example");
}
