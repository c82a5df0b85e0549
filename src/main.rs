use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rainbow_notify::{build_router, config::Config, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载配置
    dotenv::dotenv().ok();
    let config = Config::from_env()?;

    // 初始化日志
    let filter = tracing_subscriber::EnvFilter::new(&config.log_level);
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Rainbow-Notify service...");
    if config.is_production() && config.internal_api_token == "default-token" {
        warn!("INTERNAL_API_TOKEN is using the default value");
    }

    let app_state = Arc::new(AppState::build(config.clone()).await?);

    // 启动后台任务
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let hub_task = app_state
        .hub
        .spawn(app_state.event_log.clone(), shutdown_rx.clone())
        .await?;
    start_background_tasks(app_state.clone(), shutdown_rx);

    let hub = app_state.hub.clone();
    let app = build_router(app_state);

    // 启动主服务器
    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port).parse()?;
    info!("Starting server on http://{}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_tx.send(true).ok();
            // 关闭打开的通知流
            hub.close_all();
        })
        .await?;

    hub_task.await?;
    info!("Server stopped");

    Ok(())
}

fn start_background_tasks(app_state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    info!("Starting background tasks...");

    // 进程内存储与用户目录缓存的过期清扫任务
    let memory_store = app_state.memory_store.clone();
    let directory = app_state.http_directory.clone();
    if memory_store.is_some() || directory.is_some() {
        let period = Duration::from_secs(app_state.config.kv_purge_interval.max(1));
        tokio::spawn(async move {
            let mut interval = interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Some(store) = &memory_store {
                            let purged = store.purge_expired();
                            if purged > 0 {
                                debug!("Purged {} expired keys", purged);
                            }
                        }
                        if let Some(directory) = &directory {
                            let purged = directory.purge_expired();
                            if purged > 0 {
                                debug!("Purged {} expired directory entries", purged);
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    info!("Background tasks started successfully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
