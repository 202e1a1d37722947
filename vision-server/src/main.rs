use anyhow::{Context, Result};
use clap::{Arg, Command};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vision_server::config::{Config, FrameDelivery};
use vision_server::http::{create_router, AppState};
use vision_server::hub::spawn_broadcast_pacer;

const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("vision-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Camera streaming and LLM inference hub")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to the TOML configuration file"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).context("failed to load configuration")?;

    // 初始化日志，RUST_LOG 优先
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("🚀 Vision server starting...");
    info!("✓ Configuration loaded");

    let bind_address: SocketAddr = config
        .bind_address()
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_address()))?;
    let state = AppState::new(config);
    info!("✓ Components initialized");

    let shutdown = CancellationToken::new();

    if state.config.capture.auto_start {
        match state
            .camera
            .start(state.config.capture.capture_config())
            .await
        {
            Ok(()) => info!("✓ Camera auto-started"),
            Err(e) => warn!("Camera auto-start failed: {}", e),
        }
    }

    let pacer = match state.config.stream.delivery {
        FrameDelivery::Broadcast => {
            info!("✓ Broadcast pacer started");
            Some(spawn_broadcast_pacer(
                state.camera.clone(),
                state.registry.clone(),
                state.config.stream.clone(),
                shutdown.clone(),
            ))
        }
        FrameDelivery::PerConnection => None,
    };

    // 定期清理过期会话
    let auth = state.auth.clone();
    let purge_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_PURGE_INTERVAL);
        loop {
            tokio::select! {
                _ = purge_shutdown.cancelled() => break,
                _ = interval.tick() => {
                    auth.purge_expired();
                }
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("failed to bind {}", bind_address))?;
    info!("✓ HTTP server listening on {}", bind_address);
    info!("✅ Vision server ready!");

    let app = create_router(state.clone());
    let server_shutdown = shutdown.clone();
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
            _ = server_shutdown.cancelled() => {}
        }
    })
    .await;

    // 先停止节奏任务和会话，再断开所有连接，最后释放采集源
    shutdown.cancel();
    state.registry.close_all().await;
    if let Some(pacer) = pacer {
        match pacer.await {
            Ok(stats) => info!(
                "Broadcast pacer stopped: frames={}, deliveries={}, failures={}",
                stats.frames_broadcast, stats.deliveries, stats.failures
            ),
            Err(e) => error!("Broadcast pacer task failed: {}", e),
        }
    }
    state.camera.stop().await;

    served.context("HTTP server error")?;
    info!("Vision server stopped");
    Ok(())
}
