use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(super::handlers::root))
        .route("/health", get(super::handlers::health_check))

        // 认证
        .route("/auth/register", post(super::handlers::register))
        .route("/auth/login", post(super::handlers::login))
        .route("/auth/refresh", post(super::handlers::refresh))
        .route("/auth/logout", post(super::handlers::logout))
        .route("/auth/me", get(super::handlers::me))
        .route("/auth/verify", get(super::handlers::verify_token))

        // 采集源
        .route("/camera/start", post(super::handlers::start_camera))
        .route("/camera/stop", post(super::handlers::stop_camera))
        .route("/camera/status", get(super::handlers::camera_status))

        // 推理
        .route("/llm/status", get(super::handlers::llm_status))
        .route("/llm/process", post(super::handlers::process_image))
        .route("/llm/chat", post(super::handlers::chat))

        // 实时流
        .route("/ws", get(super::ws::ws_handler))
        .route("/ws/", get(super::ws::ws_handler))

        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
