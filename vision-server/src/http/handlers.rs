use super::state::AppState;
use crate::auth::{AuthError, AuthProvider, Credentials, Identity, Registration, TokenPair, UserProfile};
use axum::{
    async_trait,
    extract::{FromRequestParts, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use common::{
    CameraStatus, CaptureConfig, CaptureError, InferenceError, InferenceRequest, InferenceResult,
    ServerMessage, StatusSnapshot,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    status: String,
    data: Option<T>,
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> ApiResponse<()> {
        ApiResponse {
            status: "error".to_string(),
            data: None,
            error: Some(message),
        }
    }
}

/// 带状态码的错误响应，响应体沿用 ApiResponse 格式
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::<()>::error(self.message))).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        let status = match e {
            AuthError::InvalidCredentials | AuthError::InvalidToken | AuthError::TokenExpired => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::UsernameTaken
            | AuthError::EmailTaken
            | AuthError::InactiveUser
            | AuthError::InvalidRegistration(_) => StatusCode::BAD_REQUEST,
            AuthError::Hashing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<CaptureError> for ApiError {
    fn from(e: CaptureError) -> Self {
        let status = match e {
            CaptureError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            CaptureError::DeviceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, e.to_string())
    }
}

impl From<InferenceError> for ApiError {
    fn from(e: InferenceError) -> Self {
        let status = match e {
            InferenceError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            InferenceError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            InferenceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, e.to_string())
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// 从 Authorization 头中取出 Bearer 令牌
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// 已认证用户提取器
pub struct AuthUser(pub Identity);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ApiError::unauthorized("Could not validate credentials"))?;
        let identity = state.auth.verify(token).await?;
        Ok(AuthUser(identity))
    }
}

#[derive(Debug, Serialize)]
pub struct Banner {
    message: String,
    status: String,
    version: String,
}

pub async fn root() -> Json<ApiResponse<Banner>> {
    Json(ApiResponse::success(Banner {
        message: "VisionAI API".to_string(),
        status: "running".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

#[derive(Debug, Serialize)]
pub struct Health {
    status: String,
    camera_active: bool,
    clients: usize,
}

/// 健康检查
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<Health>> {
    Json(ApiResponse::success(Health {
        status: "healthy".to_string(),
        camera_active: state.camera.is_active(),
        clients: state.registry.len(),
    }))
}

// ========== 认证 ==========

pub async fn register(
    State(state): State<AppState>,
    Json(registration): Json<Registration>,
) -> ApiResult<UserProfile> {
    // bcrypt 计算较重，移出异步工作线程
    let auth = state.auth.clone();
    let profile = tokio::task::spawn_blocking(move || auth.register(registration))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;
    Ok(Json(ApiResponse::success(profile)))
}

pub async fn login(
    State(state): State<AppState>,
    Json(credentials): Json<Credentials>,
) -> ApiResult<TokenPair> {
    let auth = state.auth.clone();
    let tokens = tokio::task::spawn_blocking(move || auth.login(&credentials))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;
    Ok(Json(ApiResponse::success(tokens)))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    refresh_token: String,
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> ApiResult<TokenPair> {
    let tokens = state.auth.refresh(&request.refresh_token)?;
    Ok(Json(ApiResponse::success(tokens)))
}

pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    AuthUser(identity): AuthUser,
) -> ApiResult<String> {
    if let Some(token) = bearer_token(&headers) {
        state.auth.logout(token);
    }
    info!("User logged out: {}", identity.username);
    Ok(Json(ApiResponse::success("Logged out".to_string())))
}

pub async fn me(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
) -> ApiResult<UserProfile> {
    let profile = state.auth.profile(&identity)?;
    Ok(Json(ApiResponse::success(profile)))
}

#[derive(Debug, Serialize)]
pub struct TokenCheck {
    valid: bool,
    user: Identity,
}

pub async fn verify_token(AuthUser(identity): AuthUser) -> Json<ApiResponse<TokenCheck>> {
    Json(ApiResponse::success(TokenCheck {
        valid: true,
        user: identity,
    }))
}

// ========== 采集源 ==========

/// 启动采集源，请求体缺省时使用配置文件中的采集参数
pub async fn start_camera(
    State(state): State<AppState>,
    config: Option<Json<CaptureConfig>>,
) -> ApiResult<CameraStatus> {
    let config = config
        .map(|Json(c)| c)
        .unwrap_or_else(|| state.config.capture.capture_config());

    state.camera.start(config).await?;
    notify_camera_status(&state).await;

    Ok(Json(ApiResponse::success(state.camera.status().await)))
}

pub async fn stop_camera(State(state): State<AppState>) -> ApiResult<CameraStatus> {
    state.camera.stop().await;
    notify_camera_status(&state).await;

    Ok(Json(ApiResponse::success(state.camera.status().await)))
}

pub async fn camera_status(State(state): State<AppState>) -> Json<ApiResponse<CameraStatus>> {
    Json(ApiResponse::success(state.camera.status().await))
}

async fn notify_camera_status(state: &AppState) {
    let message = ServerMessage::CameraStatus {
        is_active: state.camera.is_active(),
    };
    let report = state.registry.broadcast(&message).await;
    if report.failed > 0 {
        warn!(
            "Camera status delivered to {} clients, {} failed",
            report.delivered, report.failed
        );
    }
}

// ========== 推理 ==========

pub async fn llm_status(State(state): State<AppState>) -> Json<ApiResponse<StatusSnapshot>> {
    Json(ApiResponse::success(state.inference.status().await))
}

#[derive(Debug, Deserialize)]
pub struct ProcessImageRequest {
    image_data: String,
    prompt: Option<String>,
}

pub async fn process_image(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Json(request): Json<ProcessImageRequest>,
) -> ApiResult<InferenceResult> {
    if request.image_data.trim().is_empty() {
        return Err(InferenceError::InvalidPayload("image_data is empty".to_string()).into());
    }
    info!("Image inference requested by {}", identity.username);

    let prompt = request.prompt.filter(|p| !p.trim().is_empty());
    run_inference(&state, InferenceRequest::image(request.image_data, prompt)).await
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    prompt: String,
}

pub async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<InferenceResult> {
    if request.prompt.trim().is_empty() {
        return Err(InferenceError::InvalidPayload("prompt is empty".to_string()).into());
    }
    run_inference(&state, InferenceRequest::text(request.prompt)).await
}

async fn run_inference(state: &AppState, request: InferenceRequest) -> ApiResult<InferenceResult> {
    let timeout = state.config.inference.timeout_for(&request);
    let result = state.inference.infer(request, timeout).await.map_err(|e| {
        warn!("Inference request failed: {}", e);
        ApiError::from(e)
    })?;
    Ok(Json(ApiResponse::success(result)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::http::create_router;
    use crate::hub::testing::{StaticFrameSource, StubInference};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let mut config = Config::default();
        config.auth.hash_cost = 4;
        AppState::with_parts(
            config,
            Arc::new(StaticFrameSource::default()),
            Arc::new(StubInference::new(Duration::ZERO)),
        )
    }

    async fn call(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
        let response = create_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, value)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn login_token(state: &AppState) -> String {
        let (status, _) = call(
            state,
            post_json(
                "/auth/register",
                json!({"username": "alice", "email": "alice@example.com", "password": "secret123"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            state,
            post_json("/auth/login", json!({"username": "alice", "password": "secret123"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["data"]["access_token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_root_and_health() {
        let state = test_state();

        let (status, body) = call(&state, get("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["message"], "VisionAI API");

        let (status, body) = call(&state, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "healthy");
        assert_eq!(body["data"]["camera_active"], false);
    }

    #[tokio::test]
    async fn test_camera_lifecycle() {
        let state = test_state();

        let (_, body) = call(&state, get("/camera/status")).await;
        assert_eq!(body["data"]["is_active"], false);
        assert_eq!(body["data"]["has_camera"], false);

        let request = Request::builder()
            .method("POST")
            .uri("/camera/start")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["is_active"], true);
        assert_eq!(body["data"]["config"]["fps"], 15);

        let (status, body) = call(&state, post_json("/camera/stop", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["is_active"], false);
    }

    #[tokio::test]
    async fn test_camera_start_with_config_and_invalid_config() {
        let state = test_state();

        let (status, body) = call(
            &state,
            post_json("/camera/start", json!({"width": 320, "height": 240, "fps": 10})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["config"]["width"], 320);
        assert_eq!(body["data"]["config"]["quality"], 80);

        let (status, body) = call(&state, post_json("/camera/start", json!({"fps": 0}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_auth_flow() {
        let state = test_state();
        let token = login_token(&state).await;

        let request = Request::builder()
            .uri("/auth/me")
            .header("authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["username"], "alice");
        assert_eq!(body["data"]["email"], "alice@example.com");

        let request = Request::builder()
            .uri("/auth/verify")
            .header("authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["valid"], true);

        let (status, body) = call(&state, get("/auth/me")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["status"], "error");

        let (status, _) = call(
            &state,
            post_json("/auth/login", json!({"username": "alice", "password": "nope"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_logout_revokes_token() {
        let state = test_state();
        let token = login_token(&state).await;

        let request = Request::builder()
            .method("POST")
            .uri("/auth/logout")
            .header("authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&state, request).await;
        assert_eq!(status, StatusCode::OK);

        let request = Request::builder()
            .uri("/auth/verify")
            .header("authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&state, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let state = test_state();
        login_token(&state).await;

        let (status, body) = call(
            &state,
            post_json(
                "/auth/register",
                json!({"username": "alice", "email": "a2@example.com", "password": "secret123"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Username already registered");
    }

    #[tokio::test]
    async fn test_chat_and_llm_status() {
        let state = test_state();

        let (status, body) = call(&state, post_json("/llm/chat", json!({"prompt": "hello"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["response"], "ok");

        let (status, body) = call(&state, post_json("/llm/chat", json!({"prompt": "fail"}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "error");

        let (_, body) = call(&state, get("/llm/status")).await;
        assert_eq!(body["data"]["available"], true);
    }

    #[tokio::test]
    async fn test_process_image_requires_token() {
        let state = test_state();

        let (status, _) = call(
            &state,
            post_json("/llm/process", json!({"image_data": "abcd"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let token = login_token(&state).await;
        let request = Request::builder()
            .method("POST")
            .uri("/llm/process")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", token))
            .body(Body::from(json!({"image_data": "abcd", "prompt": "what?"}).to_string()))
            .unwrap();
        let (status, body) = call(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["response"], "ok");
    }

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc"));
    }
}
