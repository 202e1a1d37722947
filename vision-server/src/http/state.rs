use crate::auth::LocalAuthService;
use crate::capture::{build_frame_source, CameraController, FrameSource};
use crate::config::Config;
use crate::hub::StreamHub;
use crate::inference::{InferenceClient, OllamaClient};
use crate::registry::ClientRegistry;
use std::sync::Arc;

/// HTTP 层共享状态
///
/// 所有组件显式注入，没有全局单例。
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub camera: Arc<CameraController>,
    pub inference: Arc<dyn InferenceClient>,
    pub registry: ClientRegistry,
    pub hub: StreamHub,
    pub auth: Arc<LocalAuthService>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let source = build_frame_source(&config.capture);
        let inference: Arc<dyn InferenceClient> = Arc::new(OllamaClient::new(config.inference.clone()));
        Self::with_parts(config, source, inference)
    }

    pub fn with_parts(
        config: Config,
        source: Arc<dyn FrameSource>,
        inference: Arc<dyn InferenceClient>,
    ) -> Self {
        let camera = Arc::new(CameraController::new(
            source,
            config.stream.release_camera_when_idle,
        ));
        let registry = ClientRegistry::new();
        let hub = StreamHub::new(
            camera.clone(),
            inference.clone(),
            registry.clone(),
            config.stream.clone(),
            config.inference.clone(),
        );
        let auth = Arc::new(LocalAuthService::new(config.auth.clone()));

        Self {
            config: Arc::new(config),
            camera,
            inference,
            registry,
            hub,
            auth,
        }
    }
}
