use crate::auth::password::{MAX_HASH_COST, MIN_HASH_COST};
use common::{CaptureConfig, InferencePayload, InferenceRequest};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// 图像上限默认值：2 MiB
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 2 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("Failed to parse config file: {0}")]
    Parse(String),

    #[error("Failed to write config file: {0}")]
    Write(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// 服务配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub capture: CaptureSettings,
    pub stream: StreamSettings,
    pub inference: InferenceSettings,
    pub auth: AuthSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// 采集源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSourceKind {
    /// 合成画面，无需硬件
    Synthetic,
    /// 从目录循环回放静态图像
    ImageDir,
}

/// 合成画面样式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyntheticPattern {
    Solid,
    ColorBars,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub source: CaptureSourceKind,
    pub pattern: SyntheticPattern,
    /// ImageDir 源的目录
    pub device_path: PathBuf,
    /// 启动时自动打开采集源
    pub auto_start: bool,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub quality: u8,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        let defaults = CaptureConfig::default();
        Self {
            source: CaptureSourceKind::Synthetic,
            pattern: SyntheticPattern::Solid,
            device_path: PathBuf::from("./camera-frames"),
            auto_start: false,
            width: defaults.width,
            height: defaults.height,
            fps: defaults.fps,
            quality: defaults.quality,
        }
    }
}

impl CaptureSettings {
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            width: self.width,
            height: self.height,
            fps: self.fps,
            quality: self.quality,
        }
    }
}

/// 帧节奏模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacingMode {
    /// 按挂钟节奏发送（target_fps）
    Throttled,
    /// 跟随采集源帧率
    Unthrottled,
}

/// 帧分发模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameDelivery {
    /// 每个连接自行拉取并发送
    PerConnection,
    /// 单个节奏任务采集一次，经 ClientRegistry 扇出
    Broadcast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub pacing: PacingMode,
    pub target_fps: f64,
    pub delivery: FrameDelivery,
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub command_poll_timeout: Duration,
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub send_timeout: Duration,
    /// 每个连接同时进行的推理数上限
    pub max_inflight_inference: usize,
    /// 最后一个连接离开时释放采集源
    pub release_camera_when_idle: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            pacing: PacingMode::Throttled,
            target_fps: 15.0,
            delivery: FrameDelivery::PerConnection,
            command_poll_timeout: Duration::from_millis(100),
            send_timeout: Duration::from_secs(5),
            max_inflight_inference: 4,
            release_camera_when_idle: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    pub endpoint: String,
    pub model: String,
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub timeout: Duration,
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub image_timeout: Duration,
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub status_timeout: Duration,
    pub max_image_bytes: usize,
    pub default_image_prompt: String,
    pub temperature: f32,
    pub top_p: f32,
    pub num_predict: u32,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://ollama:11434".to_string(),
            model: "llava:7b".to_string(),
            timeout: Duration::from_secs(30),
            image_timeout: Duration::from_secs(120),
            status_timeout: Duration::from_secs(5),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            default_image_prompt:
                "Analyze this image and provide helpful insights. Be conversational and helpful."
                    .to_string(),
            temperature: 0.7,
            top_p: 0.9,
            num_predict: 200,
        }
    }
}

impl InferenceSettings {
    /// 按请求类型选择超时：图像请求更慢
    pub fn timeout_for(&self, request: &InferenceRequest) -> Duration {
        match request.payload {
            InferencePayload::Image(_) => self.image_timeout,
            InferencePayload::Text(_) => self.timeout,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultUser {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// WebSocket 连接需要 ?token= 访问令牌
    pub require_token_for_stream: bool,
    pub access_token_ttl_minutes: i64,
    pub refresh_token_ttl_days: i64,
    /// bcrypt 成本因子
    pub hash_cost: u32,
    pub default_user: Option<DefaultUser>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            require_token_for_stream: true,
            access_token_ttl_minutes: 30,
            refresh_token_ttl_days: 7,
            hash_cost: bcrypt::DEFAULT_COST,
            default_user: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// tracing EnvFilter 指令，RUST_LOG 优先
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// 加载配置
    ///
    /// 未指定路径时使用默认值；指定的文件不存在时写出一份默认配置。
    /// 之后应用环境变量覆盖并校验。
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                warn!("Config file {:?} not found, writing defaults", path);
                let config = Self::default();
                config.save(path)?;
                config
            }
            None => Self::default(),
        };

        EnvConfigOverride::apply_overrides(&mut config, |key| std::env::var(key).ok());
        config.validate()?;

        info!(
            "Configuration loaded: {}:{} source={:?} pacing={:?} delivery={:?}",
            config.server.host,
            config.server.port,
            config.capture.source,
            config.stream.pacing,
            config.stream.delivery
        );
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Write(e.to_string()))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write(e.to_string()))?;
            }
        }

        std::fs::write(path, content).map_err(|e| ConfigError::Write(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.is_empty() {
            return Err(ConfigError::Invalid("server.host cannot be empty".to_string()));
        }

        self.capture
            .capture_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("capture: {}", e)))?;

        if !(self.stream.target_fps > 0.0 && self.stream.target_fps <= 120.0) {
            return Err(ConfigError::Invalid(format!(
                "stream.target_fps must be in (0, 120], got {}",
                self.stream.target_fps
            )));
        }

        if self.stream.command_poll_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "stream.command_poll_timeout must be greater than 0".to_string(),
            ));
        }

        if self.stream.send_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "stream.send_timeout must be greater than 0".to_string(),
            ));
        }

        if self.stream.max_inflight_inference == 0 {
            return Err(ConfigError::Invalid(
                "stream.max_inflight_inference must be greater than 0".to_string(),
            ));
        }

        if self.inference.endpoint.is_empty() || self.inference.model.is_empty() {
            return Err(ConfigError::Invalid(
                "inference.endpoint and inference.model are required".to_string(),
            ));
        }

        if self.inference.max_image_bytes < 1024 {
            return Err(ConfigError::Invalid(
                "inference.max_image_bytes must be at least 1024".to_string(),
            ));
        }

        if !(MIN_HASH_COST..=MAX_HASH_COST).contains(&self.auth.hash_cost) {
            return Err(ConfigError::Invalid(format!(
                "auth.hash_cost must be in [{}, {}], got {}",
                MIN_HASH_COST, MAX_HASH_COST, self.auth.hash_cost
            )));
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// 环境变量覆盖
pub struct EnvConfigOverride;

impl EnvConfigOverride {
    pub fn apply_overrides<F>(config: &mut Config, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("VISION_HOST") {
            config.server.host = host;
        }
        if let Some(port) = lookup("VISION_PORT").and_then(|v| v.parse().ok()) {
            config.server.port = port;
        }
        if let Some(url) = lookup("VISION_OLLAMA_URL") {
            config.inference.endpoint = url;
        }
        if let Some(model) = lookup("VISION_MODEL_NAME") {
            config.inference.model = model;
        }
        if let Some(fps) = lookup("VISION_TARGET_FPS").and_then(|v| v.parse().ok()) {
            config.stream.target_fps = fps;
        }
        if let Some(source) = lookup("VISION_CAPTURE_SOURCE") {
            match source.to_lowercase().as_str() {
                "synthetic" => config.capture.source = CaptureSourceKind::Synthetic,
                "image_dir" => config.capture.source = CaptureSourceKind::ImageDir,
                other => warn!("Ignoring unknown VISION_CAPTURE_SOURCE: {}", other),
            }
        }
        if let Some(path) = lookup("VISION_CAPTURE_PATH") {
            config.capture.device_path = PathBuf::from(path);
        }
        if let Some(flag) = lookup("VISION_REQUIRE_STREAM_TOKEN") {
            config.auth.require_token_for_stream = flag.to_lowercase() == "true";
        }
        if let Some(level) = lookup("VISION_LOG_LEVEL") {
            config.logging.level = level;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stream.target_fps, 15.0);
        assert_eq!(config.stream.command_poll_timeout, Duration::from_millis(100));
        assert_eq!(config.inference.max_image_bytes, 2 * 1024 * 1024);
        assert_eq!(config.bind_address(), "0.0.0.0:8000");
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml(
            r#"
            [stream]
            pacing = "unthrottled"
            delivery = "broadcast"
            command_poll_timeout = 50

            [capture]
            source = "image_dir"
            device_path = "/tmp/frames"
            "#,
        )
        .unwrap();

        assert_eq!(config.stream.pacing, PacingMode::Unthrottled);
        assert_eq!(config.stream.delivery, FrameDelivery::Broadcast);
        assert_eq!(config.stream.command_poll_timeout, Duration::from_millis(50));
        assert_eq!(config.capture.source, CaptureSourceKind::ImageDir);
        assert_eq!(config.capture.width, 640);
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.stream.target_fps = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.capture.quality = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.stream.send_timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.auth.hash_cost = MIN_HASH_COST - 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.auth.hash_cost = MAX_HASH_COST + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vision.toml");

        let mut config = Config::default();
        config.server.port = 9100;
        config.stream.send_timeout = Duration::from_millis(1500);
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.server.port, 9100);
        assert_eq!(loaded.stream.send_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_load_missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vision.toml");

        let config = Config::load(Some(&path)).unwrap();
        assert!(path.exists());
        assert_eq!(config.capture.source, CaptureSourceKind::Synthetic);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("VISION_PORT", "9000"),
            ("VISION_OLLAMA_URL", "http://localhost:11434"),
            ("VISION_CAPTURE_SOURCE", "image_dir"),
            ("VISION_REQUIRE_STREAM_TOKEN", "false"),
            ("VISION_TARGET_FPS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        EnvConfigOverride::apply_overrides(&mut config, |key| {
            vars.get(key).map(|v| v.to_string())
        });

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.inference.endpoint, "http://localhost:11434");
        assert_eq!(config.capture.source, CaptureSourceKind::ImageDir);
        assert!(!config.auth.require_token_for_stream);
        assert_eq!(config.stream.target_fps, 15.0);
    }
}
