use crate::error::CaptureError;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// 帧率上限（帧/秒）
pub const MAX_CAPTURE_FPS: u32 = 120;

/// 采集配置
///
/// 传给 FrameSource::start 之后不再修改。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    /// 目标帧率（帧/秒）
    pub fps: u32,
    /// JPEG质量（1-100）
    pub quality: u8,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 15,
            quality: 80,
        }
    }
}

impl CaptureConfig {
    /// 校验参数范围
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::InvalidConfig(format!(
                "dimensions must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.fps == 0 || self.fps > MAX_CAPTURE_FPS {
            return Err(CaptureError::InvalidConfig(format!(
                "fps must be in (0, {}], got {}",
                MAX_CAPTURE_FPS, self.fps
            )));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(CaptureError::InvalidConfig(format!(
                "quality must be in [1, 100], got {}",
                self.quality
            )));
        }
        Ok(())
    }

    /// 采集间隔（秒）
    pub fn frame_interval_secs(&self) -> f64 {
        1.0 / self.fps.max(1) as f64
    }
}

/// 编码后的视频帧
///
/// `data` 为引用计数的只读JPEG数据，多个连接共享同一帧时不会复制。
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Bytes,
    /// 相对采集源启动的单调时间戳（秒）
    pub timestamp: f64,
    /// 采集序号，单调递增
    pub sequence: u64,
}

impl Frame {
    pub fn new(data: Bytes, timestamp: f64, sequence: u64) -> Self {
        Self {
            data,
            timestamp,
            sequence,
        }
    }

    /// Base64编码的帧数据
    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// 推理请求负载
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferencePayload {
    /// Base64图像（可带 data URL 前缀）
    Image(String),
    /// 纯文本
    Text(String),
}

/// 推理请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceRequest {
    pub payload: InferencePayload,
    pub instruction: Option<String>,
}

impl InferenceRequest {
    pub fn image(image_data: impl Into<String>, prompt: Option<String>) -> Self {
        Self {
            payload: InferencePayload::Image(image_data.into()),
            instruction: prompt,
        }
    }

    pub fn text(message: impl Into<String>) -> Self {
        Self {
            payload: InferencePayload::Text(message.into()),
            instruction: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.payload {
            InferencePayload::Image(_) => "image",
            InferencePayload::Text(_) => "text",
        }
    }
}

/// 推理结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub response: String,
    /// 置信度 [0, 1]
    pub confidence: f64,
    /// 处理耗时（秒）
    pub processing_time: f64,
}

impl InferenceResult {
    pub fn new(response: impl Into<String>, confidence: f64, processing_time: f64) -> Self {
        Self {
            response: response.into(),
            confidence: confidence.clamp(0.0, 1.0),
            processing_time: processing_time.max(0.0),
        }
    }
}

/// 推理服务状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub available: bool,
    pub model_loaded: bool,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusSnapshot {
    pub fn unavailable(endpoint: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            available: false,
            model_loaded: false,
            endpoint: endpoint.into(),
            model_name: None,
            error: Some(error.into()),
        }
    }
}

/// 采集源状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraStatus {
    pub is_active: bool,
    pub has_camera: bool,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<CaptureConfig>,
    pub viewers: usize,
}
