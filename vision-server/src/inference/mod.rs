// 推理模块
//
// - `InferenceClient`: 推理服务抽象接口
// - `OllamaClient`: Ollama /api/generate 客户端
// - `image_prep`: 图像负载校验与缩放

pub mod image_prep;
pub mod ollama;
pub mod types;

pub use image_prep::{prepare_image, PreparedImage};
pub use ollama::OllamaClient;

use async_trait::async_trait;
use common::{InferenceError, InferenceRequest, InferenceResult, StatusSnapshot};
use std::time::Duration;

/// 推理服务客户端
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// 提交一次推理请求
    ///
    /// # 错误
    ///
    /// - `InferenceError::InvalidPayload`: 图像无法解码，或无法缩小到上限以内
    /// - `InferenceError::Unavailable`: 连接失败、非200响应或响应体无法解析
    /// - `InferenceError::Timeout`: 超过 `timeout`
    async fn infer(
        &self,
        request: InferenceRequest,
        timeout: Duration,
    ) -> Result<InferenceResult, InferenceError>;

    /// 查询服务状态，失败时返回 available=false 的快照而不是错误
    async fn status(&self) -> StatusSnapshot;
}
