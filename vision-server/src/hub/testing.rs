// 测试用的帧源和推理桩

use crate::capture::FrameSource;
use crate::inference::InferenceClient;
use async_trait::async_trait;
use bytes::Bytes;
use common::{
    CaptureConfig, CaptureError, Frame, InferenceError, InferencePayload, InferenceRequest,
    InferenceResult, StatusSnapshot,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// 每次读取返回一个新序号的固定帧，不做任何编码
#[derive(Default)]
pub struct StaticFrameSource {
    active: AtomicBool,
    sequence: AtomicU64,
    config: Mutex<Option<CaptureConfig>>,
    /// 每次启动都从序号 0 重新开始
    reset_on_start: bool,
}

impl StaticFrameSource {
    pub fn resetting() -> Self {
        Self {
            reset_on_start: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl FrameSource for StaticFrameSource {
    async fn start(&self, config: CaptureConfig) -> Result<(), CaptureError> {
        config.validate()?;
        if self.reset_on_start {
            self.sequence.store(0, Ordering::SeqCst);
        }
        *self.config.lock().await = Some(config);
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        *self.config.lock().await = None;
        self.active.store(false, Ordering::SeqCst);
    }

    async fn capture_frame(&self) -> Option<Frame> {
        let config = self.config.lock().await.clone()?;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        Some(Frame::new(
            Bytes::from_static(b"\xff\xd8\xff\xd9"),
            sequence as f64 * config.frame_interval_secs(),
            sequence,
        ))
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn active_config(&self) -> Option<CaptureConfig> {
        self.config.lock().await.clone()
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

/// 固定延迟后返回 {"ok", 0.9, 0.01}；文本为 "fail" 时返回 Unavailable
pub struct StubInference {
    delay: Duration,
    calls: AtomicUsize,
}

impl StubInference {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceClient for StubInference {
    async fn infer(
        &self,
        request: InferenceRequest,
        _timeout: Duration,
    ) -> Result<InferenceResult, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        match request.payload {
            InferencePayload::Text(text) if text == "fail" => {
                Err(InferenceError::Unavailable("stub failure".to_string()))
            }
            _ => Ok(InferenceResult::new("ok", 0.9, 0.01)),
        }
    }

    async fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            available: true,
            model_loaded: true,
            endpoint: "stub".to_string(),
            model_name: Some("stub".to_string()),
            error: None,
        }
    }
}
