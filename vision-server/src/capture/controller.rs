use super::source::FrameSource;
use common::{CameraStatus, CaptureConfig, CaptureError, Frame};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// 采集源生命周期控制器
///
/// 唯一允许启动/停止采集源的组件，启停操作由互斥锁串行化。
/// 流连接只读取帧，并通过观看租约登记自己。
pub struct CameraController {
    source: Arc<dyn FrameSource>,
    lifecycle: Mutex<()>,
    viewers: AtomicUsize,
    release_when_idle: bool,
}

impl CameraController {
    pub fn new(source: Arc<dyn FrameSource>, release_when_idle: bool) -> Self {
        Self {
            source,
            lifecycle: Mutex::new(()),
            viewers: AtomicUsize::new(0),
            release_when_idle,
        }
    }

    pub async fn start(&self, config: CaptureConfig) -> Result<(), CaptureError> {
        let _guard = self.lifecycle.lock().await;
        info!("Starting camera {} with {:?}", self.source.describe(), config);
        self.source.start(config).await
    }

    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        if self.source.is_active() {
            info!("Stopping camera {}", self.source.describe());
        }
        self.source.stop().await;
    }

    pub async fn capture_frame(&self) -> Option<Frame> {
        self.source.capture_frame().await
    }

    pub fn is_active(&self) -> bool {
        self.source.is_active()
    }

    /// 当前采集帧率，未启动时为 None
    pub async fn capture_fps(&self) -> Option<u32> {
        self.source.active_config().await.map(|c| c.fps)
    }

    pub async fn status(&self) -> CameraStatus {
        let config = self.source.active_config().await;
        CameraStatus {
            is_active: self.source.is_active(),
            has_camera: config.is_some(),
            source: self.source.describe(),
            config,
            viewers: self.viewers(),
        }
    }

    /// 登记一个观看者，返回当前观看者数量
    pub fn acquire_viewer(&self) -> usize {
        let count = self.viewers.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Viewer acquired, viewers={}", count);
        count
    }

    /// 注销一个观看者
    ///
    /// 配置了空闲释放时，最后一个观看者离开会停止采集源。
    pub async fn release_viewer(&self) -> usize {
        let previous = self
            .viewers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        let remaining = previous.saturating_sub(1);
        debug!("Viewer released, viewers={}", remaining);

        if remaining == 0 && previous > 0 && self.release_when_idle {
            let _guard = self.lifecycle.lock().await;
            // 持锁后复查，期间可能有新观看者加入
            if self.viewers.load(Ordering::SeqCst) == 0 && self.source.is_active() {
                info!("Last viewer left, releasing camera {}", self.source.describe());
                self.source.stop().await;
            }
        }

        remaining
    }

    pub fn viewers(&self) -> usize {
        self.viewers.load(Ordering::SeqCst)
    }
}
