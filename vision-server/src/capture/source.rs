// FrameSource Trait定义

use async_trait::async_trait;
use common::{CaptureConfig, CaptureError, Frame};

/// 统一的帧源抽象接口
///
/// 所有方法都只需要 `&self`，同一个帧源可以被多个连接并发读取。
///
/// # 实现
///
/// - `SyntheticFrameSource`: 合成画面
/// - `DeviceFrameSource`: 阻塞设备 + 独立采集线程
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// 启动采集
    ///
    /// 已使用相同配置启动时直接返回 Ok；配置不同则干净地重启。
    ///
    /// # 错误
    ///
    /// - `CaptureError::InvalidConfig`: 参数超出范围
    /// - `CaptureError::DeviceUnavailable`: 设备无法打开
    async fn start(&self, config: CaptureConfig) -> Result<(), CaptureError>;

    /// 停止采集，未启动时为空操作
    async fn stop(&self);

    /// 获取最新一帧
    ///
    /// 只等待锁，不等待设备。未启动或尚无可用帧时返回 `None`。
    async fn capture_frame(&self) -> Option<Frame>;

    fn is_active(&self) -> bool;

    /// 当前生效的配置
    async fn active_config(&self) -> Option<CaptureConfig>;

    /// 帧源描述（用于状态接口和日志）
    fn describe(&self) -> String;
}
