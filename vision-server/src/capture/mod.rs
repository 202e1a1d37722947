// 采集模块
//
// # 核心组件
//
// - `FrameSource`: 统一的帧源抽象接口
// - `SyntheticFrameSource`: 合成画面，无需硬件
// - `DeviceFrameSource`: 独立采集线程 + 单槽缓冲的设备帧源
// - `CameraController`: 采集源生命周期的唯一所有者

pub mod controller;
pub mod device;
pub mod encoder;
pub mod source;
pub mod synthetic;

pub use controller::CameraController;
pub use device::{CaptureDevice, DeviceFrameSource, ImageDirDevice};
pub use encoder::encode_jpeg;
pub use source::FrameSource;
pub use synthetic::SyntheticFrameSource;

use crate::config::{CaptureSettings, CaptureSourceKind};
use std::sync::Arc;

/// 根据配置构造帧源
pub fn build_frame_source(settings: &CaptureSettings) -> Arc<dyn FrameSource> {
    match settings.source {
        CaptureSourceKind::Synthetic => Arc::new(SyntheticFrameSource::new(settings.pattern)),
        CaptureSourceKind::ImageDir => Arc::new(DeviceFrameSource::new(ImageDirDevice::new(
            settings.device_path.clone(),
        ))),
    }
}
