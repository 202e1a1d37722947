// 合成帧源
//
// 启动时预先渲染并编码全部画面，capture_frame 只做轮转和打时间戳。
// 渲染在持锁之前完成；序号和时间戳基准跨重启保持单调。

use super::encoder::encode_jpeg;
use super::source::FrameSource;
use crate::config::SyntheticPattern;
use async_trait::async_trait;
use bytes::Bytes;
use common::{CaptureConfig, CaptureError, Frame};
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// 纯色画面颜色（RGB）
pub const SOLID_COLOR: [u8; 3] = [200, 150, 100];

/// 彩条相位数
const COLOR_BAR_PHASES: usize = 8;

const COLOR_BARS: [[u8; 3]; 8] = [
    [255, 255, 255],
    [255, 255, 0],
    [0, 255, 255],
    [0, 255, 0],
    [255, 0, 255],
    [255, 0, 0],
    [0, 0, 255],
    [0, 0, 0],
];

struct SyntheticState {
    config: CaptureConfig,
    frames: Vec<Bytes>,
}

pub struct SyntheticFrameSource {
    pattern: SyntheticPattern,
    state: Mutex<Option<SyntheticState>>,
    active: AtomicBool,
    epoch: Instant,
    /// 跨重启保持单调
    next_sequence: Mutex<u64>,
}

impl SyntheticFrameSource {
    pub fn new(pattern: SyntheticPattern) -> Self {
        Self {
            pattern,
            state: Mutex::new(None),
            active: AtomicBool::new(false),
            epoch: Instant::now(),
            next_sequence: Mutex::new(0),
        }
    }

    fn render(pattern: SyntheticPattern, config: &CaptureConfig) -> Result<Vec<Bytes>, CaptureError> {
        match pattern {
            SyntheticPattern::Solid => {
                let image = RgbImage::from_pixel(config.width, config.height, Rgb(SOLID_COLOR));
                Ok(vec![encode_jpeg(&image, config.quality)?])
            }
            SyntheticPattern::ColorBars => (0..COLOR_BAR_PHASES)
                .map(|phase| encode_jpeg(&color_bars(config.width, config.height, phase), config.quality))
                .collect(),
        }
    }
}

/// 彩条图案，每个相位向右平移 1/8 条宽
fn color_bars(width: u32, height: u32, phase: usize) -> RgbImage {
    let bar_width = (width as usize / COLOR_BARS.len()).max(1);
    let shift = phase * bar_width / COLOR_BAR_PHASES;
    RgbImage::from_fn(width, height, |x, _| {
        let index = ((x as usize + shift) / bar_width) % COLOR_BARS.len();
        Rgb(COLOR_BARS[index])
    })
}

#[async_trait]
impl FrameSource for SyntheticFrameSource {
    async fn start(&self, config: CaptureConfig) -> Result<(), CaptureError> {
        config.validate()?;

        let running = self.state.lock().await.as_ref().map(|s| s.config.clone());
        if running.as_ref() == Some(&config) {
            debug!("Synthetic source already running with the same config");
            return Ok(());
        }
        if running.is_some() {
            info!("Restarting synthetic source with new config: {:?}", config);
        }

        // 渲染期间旧画面继续可读
        let pattern = self.pattern;
        let render_config = config.clone();
        let frames = tokio::task::spawn_blocking(move || Self::render(pattern, &render_config))
            .await
            .map_err(|e| CaptureError::DeviceUnavailable(format!("render task failed: {}", e)))??;

        *self.state.lock().await = Some(SyntheticState {
            config: config.clone(),
            frames,
        });
        self.active.store(true, Ordering::SeqCst);

        info!(
            "Synthetic source started: {}x{} @ {}fps, quality={}, pattern={:?}",
            config.width, config.height, config.fps, config.quality, self.pattern
        );
        Ok(())
    }

    async fn stop(&self) {
        let mut state = self.state.lock().await;
        if state.take().is_some() {
            self.active.store(false, Ordering::SeqCst);
            info!("Synthetic source stopped");
        }
    }

    async fn capture_frame(&self) -> Option<Frame> {
        let state = self.state.lock().await;
        let state = state.as_ref()?;

        let mut next = self.next_sequence.lock().await;
        let sequence = *next;
        *next += 1;

        let data = state.frames[sequence as usize % state.frames.len()].clone();
        Some(Frame::new(data, self.epoch.elapsed().as_secs_f64(), sequence))
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn active_config(&self) -> Option<CaptureConfig> {
        self.state.lock().await.as_ref().map(|s| s.config.clone())
    }

    fn describe(&self) -> String {
        match self.pattern {
            SyntheticPattern::Solid => "synthetic:solid".to_string(),
            SyntheticPattern::ColorBars => "synthetic:color_bars".to_string(),
        }
    }
}
