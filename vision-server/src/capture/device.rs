// 设备帧源
//
// 阻塞的 CaptureDevice 运行在独立采集线程上，最新一帧写入单槽缓冲
// (watch channel)。读取方永远只拿到最新帧，慢速读取方直接跳帧。
//
// 帧序号和时间戳基准属于帧源本身，重启设备后继续递增。
// 读取路径只经过一个短临界区的 RwLock，不会被启停过程中的线程
// join 或设备打开阻塞。

use super::encoder::encode_jpeg;
use super::source::FrameSource;
use async_trait::async_trait;
use common::{CaptureConfig, CaptureError, Frame};
use image::imageops::FilterType;
use image::RgbImage;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// 连续读取失败达到该次数后记一次错误日志
const READ_FAILURE_LOG_THRESHOLD: u32 = 30;

/// 阻塞式采集设备
///
/// 所有方法都在采集线程（或 blocking 线程池）上调用。
pub trait CaptureDevice: Send + 'static {
    fn open(&mut self, config: &CaptureConfig) -> Result<(), CaptureError>;

    /// 读取一帧原始RGB图像，尺寸应与 open 时的配置一致
    fn read_frame(&mut self) -> Result<RgbImage, CaptureError>;

    fn close(&mut self);

    fn name(&self) -> String;
}

struct CaptureWorker<D> {
    stop: Arc<AtomicBool>,
    /// 线程退出时归还设备
    handle: JoinHandle<D>,
}

/// 对读取方可见的运行中采集
struct Published {
    config: CaptureConfig,
    frames: watch::Receiver<Option<Frame>>,
}

/// 采集线程与帧源共享的时钟
#[derive(Clone)]
struct CaptureClock {
    epoch: Instant,
    sequence: Arc<AtomicU64>,
}

struct DeviceState<D> {
    /// 空闲时持有设备；运行时设备在采集线程内
    device: Option<D>,
    worker: Option<CaptureWorker<D>>,
}

pub struct DeviceFrameSource<D: CaptureDevice> {
    name: String,
    /// 启停串行化，可能跨越线程 join 和设备打开
    state: Mutex<DeviceState<D>>,
    published: RwLock<Option<Published>>,
    clock: CaptureClock,
    active: AtomicBool,
}

impl<D: CaptureDevice> DeviceFrameSource<D> {
    pub fn new(device: D) -> Self {
        Self {
            name: device.name(),
            state: Mutex::new(DeviceState {
                device: Some(device),
                worker: None,
            }),
            published: RwLock::new(None),
            clock: CaptureClock {
                epoch: Instant::now(),
                sequence: Arc::new(AtomicU64::new(0)),
            },
            active: AtomicBool::new(false),
        }
    }

    fn read_published(&self) -> RwLockReadGuard<'_, Option<Published>> {
        self.published.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_published(&self) -> RwLockWriteGuard<'_, Option<Published>> {
        self.published.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 撤下当前采集，之后的读取立即返回 None
    fn unpublish(&self) {
        *self.write_published() = None;
        self.active.store(false, Ordering::SeqCst);
    }

    /// 停止采集线程并取回设备
    async fn shutdown_worker(state: &mut DeviceState<D>) {
        let Some(worker) = state.worker.take() else {
            return;
        };

        worker.stop.store(true, Ordering::SeqCst);
        match tokio::task::spawn_blocking(move || worker.handle.join()).await {
            Ok(Ok(device)) => state.device = Some(device),
            Ok(Err(_)) => error!("Capture thread panicked, device is lost"),
            Err(e) => error!("Failed to join capture thread: {}", e),
        }
    }
}

fn capture_loop<D: CaptureDevice>(
    mut device: D,
    config: CaptureConfig,
    clock: CaptureClock,
    stop: Arc<AtomicBool>,
    slot: watch::Sender<Option<Frame>>,
) -> D {
    let interval = Duration::from_secs_f64(config.frame_interval_secs());
    let mut failures = 0u32;

    debug!("Capture thread started for {}", device.name());

    while !stop.load(Ordering::SeqCst) {
        let tick = Instant::now();

        match device.read_frame().and_then(|image| {
            let image = if image.dimensions() != (config.width, config.height) {
                image::imageops::resize(&image, config.width, config.height, FilterType::Triangle)
            } else {
                image
            };
            encode_jpeg(&image, config.quality)
        }) {
            Ok(data) => {
                failures = 0;
                let sequence = clock.sequence.fetch_add(1, Ordering::SeqCst);
                let frame = Frame::new(data, clock.epoch.elapsed().as_secs_f64(), sequence);
                // 覆盖旧帧，读取方只看到最新一帧
                slot.send_replace(Some(frame));
            }
            Err(e) => {
                failures += 1;
                if failures == READ_FAILURE_LOG_THRESHOLD {
                    error!("Capture device {} failed {} times in a row: {}", device.name(), failures, e);
                } else {
                    debug!("Capture read failed: {}", e);
                }
            }
        }

        let elapsed = tick.elapsed();
        if elapsed < interval {
            std::thread::sleep(interval - elapsed);
        }
    }

    device.close();
    debug!("Capture thread exiting for {}", device.name());
    device
}

#[async_trait]
impl<D: CaptureDevice> FrameSource for DeviceFrameSource<D> {
    async fn start(&self, config: CaptureConfig) -> Result<(), CaptureError> {
        config.validate()?;

        let mut state = self.state.lock().await;
        if state.worker.is_some() {
            let running = self.read_published().as_ref().map(|p| p.config.clone());
            if running.as_ref() == Some(&config) {
                debug!("Device source {} already running with the same config", self.name);
                return Ok(());
            }
            info!("Restarting device source {} with new config: {:?}", self.name, config);
            self.unpublish();
            Self::shutdown_worker(&mut state).await;
        }

        let mut device = state
            .device
            .take()
            .ok_or_else(|| CaptureError::DeviceUnavailable(format!("{} is not available", self.name)))?;

        let open_config = config.clone();
        let (device, opened) = tokio::task::spawn_blocking(move || {
            let result = device.open(&open_config);
            (device, result)
        })
        .await
        .map_err(|e| CaptureError::DeviceUnavailable(format!("open task failed: {}", e)))?;

        if let Err(e) = opened {
            warn!("Failed to open capture device {}: {}", self.name, e);
            state.device = Some(device);
            return Err(e);
        }

        let (tx, rx) = watch::channel(None);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread_config = config.clone();
        let clock = self.clock.clone();
        let handle = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || capture_loop(device, thread_config, clock, thread_stop, tx))
            .map_err(|e| CaptureError::DeviceUnavailable(format!("failed to spawn capture thread: {}", e)))?;

        state.worker = Some(CaptureWorker { stop, handle });
        *self.write_published() = Some(Published {
            config: config.clone(),
            frames: rx,
        });
        self.active.store(true, Ordering::SeqCst);

        info!(
            "Device source {} started: {}x{} @ {}fps, quality={}",
            self.name, config.width, config.height, config.fps, config.quality
        );
        Ok(())
    }

    async fn stop(&self) {
        let mut state = self.state.lock().await;
        if state.worker.is_none() {
            return;
        }
        self.unpublish();
        Self::shutdown_worker(&mut state).await;
        info!("Device source {} stopped", self.name);
    }

    async fn capture_frame(&self) -> Option<Frame> {
        let published = self.read_published();
        let frame = published.as_ref()?.frames.borrow().clone();
        frame
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn active_config(&self) -> Option<CaptureConfig> {
        self.read_published().as_ref().map(|p| p.config.clone())
    }

    fn describe(&self) -> String {
        format!("device:{}", self.name)
    }
}

/// 目录回放设备
///
/// 循环读取目录下的 jpg/jpeg/png 图像，代替硬件驱动。
pub struct ImageDirDevice {
    root: PathBuf,
    files: Vec<PathBuf>,
    cache: Vec<Option<RgbImage>>,
    position: usize,
    size: (u32, u32),
}

impl ImageDirDevice {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            files: Vec::new(),
            cache: Vec::new(),
            position: 0,
            size: (0, 0),
        }
    }

    fn scan(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.root)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .map(|ext| {
                        let ext = ext.to_string_lossy().to_lowercase();
                        ext == "jpg" || ext == "jpeg" || ext == "png"
                    })
                    .unwrap_or(false)
            })
            .map(|entry| entry.into_path())
            .collect();
        files.sort();
        files
    }
}

impl CaptureDevice for ImageDirDevice {
    fn open(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        if !self.root.is_dir() {
            return Err(CaptureError::DeviceUnavailable(format!(
                "image directory {:?} does not exist",
                self.root
            )));
        }

        let files = self.scan();
        if files.is_empty() {
            return Err(CaptureError::DeviceUnavailable(format!(
                "no images found in {:?}",
                self.root
            )));
        }

        info!("Image directory device opened: {} images in {:?}", files.len(), self.root);
        self.cache = vec![None; files.len()];
        self.files = files;
        self.position = 0;
        self.size = (config.width, config.height);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
        if self.files.is_empty() {
            return Err(CaptureError::DeviceUnavailable("device is not open".to_string()));
        }

        let index = self.position % self.files.len();
        self.position = self.position.wrapping_add(1);

        if let Some(image) = &self.cache[index] {
            return Ok(image.clone());
        }

        let path = &self.files[index];
        let image = image::open(path)
            .map_err(|e| CaptureError::DeviceUnavailable(format!("failed to read {:?}: {}", path, e)))?
            .to_rgb8();
        let (width, height) = self.size;
        let image = if image.dimensions() != (width, height) {
            image::imageops::resize(&image, width, height, FilterType::Triangle)
        } else {
            image
        };

        self.cache[index] = Some(image.clone());
        Ok(image)
    }

    fn close(&mut self) {
        self.files.clear();
        self.cache.clear();
    }

    fn name(&self) -> String {
        format!("image_dir:{}", self.root.display())
    }
}
