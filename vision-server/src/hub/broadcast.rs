// broadcast 分发模式的帧节奏任务
//
// 每个节拍只采集一次，通过 ClientRegistry 扇出到所有连接。
// 帧由这一个任务顺序发送，每个连接上的帧顺序与采集顺序一致。

use super::pacer::FrameRatePacer;
use crate::capture::CameraController;
use crate::config::{PacingMode, StreamSettings};
use crate::registry::ClientRegistry;
use common::ServerMessage;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 节奏任务结束时的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_broadcast: u64,
    pub deliveries: u64,
    pub failures: u64,
}

pub fn spawn_broadcast_pacer(
    camera: Arc<CameraController>,
    registry: ClientRegistry,
    settings: StreamSettings,
    shutdown: CancellationToken,
) -> JoinHandle<BroadcastStats> {
    tokio::spawn(run_broadcast_pacer(camera, registry, settings, shutdown))
}

async fn run_broadcast_pacer(
    camera: Arc<CameraController>,
    registry: ClientRegistry,
    settings: StreamSettings,
    shutdown: CancellationToken,
) -> BroadcastStats {
    let mut pacer = FrameRatePacer::new(settings.target_fps);
    let mut stats = BroadcastStats::default();
    let mut last_sequence: Option<u64> = None;

    info!("Broadcast pacer started (pacing={:?})", settings.pacing);

    loop {
        let active = camera.is_active();
        let deadline = if active {
            if settings.pacing == PacingMode::Unthrottled {
                if let Some(fps) = camera.capture_fps().await {
                    if let Err(e) = pacer.set_target_fps(fps as f64) {
                        warn!("{}", e);
                    }
                }
            }
            pacer.deadline()
        } else {
            pacer.reset();
            last_sequence = None;
            Instant::now() + settings.command_poll_timeout
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        if !active || !camera.is_active() {
            continue;
        }

        let now = Instant::now();
        if !registry.is_empty() {
            if let Some(frame) = camera.capture_frame().await {
                if last_sequence.map_or(true, |last| frame.sequence > last) {
                    let report = registry.broadcast(&ServerMessage::frame(&frame)).await;
                    last_sequence = Some(frame.sequence);
                    stats.frames_broadcast += 1;
                    stats.deliveries += report.delivered as u64;
                    stats.failures += report.failed as u64;
                    if report.failed > 0 {
                        debug!("Frame {} broadcast: {:?}", frame.sequence, report);
                    }
                }
            }
        }
        pacer.advance(now);
    }

    info!(
        "Broadcast pacer stopped: frames={}, deliveries={}, failures={}",
        stats.frames_broadcast, stats.deliveries, stats.failures
    );
    stats
}
