// 帧率控制器实现
//
// 使用绝对截止时间调度：第 n 帧的发送时间为 anchor + n * interval，
// 单帧的抖动不会累积。落后超过一个周期时重新锚定，而不是连续补发。

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 帧率上限
const MAX_TARGET_FPS: f64 = 120.0;

/// 帧率控制器
pub struct FrameRatePacer {
    /// 目标帧率（帧/秒）
    target_fps: f64,
    /// 帧间隔
    frame_interval: Duration,
    /// 下一帧的截止时间，None 表示下一帧立即发送
    next_deadline: Option<Instant>,
    /// 重新锚定次数
    reanchors: u64,
}

impl FrameRatePacer {
    /// 创建新的帧率控制器
    ///
    /// # 示例
    ///
    /// ```
    /// use vision_server::hub::FrameRatePacer;
    ///
    /// let pacer = FrameRatePacer::new(15.0);
    /// assert_eq!(pacer.frame_interval().as_micros(), 66_666);
    /// ```
    pub fn new(target_fps: f64) -> Self {
        let target_fps = if target_fps > 0.0 {
            target_fps.min(MAX_TARGET_FPS)
        } else {
            15.0 // 默认15fps
        };
        let frame_interval = Duration::from_micros((1_000_000.0 / target_fps) as u64);

        info!(
            "Creating FrameRatePacer: target_fps={:.2}, interval={}us",
            target_fps,
            frame_interval.as_micros()
        );

        Self {
            target_fps,
            frame_interval,
            next_deadline: None,
            reanchors: 0,
        }
    }

    pub fn target_fps(&self) -> f64 {
        self.target_fps
    }

    pub fn frame_interval(&self) -> Duration {
        self.frame_interval
    }

    pub fn reanchors(&self) -> u64 {
        self.reanchors
    }

    /// 修改目标帧率，下一帧按新间隔调度
    pub fn set_target_fps(&mut self, fps: f64) -> Result<(), String> {
        if !(fps > 0.0 && fps <= MAX_TARGET_FPS) {
            return Err(format!(
                "Invalid target fps: {:.2} (must be in (0, {}])",
                fps, MAX_TARGET_FPS
            ));
        }
        if (fps - self.target_fps).abs() < f64::EPSILON {
            return Ok(());
        }

        info!("Setting target fps: {:.2} -> {:.2}", self.target_fps, fps);
        self.target_fps = fps;
        self.frame_interval = Duration::from_micros((1_000_000.0 / fps) as u64);
        Ok(())
    }

    /// 下一帧的截止时间
    pub fn deadline(&self) -> Instant {
        self.next_deadline.unwrap_or_else(Instant::now)
    }

    /// 记录一帧已在 `now` 发出，推进调度
    pub fn advance(&mut self, now: Instant) {
        let scheduled = self.next_deadline.unwrap_or(now);
        let next = scheduled + self.frame_interval;

        if now > next {
            // 落后超过一个周期，从当前时间重新开始
            let late = now - scheduled;
            self.reanchors += 1;
            warn!(
                "Frame pacing is late by {:.3}ms, re-anchoring schedule",
                late.as_secs_f64() * 1000.0
            );
            self.next_deadline = Some(now + self.frame_interval);
        } else {
            self.next_deadline = Some(next);
        }
    }

    /// 清除调度，下一帧立即发送
    pub fn reset(&mut self) {
        if self.next_deadline.take().is_some() {
            debug!("Frame pacer reset");
        }
    }

    /// 等待直到可以发送下一帧，并推进调度
    pub async fn wait_for_next_frame(&mut self) {
        let deadline = self.deadline();
        tokio::time::sleep_until(deadline).await;
        self.advance(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacer_creation() {
        let pacer = FrameRatePacer::new(30.0);
        assert_eq!(pacer.target_fps(), 30.0);
        assert_eq!(pacer.frame_interval(), Duration::from_micros(33_333));
    }

    #[test]
    fn test_invalid_fps_falls_back() {
        assert_eq!(FrameRatePacer::new(0.0).target_fps(), 15.0);
        assert_eq!(FrameRatePacer::new(-3.0).target_fps(), 15.0);
        assert_eq!(FrameRatePacer::new(500.0).target_fps(), 120.0);
    }

    #[test]
    fn test_set_target_fps() {
        let mut pacer = FrameRatePacer::new(15.0);
        assert!(pacer.set_target_fps(30.0).is_ok());
        assert_eq!(pacer.frame_interval(), Duration::from_micros(33_333));
        assert!(pacer.set_target_fps(0.0).is_err());
        assert!(pacer.set_target_fps(121.0).is_err());
        assert_eq!(pacer.target_fps(), 30.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absolute_schedule_does_not_drift() {
        let mut pacer = FrameRatePacer::new(10.0);
        let start = Instant::now();

        pacer.advance(start);
        // 稍晚发送不影响后续截止时间
        pacer.advance(start + Duration::from_millis(130));
        assert_eq!(pacer.deadline(), start + Duration::from_millis(200));
        assert_eq!(pacer.reanchors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reanchors_when_far_behind() {
        let mut pacer = FrameRatePacer::new(10.0);
        let start = Instant::now();

        pacer.advance(start);
        let late = start + Duration::from_millis(450);
        pacer.advance(late);

        assert_eq!(pacer.reanchors(), 1);
        assert_eq!(pacer.deadline(), late + Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_next_frame_cadence() {
        let mut pacer = FrameRatePacer::new(20.0);
        let start = Instant::now();

        for _ in 0..21 {
            pacer.wait_for_next_frame().await;
        }

        // 第一帧立即发送，之后每帧 50ms
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1000));
        assert!(elapsed < Duration::from_millis(1010));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_sends_next_frame_immediately() {
        let mut pacer = FrameRatePacer::new(1.0);
        pacer.wait_for_next_frame().await;
        pacer.reset();

        let before = Instant::now();
        pacer.wait_for_next_frame().await;
        assert!(before.elapsed() < Duration::from_millis(2));
    }
}
