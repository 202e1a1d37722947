// StreamHub 实现
//
// 每个连接一个任务，用 select 同时等待：
// - 连接关闭信号
// - 已完成的推理任务
// - 入站消息
// - 下一帧的截止时间
//
// 推理在连接自己的 JoinSet 中独立运行，不阻塞帧节奏。结果回到循环中
// 由循环写出；拆除时 abort 并排空 JoinSet，因此 Closed 之后不会再有任何
// 推理结果被发送。

use super::pacer::FrameRatePacer;
use super::state::HubState;
use crate::capture::CameraController;
use crate::config::{FrameDelivery, InferenceSettings, PacingMode, StreamSettings};
use crate::inference::InferenceClient;
use crate::registry::{ClientRegistry, Connection};
use common::{ClientMessage, InferenceError, InferenceResult, ServerMessage};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 入站事件（由传输层适配器产生）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Text(String),
    /// 二进制消息，只记录长度
    Binary(usize),
    /// 对端主动关闭
    Close,
}

/// 连接结束时的统计
#[derive(Debug, Clone, Serialize)]
pub struct HubReport {
    pub connection_id: Uuid,
    pub final_state: HubState,
    pub frames_sent: u64,
    pub responses_sent: u64,
    pub errors_sent: u64,
    /// 拆除时被丢弃的推理任务数
    pub discarded_inference: usize,
}

type InferenceOutcome = Result<InferenceResult, InferenceError>;

/// 单个连接的会话状态，只属于该连接的任务
struct HubSession {
    conn: Arc<Connection>,
    state: HubState,
    pacer: FrameRatePacer,
    tasks: JoinSet<InferenceOutcome>,
    last_sequence: Option<u64>,
    frames_sent: u64,
    responses_sent: u64,
    errors_sent: u64,
    discarded_inference: usize,
}

impl HubSession {
    fn new(conn: Arc<Connection>, target_fps: f64) -> Self {
        Self {
            conn,
            state: HubState::Connecting,
            pacer: FrameRatePacer::new(target_fps),
            tasks: JoinSet::new(),
            last_sequence: None,
            frames_sent: 0,
            responses_sent: 0,
            errors_sent: 0,
            discarded_inference: 0,
        }
    }

    fn id(&self) -> Uuid {
        self.conn.id()
    }

    fn transition(&mut self, next: HubState) {
        match self.state.transition(next) {
            Ok(state) => {
                debug!(connection_id = %self.id(), "Hub state {:?} -> {:?}", self.state, state);
                self.state = state;
            }
            Err(e) => warn!(connection_id = %self.id(), "{}", e),
        }
    }

    fn report(&self) -> HubReport {
        HubReport {
            connection_id: self.id(),
            final_state: self.state,
            frames_sent: self.frames_sent,
            responses_sent: self.responses_sent,
            errors_sent: self.errors_sent,
            discarded_inference: self.discarded_inference,
        }
    }
}

/// 实时流转发器
///
/// 可克隆，所有连接共享同一组依赖。
#[derive(Clone)]
pub struct StreamHub {
    camera: Arc<CameraController>,
    inference: Arc<dyn InferenceClient>,
    registry: ClientRegistry,
    stream: StreamSettings,
    inference_settings: InferenceSettings,
}

impl StreamHub {
    pub fn new(
        camera: Arc<CameraController>,
        inference: Arc<dyn InferenceClient>,
        registry: ClientRegistry,
        stream: StreamSettings,
        inference_settings: InferenceSettings,
    ) -> Self {
        Self {
            camera,
            inference,
            registry,
            stream,
            inference_settings,
        }
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// 运行一个连接直到其关闭
    ///
    /// `inbound` 关闭或收到 `InboundEvent::Close` 视为对端断开。
    pub async fn serve(
        &self,
        conn: Arc<Connection>,
        mut inbound: mpsc::Receiver<InboundEvent>,
    ) -> HubReport {
        let mut session = HubSession::new(conn.clone(), self.stream.target_fps);

        if conn.is_closed() {
            warn!(connection_id = %conn.id(), "Transport closed during handshake");
            session.transition(HubState::Closing);
            session.transition(HubState::Closed);
            return session.report();
        }

        self.registry.add(conn.clone());
        self.camera.acquire_viewer();
        session.transition(HubState::Streaming);
        info!(
            connection_id = %conn.id(),
            peer = %conn.peer(),
            "Stream started (pacing={:?}, delivery={:?})",
            self.stream.pacing,
            self.stream.delivery
        );

        self.run(&mut session, &mut inbound).await;
        self.teardown(&mut session).await;

        let report = session.report();
        info!(
            connection_id = %report.connection_id,
            "Stream closed: frames={}, responses={}, errors={}, discarded={}",
            report.frames_sent,
            report.responses_sent,
            report.errors_sent,
            report.discarded_inference
        );
        report
    }

    async fn run(&self, session: &mut HubSession, inbound: &mut mpsc::Receiver<InboundEvent>) {
        let conn = session.conn.clone();

        loop {
            let frame_deadline = self.next_frame_deadline(session).await;

            tokio::select! {
                biased;

                _ = conn.closed() => {
                    debug!(connection_id = %conn.id(), "Connection closed signal received");
                    break;
                }

                Some(joined) = session.tasks.join_next(), if !session.tasks.is_empty() => {
                    if !self.deliver_inference(session, joined).await {
                        break;
                    }
                }

                // 截止时间先于入站消息，持续发送的客户端不能饿死自己的帧节奏
                _ = tokio::time::sleep_until(frame_deadline.unwrap_or_else(Instant::now)),
                    if frame_deadline.is_some() =>
                {
                    if !self.send_next_frame(session).await {
                        break;
                    }
                }

                event = inbound.recv() => match event {
                    Some(InboundEvent::Close) | None => {
                        debug!(connection_id = %conn.id(), "Peer disconnected");
                        break;
                    }
                    Some(event) => {
                        if !self.handle_event(session, event).await {
                            break;
                        }
                    }
                },
            }
        }
    }

    /// 计算本轮的帧截止时间
    ///
    /// broadcast 模式下帧由节奏任务统一发送，返回 None。
    /// 采集源未启动时退化为每 command_poll_timeout 复查一次。
    async fn next_frame_deadline(&self, session: &mut HubSession) -> Option<Instant> {
        if self.stream.delivery == FrameDelivery::Broadcast {
            return None;
        }

        if !self.camera.is_active() {
            session.pacer.reset();
            // 重新启动的采集源可能从新的序号开始
            session.last_sequence = None;
            return Some(Instant::now() + self.stream.command_poll_timeout);
        }

        if self.stream.pacing == PacingMode::Unthrottled {
            if let Some(fps) = self.camera.capture_fps().await {
                if let Err(e) = session.pacer.set_target_fps(fps as f64) {
                    warn!(connection_id = %session.id(), "{}", e);
                }
            }
        }

        Some(session.pacer.deadline())
    }

    async fn send_next_frame(&self, session: &mut HubSession) -> bool {
        if !self.camera.is_active() {
            session.last_sequence = None;
            return true;
        }

        let now = Instant::now();
        if let Some(frame) = self.camera.capture_frame().await {
            // 同一帧不重复发送，保证序号严格递增
            let is_new = session.last_sequence.map_or(true, |last| frame.sequence > last);
            if is_new {
                if let Err(e) = session.conn.send(&ServerMessage::frame(&frame)).await {
                    warn!(connection_id = %session.id(), "Frame send failed: {}", e);
                    return false;
                }
                session.frames_sent += 1;
                session.last_sequence = Some(frame.sequence);
            }
        }

        session.pacer.advance(now);
        true
    }

    async fn handle_event(&self, session: &mut HubSession, event: InboundEvent) -> bool {
        match event {
            InboundEvent::Text(text) => match ClientMessage::parse(&text) {
                Ok(Some(command)) => self.dispatch(session, command).await,
                Ok(None) => {
                    debug!(connection_id = %session.id(), "Ignoring message with unknown type");
                    true
                }
                Err(e) => {
                    debug!(connection_id = %session.id(), "Rejected client message: {}", e);
                    self.send_error(session, e.to_string()).await
                }
            },
            InboundEvent::Binary(len) => {
                debug!(connection_id = %session.id(), "Rejected binary message ({} bytes)", len);
                self.send_error(session, "Binary messages are not supported").await
            }
            InboundEvent::Close => false,
        }
    }

    /// 在连接的 JoinSet 中启动推理，不等待结果
    async fn dispatch(&self, session: &mut HubSession, command: ClientMessage) -> bool {
        if session.tasks.len() >= self.stream.max_inflight_inference {
            warn!(
                connection_id = %session.id(),
                "Rejecting {}: {} inference requests in flight",
                command.kind(),
                session.tasks.len()
            );
            return self
                .send_error(session, "Too many inference requests in flight")
                .await;
        }

        let request = command.into_request();
        let timeout = self.inference_settings.timeout_for(&request);
        let client = self.inference.clone();
        let connection_id = session.id();

        debug!(connection_id = %connection_id, "Dispatching {} inference", request.kind());

        session.tasks.spawn(async move {
            match tokio::time::timeout(timeout, client.infer(request, timeout)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(InferenceError::Timeout(timeout.as_millis() as u64)),
            }
        });
        true
    }

    async fn deliver_inference(
        &self,
        session: &mut HubSession,
        joined: Result<InferenceOutcome, JoinError>,
    ) -> bool {
        let message = match joined {
            Ok(Ok(result)) => ServerMessage::llm_response(result),
            Ok(Err(e)) => {
                warn!(connection_id = %session.id(), "Inference failed: {}", e);
                ServerMessage::error(e.to_string())
            }
            Err(e) if e.is_cancelled() => return true,
            Err(e) => {
                error!(connection_id = %session.id(), "Inference task panicked: {}", e);
                ServerMessage::error("Inference task failed")
            }
        };

        let is_error = matches!(message, ServerMessage::Error { .. });
        match session.conn.send(&message).await {
            Ok(()) => {
                if is_error {
                    session.errors_sent += 1;
                } else {
                    session.responses_sent += 1;
                }
                true
            }
            Err(e) => {
                warn!(connection_id = %session.id(), "Response send failed: {}", e);
                false
            }
        }
    }

    async fn send_error(&self, session: &mut HubSession, message: impl Into<String>) -> bool {
        match session.conn.send(&ServerMessage::error(message)).await {
            Ok(()) => {
                session.errors_sent += 1;
                true
            }
            Err(e) => {
                warn!(connection_id = %session.id(), "Error send failed: {}", e);
                false
            }
        }
    }

    /// 拆除连接，可重复调用
    async fn teardown(&self, session: &mut HubSession) {
        if session.state.is_terminating() {
            return;
        }
        session.transition(HubState::Closing);

        // 先停止一切写入并释放共享资源，最后才关闭传输
        session.conn.mark_closed();

        session.tasks.abort_all();
        // 已完成但未发送的结果同样丢弃
        while session.tasks.join_next().await.is_some() {
            session.discarded_inference += 1;
        }

        self.registry.remove(session.id());
        self.camera.release_viewer().await;

        // 关闭传输受发送超时约束
        session.conn.shutdown().await;

        session.transition(HubState::Closed);
    }
}
