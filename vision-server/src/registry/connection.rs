use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ConnectionError, ServerMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};
use uuid::Uuid;

/// 出站消息传输
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// 发送一条文本消息
    async fn send_text(&self, text: String) -> Result<(), ConnectionError>;

    /// 关闭底层传输，可重复调用
    async fn close(&self);
}

/// 单个实时连接
///
/// 发送失败或超时都会把连接标记为关闭，之后的发送直接返回
/// `ConnectionError::TransportClosed`。
pub struct Connection {
    id: Uuid,
    peer: String,
    connected_at: DateTime<Utc>,
    sink: Box<dyn MessageSink>,
    /// 串行化同一连接上的并发写入
    send_lock: Mutex<()>,
    send_timeout: Duration,
    closed: AtomicBool,
    closed_token: CancellationToken,
}

impl Connection {
    pub fn new(peer: impl Into<String>, sink: Box<dyn MessageSink>, send_timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer: peer.into(),
            connected_at: Utc::now(),
            sink,
            send_lock: Mutex::new(()),
            send_timeout,
            closed: AtomicBool::new(false),
            closed_token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 连接关闭时完成
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed_token.cancelled()
    }

    /// 标记为关闭，仅第一次调用返回 true
    pub fn mark_closed(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.closed_token.cancel();
        debug!(connection_id = %self.id, "Connection marked closed");
        true
    }

    /// 标记关闭并关闭底层传输
    ///
    /// 传输关闭最多等待一个发送超时，对端停止读取时不会挂起调用方。
    pub async fn shutdown(&self) {
        self.mark_closed();
        if tokio::time::timeout(self.send_timeout, self.sink.close())
            .await
            .is_err()
        {
            warn!(
                connection_id = %self.id,
                "Transport close timed out after {}ms",
                self.send_timeout.as_millis()
            );
        }
    }

    pub async fn send(&self, message: &ServerMessage) -> Result<(), ConnectionError> {
        let text = message
            .to_json()
            .map_err(|e| ConnectionError::SendFailed(format!("serialize failed: {}", e)))?;
        self.send_text(text).await
    }

    /// 发送已序列化的消息（广播时只序列化一次）
    pub async fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::TransportClosed);
        }

        let _guard = self.send_lock.lock().await;
        if self.is_closed() {
            return Err(ConnectionError::TransportClosed);
        }

        let result = tokio::select! {
            biased;
            _ = self.closed_token.cancelled() => Err(ConnectionError::TransportClosed),
            sent = tokio::time::timeout(self.send_timeout, self.sink.send_text(text)) => match sent {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::SendFailed(format!(
                    "send timed out after {}ms",
                    self.send_timeout.as_millis()
                ))),
            },
        };

        if let Err(e) = &result {
            if self.mark_closed() {
                warn!(connection_id = %self.id, "Send failed, closing connection: {}", e);
            }
        }

        result
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
