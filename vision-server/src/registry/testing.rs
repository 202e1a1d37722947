// 测试用的出站传输桩

use super::connection::MessageSink;
use async_trait::async_trait;
use common::{ConnectionError, ServerMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// 记录所有发出的消息
#[derive(Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
    /// 每次发送前的等待，模拟较慢的链路
    delay: Duration,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub async fn messages(&self) -> Vec<ServerMessage> {
        self.sent
            .lock()
            .await
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }

    pub async fn count_of(&self, kind: &str) -> usize {
        self.messages()
            .await
            .iter()
            .filter(|m| m.kind() == kind)
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::TransportClosed);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.sent.lock().await.push(text);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// 每次发送都失败
pub struct FailingSink;

#[async_trait]
impl MessageSink for FailingSink {
    async fn send_text(&self, _text: String) -> Result<(), ConnectionError> {
        Err(ConnectionError::SendFailed("peer reset".to_string()))
    }

    async fn close(&self) {}
}

/// 发送永远不完成，模拟阻塞的对端
pub struct BlockedSink;

#[async_trait]
impl MessageSink for BlockedSink {
    async fn send_text(&self, _text: String) -> Result<(), ConnectionError> {
        std::future::pending().await
    }

    async fn close(&self) {}
}

/// 发送和关闭都永远不完成，模拟停止读取的对端
pub struct StuckSink;

#[async_trait]
impl MessageSink for StuckSink {
    async fn send_text(&self, _text: String) -> Result<(), ConnectionError> {
        std::future::pending().await
    }

    async fn close(&self) {
        std::future::pending::<()>().await
    }
}
