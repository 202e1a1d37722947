use super::connection::Connection;
use common::ServerMessage;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 广播结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// 活跃连接注册表
///
/// 广播时先取快照再并发发送，发送期间不持有任何锁；
/// 失败的连接在发送结束后移除，且只移除一次。
#[derive(Clone, Default)]
pub struct ClientRegistry {
    connections: Arc<DashMap<Uuid, Arc<Connection>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册连接，返回当前连接数
    pub fn add(&self, connection: Arc<Connection>) -> usize {
        let id = connection.id();
        self.connections.insert(id, connection);
        let total = self.connections.len();
        info!(connection_id = %id, "Client registered, total={}", total);
        total
    }

    /// 注销连接，连接不存在时返回 false
    pub fn remove(&self, id: Uuid) -> bool {
        let removed = self.connections.remove(&id).is_some();
        if removed {
            info!(connection_id = %id, "Client removed, total={}", self.connections.len());
        }
        removed
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// 向所有连接广播
    ///
    /// 每个连接的发送受其自身发送超时约束，慢连接不会拖住其他连接。
    pub async fn broadcast(&self, message: &ServerMessage) -> BroadcastReport {
        let members = self.snapshot();
        if members.is_empty() {
            return BroadcastReport::default();
        }

        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize {} broadcast: {}", message.kind(), e);
                return BroadcastReport {
                    delivered: 0,
                    failed: members.len(),
                };
            }
        };

        let results = join_all(members.iter().map(|conn| {
            let text = text.clone();
            async move { (conn.id(), conn.send_text(text).await) }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (id, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    if self.remove(id) {
                        warn!(connection_id = %id, "Dropped client after failed {} broadcast: {}", message.kind(), e);
                    }
                }
            }
        }

        debug!(
            "Broadcast {}: delivered={}, failed={}",
            message.kind(),
            report.delivered,
            report.failed
        );
        report
    }

    /// 关闭并移除所有连接
    pub async fn close_all(&self) {
        let members = self.snapshot();
        join_all(members.iter().map(|conn| conn.shutdown())).await;
        for conn in members {
            self.remove(conn.id());
        }
    }
}
