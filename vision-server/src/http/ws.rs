// WebSocket 适配层
//
// 把 axum 的 WebSocket 拆成两半：写半部包装为 MessageSink 交给 Connection，
// 读半部由一个读取任务转换为 InboundEvent 送入 StreamHub。

use super::handlers::ApiError;
use super::state::AppState;
use crate::auth::{AuthProvider, Identity};
use crate::hub::InboundEvent;
use crate::registry::{Connection, MessageSink};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use common::ConnectionError;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

const INBOUND_BUFFER: usize = 32;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    token: Option<String>,
}

struct WsSink {
    sender: Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        self.sender
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| ConnectionError::SendFailed(e.to_string()))
    }

    async fn close(&self) {
        let _ = self.sender.lock().await.close().await;
    }
}

/// 握手前的令牌检查
///
/// 未开启 `require_token_for_stream` 时直接放行。
pub(crate) async fn authorize_stream(
    state: &AppState,
    token: Option<&str>,
) -> Result<Option<Identity>, ConnectionError> {
    if !state.config.auth.require_token_for_stream {
        return Ok(None);
    }

    let token = token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ConnectionError::HandshakeFailed("missing access token".to_string()))?;

    state
        .auth
        .verify(token)
        .await
        .map(Some)
        .map_err(|e| ConnectionError::HandshakeFailed(e.to_string()))
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<StreamQuery>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(state): State<AppState>,
) -> Response {
    let peer = connect_info
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    match authorize_stream(&state, query.token.as_deref()).await {
        Ok(identity) => {
            if let Some(identity) = identity {
                debug!("Stream handshake authorized for {} ({})", identity.username, peer);
            }
            ws.on_upgrade(move |socket| handle_socket(socket, state, peer))
        }
        Err(e) => {
            warn!("Rejected stream handshake from {}: {}", peer, e);
            ApiError::new(StatusCode::UNAUTHORIZED, e.to_string()).into_response()
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, peer: String) {
    let (sender, mut receiver) = socket.split();
    let sink = WsSink {
        sender: Mutex::new(sender),
    };
    let conn = Arc::new(Connection::new(
        peer,
        Box::new(sink),
        state.config.stream.send_timeout,
    ));
    let connection_id = conn.id();

    let (tx, rx) = mpsc::channel(INBOUND_BUFFER);

    // 读取任务：只做协议帧到事件的转换
    let reader = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            let event = match message {
                Ok(Message::Text(text)) => InboundEvent::Text(text),
                Ok(Message::Binary(data)) => InboundEvent::Binary(data.len()),
                Ok(Message::Close(_)) => InboundEvent::Close,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Err(e) => {
                    debug!(connection_id = %connection_id, "WebSocket read error: {}", e);
                    break;
                }
            };

            let is_close = event == InboundEvent::Close;
            if tx.send(event).await.is_err() || is_close {
                break;
            }
        }
    });

    let report = state.hub.serve(conn, rx).await;
    reader.abort();

    info!(
        connection_id = %report.connection_id,
        "WebSocket session finished in state {:?}",
        report.final_state
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credentials, Registration};
    use crate::config::Config;
    use crate::hub::testing::{StaticFrameSource, StubInference};
    use std::time::Duration;

    fn state_with(require_token: bool) -> AppState {
        let mut config = Config::default();
        config.auth.hash_cost = 4;
        config.auth.require_token_for_stream = require_token;
        AppState::with_parts(
            config,
            Arc::new(StaticFrameSource::default()),
            Arc::new(StubInference::new(Duration::ZERO)),
        )
    }

    #[tokio::test]
    async fn test_stream_open_when_token_not_required() {
        let state = state_with(false);
        assert_eq!(authorize_stream(&state, None).await, Ok(None));
    }

    #[tokio::test]
    async fn test_stream_requires_valid_token() {
        let state = state_with(true);

        assert!(matches!(
            authorize_stream(&state, None).await,
            Err(ConnectionError::HandshakeFailed(_))
        ));
        assert!(matches!(
            authorize_stream(&state, Some("bogus")).await,
            Err(ConnectionError::HandshakeFailed(_))
        ));

        state
            .auth
            .register(Registration {
                username: "viewer".to_string(),
                email: "viewer@example.com".to_string(),
                password: "secret123".to_string(),
            })
            .unwrap();
        let tokens = state
            .auth
            .login(&Credentials {
                username: "viewer".to_string(),
                password: "secret123".to_string(),
            })
            .unwrap();

        let identity = authorize_stream(&state, Some(&tokens.access_token))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(identity.username, "viewer");
    }
}
