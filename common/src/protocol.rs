// 实时连接的JSON消息协议
//
// 服务端 -> 客户端：frame / llm_response / error / camera_status
// 客户端 -> 服务端：process_image / chat_message

use crate::error::ProtocolError;
use crate::types::{Frame, InferenceRequest, InferenceResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const KIND_PROCESS_IMAGE: &str = "process_image";
pub const KIND_CHAT_MESSAGE: &str = "chat_message";

/// 服务端下行消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Frame {
        /// Base64 JPEG
        data: String,
        timestamp: f64,
    },
    LlmResponse {
        data: InferenceResult,
    },
    Error {
        message: String,
    },
    CameraStatus {
        is_active: bool,
    },
}

impl ServerMessage {
    pub fn frame(frame: &Frame) -> Self {
        ServerMessage::Frame {
            data: frame.to_base64(),
            timestamp: frame.timestamp,
        }
    }

    pub fn llm_response(result: InferenceResult) -> Self {
        ServerMessage::LlmResponse { data: result }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// 消息类型名（用于日志）
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Frame { .. } => "frame",
            ServerMessage::LlmResponse { .. } => "llm_response",
            ServerMessage::Error { .. } => "error",
            ServerMessage::CameraStatus { .. } => "camera_status",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// 客户端上行命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    ProcessImage {
        image_data: String,
        prompt: Option<String>,
    },
    ChatMessage {
        message: String,
    },
}

#[derive(Deserialize)]
struct ProcessImagePayload {
    image_data: String,
    #[serde(default)]
    prompt: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessagePayload {
    #[serde(alias = "prompt")]
    message: String,
}

impl ClientMessage {
    /// 解析客户端文本消息
    ///
    /// - `Ok(Some(_))`: 已识别的命令
    /// - `Ok(None)`: 未知类型，调用方应忽略
    /// - `Err(_)`: 非JSON、缺少type，或已识别类型但负载无效
    pub fn parse(text: &str) -> Result<Option<Self>, ProtocolError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing \"type\" field".to_string()))?
            .to_string();

        match kind.as_str() {
            KIND_PROCESS_IMAGE => {
                let payload: ProcessImagePayload = serde_json::from_value(value)
                    .map_err(|e| invalid(&kind, e.to_string()))?;
                if payload.image_data.trim().is_empty() {
                    return Err(invalid(&kind, "image_data is empty"));
                }
                let prompt = payload.prompt.filter(|p| !p.trim().is_empty());
                Ok(Some(ClientMessage::ProcessImage {
                    image_data: payload.image_data,
                    prompt,
                }))
            }
            KIND_CHAT_MESSAGE => {
                let payload: ChatMessagePayload = serde_json::from_value(value)
                    .map_err(|e| invalid(&kind, e.to_string()))?;
                if payload.message.trim().is_empty() {
                    return Err(invalid(&kind, "message is empty"));
                }
                Ok(Some(ClientMessage::ChatMessage {
                    message: payload.message,
                }))
            }
            _ => Ok(None),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::ProcessImage { .. } => KIND_PROCESS_IMAGE,
            ClientMessage::ChatMessage { .. } => KIND_CHAT_MESSAGE,
        }
    }

    pub fn into_request(self) -> InferenceRequest {
        match self {
            ClientMessage::ProcessImage { image_data, prompt } => {
                InferenceRequest::image(image_data, prompt)
            }
            ClientMessage::ChatMessage { message } => InferenceRequest::text(message),
        }
    }
}

fn invalid(kind: &str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        reason: reason.into(),
    }
}
