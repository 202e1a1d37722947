use thiserror::Error;

/// 采集错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Invalid capture config: {0}")]
    InvalidConfig(String),
}

/// 推理错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    #[error("Inference endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Inference timed out after {0}ms")]
    Timeout(u64),
}

/// 连接错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// 客户端消息解析错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
}
