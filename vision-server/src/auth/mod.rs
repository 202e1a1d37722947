// 认证模块
//
// - `AuthProvider`: 令牌校验接口，HTTP 层和 WebSocket 握手只依赖它
// - `LocalAuthService`: 内存用户表 + 不透明令牌

pub mod local;
pub mod password;

pub use local::LocalAuthService;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Incorrect username or password")]
    InvalidCredentials,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Username already registered")]
    UsernameTaken,

    #[error("Email already registered")]
    EmailTaken,

    #[error("Inactive user")]
    InactiveUser,

    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("Password hashing failed: {0}")]
    Hashing(String),
}

/// 已认证的身份
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub user_id: u64,
    pub username: String,
}

/// 对外展示的用户信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserProfile {
    pub id: u64,
    pub username: String,
    pub email: String,
    pub is_active: bool,
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// 登录签发的令牌
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// 访问令牌有效期（秒）
    pub expires_in: i64,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// 校验访问令牌
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}
