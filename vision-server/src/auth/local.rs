use super::password::{hash_password, verify_password};
use super::{
    AuthError, AuthProvider, Credentials, Identity, Registration, TokenPair, UserProfile,
};
use crate::config::AuthSettings;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Access,
    Refresh,
}

struct UserRecord {
    profile: UserProfile,
    password_hash: String,
}

struct Session {
    identity: Identity,
    kind: TokenKind,
    expires_at: DateTime<Utc>,
}

/// 内存认证服务
///
/// 用户和会话都保存在 DashMap 中，令牌为随机不透明字符串。
pub struct LocalAuthService {
    users: DashMap<String, UserRecord>,
    sessions: DashMap<String, Session>,
    next_id: AtomicU64,
    settings: AuthSettings,
}

impl LocalAuthService {
    pub fn new(settings: AuthSettings) -> Self {
        let service = Self {
            users: DashMap::new(),
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            settings,
        };

        if let Some(default_user) = service.settings.default_user.clone() {
            let registration = Registration {
                email: default_user
                    .email
                    .unwrap_or_else(|| format!("{}@localhost", default_user.username)),
                username: default_user.username,
                password: default_user.password,
            };
            match service.register(registration) {
                Ok(profile) => info!("Default user '{}' created", profile.username),
                Err(e) => warn!("Failed to create default user: {}", e),
            }
        }

        service
    }

    pub fn register(&self, registration: Registration) -> Result<UserProfile, AuthError> {
        let username = registration.username.trim().to_string();
        let email = registration.email.trim().to_lowercase();

        if username.len() < 3 || username.len() > 50 {
            return Err(AuthError::InvalidRegistration(
                "username must be 3-50 characters".to_string(),
            ));
        }
        if !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
            return Err(AuthError::InvalidRegistration("invalid email address".to_string()));
        }
        if registration.password.len() < 6 {
            return Err(AuthError::InvalidRegistration(
                "password must be at least 6 characters".to_string(),
            ));
        }
        if self.users.iter().any(|entry| entry.profile.email == email) {
            return Err(AuthError::EmailTaken);
        }
        if self.users.contains_key(&username) {
            return Err(AuthError::UsernameTaken);
        }

        // 哈希在持有分片锁之前完成
        let password_hash = hash_password(&registration.password, self.settings.hash_cost)?;

        match self.users.entry(username.clone()) {
            Entry::Occupied(_) => Err(AuthError::UsernameTaken),
            Entry::Vacant(vacant) => {
                let profile = UserProfile {
                    id: self.next_id.fetch_add(1, Ordering::SeqCst),
                    username,
                    email,
                    is_active: true,
                    is_verified: false,
                    created_at: Utc::now(),
                    last_login: None,
                };
                vacant.insert(UserRecord {
                    profile: profile.clone(),
                    password_hash,
                });
                info!("User registered: {} (id={})", profile.username, profile.id);
                Ok(profile)
            }
        }
    }

    pub fn login(&self, credentials: &Credentials) -> Result<TokenPair, AuthError> {
        let identity = {
            let mut record = self
                .users
                .get_mut(&credentials.username)
                .ok_or(AuthError::InvalidCredentials)?;

            if !verify_password(&credentials.password, &record.password_hash) {
                debug!("Login failed for {}", credentials.username);
                return Err(AuthError::InvalidCredentials);
            }
            if !record.profile.is_active {
                return Err(AuthError::InactiveUser);
            }

            record.profile.last_login = Some(Utc::now());
            Identity {
                user_id: record.profile.id,
                username: record.profile.username.clone(),
            }
        };

        info!("User logged in: {}", identity.username);
        Ok(self.issue_tokens(identity))
    }

    /// 用刷新令牌换取新的令牌对，旧刷新令牌作废
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let (_, session) = self
            .sessions
            .remove(refresh_token)
            .ok_or(AuthError::InvalidToken)?;

        if session.kind != TokenKind::Refresh {
            // 访问令牌不能用于刷新，放回原处
            self.sessions.insert(refresh_token.to_string(), session);
            return Err(AuthError::InvalidToken);
        }
        if Utc::now() >= session.expires_at {
            return Err(AuthError::TokenExpired);
        }

        Ok(self.issue_tokens(session.identity))
    }

    pub fn logout(&self, token: &str) -> bool {
        self.sessions.remove(token).is_some()
    }

    pub fn profile(&self, identity: &Identity) -> Result<UserProfile, AuthError> {
        let record = self
            .users
            .get(&identity.username)
            .ok_or(AuthError::InvalidToken)?;
        if !record.profile.is_active {
            return Err(AuthError::InactiveUser);
        }
        Ok(record.profile.clone())
    }

    /// 清理过期会话，返回清理数量
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.expires_at > now);
        let purged = before.saturating_sub(self.sessions.len());
        if purged > 0 {
            debug!("Purged {} expired sessions", purged);
        }
        purged
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    fn issue_tokens(&self, identity: Identity) -> TokenPair {
        let now = Utc::now();
        let access_ttl = Duration::minutes(self.settings.access_token_ttl_minutes);
        let refresh_ttl = Duration::days(self.settings.refresh_token_ttl_days);

        let access_token = new_token();
        let refresh_token = new_token();

        self.sessions.insert(
            access_token.clone(),
            Session {
                identity: identity.clone(),
                kind: TokenKind::Access,
                expires_at: now + access_ttl,
            },
        );
        self.sessions.insert(
            refresh_token.clone(),
            Session {
                identity,
                kind: TokenKind::Refresh,
                expires_at: now + refresh_ttl,
            },
        );

        TokenPair {
            access_token,
            refresh_token,
            token_type: "bearer".to_string(),
            expires_in: access_ttl.num_seconds(),
        }
    }
}

fn new_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

#[async_trait]
impl AuthProvider for LocalAuthService {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let session = self.sessions.get(token).ok_or(AuthError::InvalidToken)?;
        if session.kind != TokenKind::Access {
            return Err(AuthError::InvalidToken);
        }
        if Utc::now() >= session.expires_at {
            return Err(AuthError::TokenExpired);
        }
        Ok(session.identity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultUser;

    fn settings() -> AuthSettings {
        AuthSettings {
            hash_cost: 4,
            ..AuthSettings::default()
        }
    }

    fn registration(username: &str, email: &str) -> Registration {
        Registration {
            username: username.to_string(),
            email: email.to_string(),
            password: "secret123".to_string(),
        }
    }

    fn credentials(username: &str, password: &str) -> Credentials {
        Credentials {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_login_verify() {
        let auth = LocalAuthService::new(settings());
        let profile = auth.register(registration("alice", "alice@example.com")).unwrap();
        assert_eq!(profile.username, "alice");
        assert!(profile.last_login.is_none());

        let tokens = auth.login(&credentials("alice", "secret123")).unwrap();
        assert_eq!(tokens.token_type, "bearer");
        assert_eq!(tokens.expires_in, 30 * 60);

        let identity = auth.verify(&tokens.access_token).await.unwrap();
        assert_eq!(identity.username, "alice");
        assert!(auth.profile(&identity).unwrap().last_login.is_some());

        // 刷新令牌不能当作访问令牌
        assert_eq!(
            auth.verify(&tokens.refresh_token).await,
            Err(AuthError::InvalidToken)
        );
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let auth = LocalAuthService::new(settings());
        auth.register(registration("alice", "alice@example.com")).unwrap();

        assert_eq!(
            auth.register(registration("alice", "other@example.com")),
            Err(AuthError::UsernameTaken)
        );
        assert_eq!(
            auth.register(registration("bob", "ALICE@example.com")),
            Err(AuthError::EmailTaken)
        );
        assert!(matches!(
            auth.register(registration("x", "x@example.com")),
            Err(AuthError::InvalidRegistration(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_password_and_unknown_user() {
        let auth = LocalAuthService::new(settings());
        auth.register(registration("alice", "alice@example.com")).unwrap();

        assert_eq!(
            auth.login(&credentials("alice", "wrong")).unwrap_err(),
            AuthError::InvalidCredentials
        );
        assert_eq!(
            auth.login(&credentials("nobody", "secret123")).unwrap_err(),
            AuthError::InvalidCredentials
        );
        assert_eq!(auth.verify("garbage").await, Err(AuthError::InvalidToken));
    }

    #[tokio::test]
    async fn test_expired_access_token() {
        let auth = LocalAuthService::new(AuthSettings {
            access_token_ttl_minutes: 0,
            ..settings()
        });
        auth.register(registration("alice", "alice@example.com")).unwrap();
        let tokens = auth.login(&credentials("alice", "secret123")).unwrap();

        assert_eq!(
            auth.verify(&tokens.access_token).await,
            Err(AuthError::TokenExpired)
        );
        assert_eq!(auth.purge_expired(), 1);
    }

    #[tokio::test]
    async fn test_refresh_rotates_tokens() {
        let auth = LocalAuthService::new(settings());
        auth.register(registration("alice", "alice@example.com")).unwrap();
        let tokens = auth.login(&credentials("alice", "secret123")).unwrap();

        assert_eq!(
            auth.refresh(&tokens.access_token).unwrap_err(),
            AuthError::InvalidToken
        );
        // 访问令牌仍然有效
        assert!(auth.verify(&tokens.access_token).await.is_ok());

        let rotated = auth.refresh(&tokens.refresh_token).unwrap();
        assert!(auth.verify(&rotated.access_token).await.is_ok());
        assert_eq!(
            auth.refresh(&tokens.refresh_token).unwrap_err(),
            AuthError::InvalidToken
        );

        assert!(auth.logout(&rotated.access_token));
        assert_eq!(
            auth.verify(&rotated.access_token).await,
            Err(AuthError::InvalidToken)
        );
    }

    #[tokio::test]
    async fn test_default_user_created() {
        let auth = LocalAuthService::new(AuthSettings {
            default_user: Some(DefaultUser {
                username: "admin".to_string(),
                password: "admin123".to_string(),
                email: None,
            }),
            ..settings()
        });

        assert_eq!(auth.user_count(), 1);
        assert!(auth.login(&credentials("admin", "admin123")).is_ok());
    }
}
