//! 管理员会话：不透明 Bearer 令牌的创建、校验、过期与注销。

use rand::RngCore;
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const TOKEN_BYTES: usize = 32;

#[derive(Clone, Debug)]
pub struct Session {
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl Session {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// 进程内会话表，重启即失效。
#[derive(Debug)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 创建新会话并返回 64 位十六进制令牌。
    pub async fn create(&self) -> String {
        let token = generate_token();
        let now = Instant::now();
        let session = Session {
            created_at: now,
            expires_at: now + self.ttl,
        };
        self.sessions.lock().await.insert(token.clone(), session);
        token
    }

    /// 校验令牌；顺带清理其他已过期的会话。
    pub async fn validate(&self, token: Option<&str>) -> bool {
        let Some(token) = token.filter(|value| !value.is_empty()) else {
            return false;
        };

        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        match sessions.get(token) {
            None => false,
            Some(session) if session.is_expired(now) => {
                sessions.remove(token);
                false
            }
            Some(_) => {
                sessions.retain(|_, session| !session.is_expired(now));
                true
            }
        }
    }

    pub async fn get(&self, token: &str) -> Option<Session> {
        self.sessions.lock().await.get(token).cloned()
    }

    /// 注销会话，返回令牌此前是否存在。
    pub async fn delete(&self, token: &str) -> bool {
        self.sessions.lock().await.remove(token).is_some()
    }

    /// 清理所有过期会话，返回清理数量。
    pub async fn cleanup_expired(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(now));
        before - sessions.len()
    }

    /// 剩余有效秒数（向下取整），未知或过期返回 0。
    pub async fn remaining_time(&self, token: &str) -> u64 {
        let sessions = self.sessions.lock().await;
        sessions
            .get(token)
            .map(|session| {
                session
                    .expires_at
                    .saturating_duration_since(Instant::now())
                    .as_secs()
            })
            .unwrap_or(0)
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().fold(
        String::with_capacity(TOKEN_BYTES * 2),
        |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        },
    )
}
