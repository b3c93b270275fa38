//! 管理员登录、登出与会话状态查询。

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use axum::Json;
use axum::response::{IntoResponse, Response};
use pbkdf2::pbkdf2_hmac;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::app::{ApiRequest, AppState};
use crate::error::ApiError;

const ARGON2_PREFIX: &str = "$argon2";
const PBKDF2_ROUNDS: u32 = 100_000;
const PBKDF2_KEY_LEN: usize = 32;
/// Shortest configured value treated as `salt_hex:key_hex`.
const PBKDF2_MIN_LEN: usize = 71;

#[derive(Deserialize)]
struct LoginRequest {
    #[serde(default)]
    password: String,
}

/// 登录接口：先检查锁定，再校验密码，最后记录结果。
pub async fn login(state: &AppState, mut request: ApiRequest) -> Result<Response, ApiError> {
    let ip = request.client_ip;
    if !state.login_limiter.check(ip).await {
        let retry_after = state.login_limiter.lockout_remaining(ip).await;
        warn!(client_ip = %ip, retry_after, "login rejected while locked out");
        return Err(ApiError::TooManyRequests {
            message: "Too many login attempts. Try again later.".into(),
            retry_after,
        });
    }

    let body = request.json(state.max_body_size).await?;
    let LoginRequest { password } = serde_json::from_value(body)
        .map_err(|_| ApiError::BadRequest("Invalid JSON".into()))?;
    let accepted = state
        .admin_password
        .as_deref()
        .filter(|configured| !configured.is_empty())
        .is_some_and(|configured| verify_password(&password, configured));
    state.login_limiter.record(ip, accepted).await;

    if !accepted {
        warn!(client_ip = %ip, "invalid admin password");
        return Err(ApiError::Unauthorized("Invalid password".into()));
    }

    let token = state.sessions.create().await;
    info!(client_ip = %ip, "admin logged in");
    Ok(Json(json!({
        "success": true,
        "token": token,
        "expires_in": state.sessions.ttl().as_secs(),
    }))
    .into_response())
}

pub async fn logout(state: &AppState, request: ApiRequest) -> Result<Response, ApiError> {
    if let Some(token) = request.bearer_token() {
        if let Some(session) = state.sessions.get(&token).await {
            debug!(
                age_secs = session.created_at.elapsed().as_secs(),
                "closing admin session"
            );
        }
        state.sessions.delete(&token).await;
    }
    Ok(Json(json!({"success": true, "message": "Logged out"})).into_response())
}

pub async fn check(state: &AppState, request: ApiRequest) -> Result<Response, ApiError> {
    let token = request.bearer_token().unwrap_or_default();
    if !state.sessions.validate(Some(&token)).await {
        return Ok(Json(json!({"valid": false})).into_response());
    }
    Ok(Json(json!({
        "valid": true,
        "expires_in": state.sessions.remaining_time(&token).await,
    }))
    .into_response())
}

/// 配置值可以是 argon2 PHC 串、`salt_hex:key_hex`（PBKDF2-HMAC-SHA256）或明文。
fn verify_password(candidate: &str, configured: &str) -> bool {
    if configured.starts_with(ARGON2_PREFIX) {
        verify_argon2(candidate, configured)
    } else if configured.contains(':') && configured.len() >= PBKDF2_MIN_LEN {
        verify_pbkdf2(candidate, configured, PBKDF2_ROUNDS)
    } else {
        constant_time_eq(candidate.as_bytes(), configured.as_bytes())
    }
}

fn verify_argon2(candidate: &str, configured: &str) -> bool {
    match PasswordHash::new(configured) {
        Ok(hash) => Argon2::default()
            .verify_password(candidate.as_bytes(), &hash)
            .is_ok(),
        Err(err) => {
            warn!(error = %err, "configured admin password hash is malformed");
            false
        }
    }
}

fn verify_pbkdf2(candidate: &str, configured: &str, rounds: u32) -> bool {
    let Some((salt_hex, key_hex)) = configured.split_once(':') else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(key_hex)) else {
        warn!("configured admin password hash is malformed");
        return false;
    };
    if expected.len() != PBKDF2_KEY_LEN {
        warn!(len = expected.len(), "configured pbkdf2 key has the wrong length");
        return false;
    }
    let mut derived = [0u8; PBKDF2_KEY_LEN];
    pbkdf2_hmac::<Sha256>(candidate.as_bytes(), &salt, rounds, &mut derived);
    constant_time_eq(&derived, &expected)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::PasswordHasher;
    use argon2::password_hash::SaltString;
    use rand::rngs::OsRng;

    #[test]
    fn plaintext_password() {
        assert!(verify_password("s3cret", "s3cret"));
        assert!(!verify_password("s3cret!", "s3cret"));
        assert!(!verify_password("", "s3cret"));
    }

    #[test]
    fn argon2_password_hash() {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(b"barber", &salt)
            .expect("hash")
            .to_string();
        assert!(verify_password("barber", &hash));
        assert!(!verify_password("barbe", &hash));
        assert!(!verify_password("barber", "$argon2id$garbage"));
    }

    #[test]
    fn pbkdf2_known_vectors() {
        // PBKDF2-HMAC-SHA256, P = "password", S = "salt".
        let one_round = "73616c74:120fb6cffcf8b32c43e7225256c4f837a86548c92ccc35480805987cb70be17b";
        let two_rounds = "73616c74:ae4d0c95af6b46d32d0adff928f06dd02a303f8ef3c251dfd6e2d85a95474c43";
        assert!(verify_pbkdf2("password", one_round, 1));
        assert!(verify_pbkdf2("password", two_rounds, 2));
        assert!(!verify_pbkdf2("password", two_rounds, 1));
        assert!(!verify_pbkdf2("Password", one_round, 1));
        assert!(!verify_pbkdf2("password", "zz:120fb6cf", 1));
    }

    #[test]
    fn pbkdf2_salted_hash() {
        let salt = [7u8; 16];
        let mut key = [0u8; PBKDF2_KEY_LEN];
        pbkdf2_hmac::<Sha256>(b"barber", &salt, PBKDF2_ROUNDS, &mut key);
        let stored = format!("{}:{}", hex::encode(salt), hex::encode(key));
        assert_eq!(stored.len(), 97);

        assert!(verify_password("barber", &stored));
        assert!(!verify_password("barbe", &stored));
        assert!(!verify_password(&stored, &stored));
        // Short values with a colon are still plaintext.
        assert!(verify_password("a:b", "a:b"));
    }
}
