//! 登录失败锁定与上传频率限制。

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Default)]
struct LoginAttempt {
    failures: u32,
    locked_until: Option<Instant>,
}

/// 按客户端 IP 统计登录失败次数，达到阈值后锁定。
///
/// `check` 与 `record` 分开调用：先检查再做密码校验，最后记录结果。
#[derive(Debug)]
pub struct RateLimiter {
    attempts: Mutex<HashMap<IpAddr, LoginAttempt>>,
    max_attempts: u32,
    lockout: Duration,
}

impl RateLimiter {
    /// `max_attempts` 为 0 时不做限制。
    pub fn new(max_attempts: u32, lockout: Duration) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            max_attempts,
            lockout,
        }
    }

    /// 是否允许该 IP 再尝试一次；锁定到期时清零计数。
    pub async fn check(&self, ip: IpAddr) -> bool {
        let mut attempts = self.attempts.lock().await;
        let Some(entry) = attempts.get_mut(&ip) else {
            return true;
        };
        if let Some(locked_until) = entry.locked_until {
            if Instant::now() < locked_until {
                return false;
            }
            *entry = LoginAttempt::default();
        }
        true
    }

    /// 记录一次登录结果。
    pub async fn record(&self, ip: IpAddr, success: bool) {
        let mut attempts = self.attempts.lock().await;
        if success {
            attempts.insert(ip, LoginAttempt::default());
            return;
        }
        if self.max_attempts == 0 {
            return;
        }

        let entry = attempts.entry(ip).or_default();
        entry.failures = entry.failures.saturating_add(1);
        if entry.failures >= self.max_attempts {
            entry.locked_until = Some(Instant::now() + self.lockout);
            warn!(client_ip = %ip, failures = entry.failures, "login locked out");
        }
    }

    /// 剩余锁定秒数，未锁定返回 0。
    pub async fn lockout_remaining(&self, ip: IpAddr) -> u64 {
        let attempts = self.attempts.lock().await;
        attempts
            .get(&ip)
            .and_then(|entry| entry.locked_until)
            .map(|until| until.saturating_duration_since(Instant::now()).as_secs())
            .unwrap_or(0)
    }

    /// 删除锁定结束超过 `retention` 的记录；未锁定的记录保留。
    pub async fn cleanup_old(&self, retention: Duration) -> usize {
        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        let before = attempts.len();
        attempts.retain(|_, entry| match entry.locked_until {
            Some(until) => until + retention >= now,
            None => true,
        });
        before - attempts.len()
    }

    #[cfg(test)]
    async fn failures(&self, ip: IpAddr) -> u32 {
        let attempts = self.attempts.lock().await;
        attempts.get(&ip).map(|entry| entry.failures).unwrap_or(0)
    }
}

#[derive(Debug)]
struct UploadWindow {
    count: u32,
    window_start: Instant,
}

/// 固定窗口上传计数器：`check` 同时检查并计数。
#[derive(Debug)]
pub struct UploadRateLimiter {
    windows: Mutex<HashMap<IpAddr, UploadWindow>>,
    max_uploads: u32,
    window: Duration,
}

impl UploadRateLimiter {
    pub fn new(max_uploads: u32, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_uploads,
            window,
        }
    }

    pub async fn check(&self, ip: IpAddr) -> bool {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        let fresh = UploadWindow {
            count: 1,
            window_start: now,
        };
        let Some(entry) = windows.get_mut(&ip) else {
            windows.insert(ip, fresh);
            return true;
        };
        if now.duration_since(entry.window_start) > self.window {
            *entry = fresh;
            return true;
        }
        if entry.count >= self.max_uploads {
            return false;
        }
        entry.count += 1;
        true
    }

    /// 删除开始时间早于两个窗口之前的记录。
    pub async fn cleanup_old(&self) -> usize {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        let before = windows.len();
        windows.retain(|_, entry| now.duration_since(entry.window_start) <= self.window * 2);
        before - windows.len()
    }
}
