//! 会话与限流记录的周期性清理。

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::app::AppState;

/// 启动后台清理任务。
pub fn spawn_background_tasks(state: Arc<AppState>, interval: Duration, login_retention: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; nothing to clean at startup.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            run_cleanup(&state, login_retention).await;
        }
    });
}

async fn run_cleanup(state: &AppState, login_retention: Duration) {
    let sessions = state.sessions.cleanup_expired().await;
    let lockouts = state.login_limiter.cleanup_old(login_retention).await;
    let uploads = state.upload_limiter.cleanup_old().await;
    if sessions + lockouts + uploads > 0 {
        info!(sessions, lockouts, uploads, "expired records cleaned up");
    }
}
