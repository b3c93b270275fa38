//! CLI 参数、环境变量与服务默认配置。

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use shadow_rs::formatcp;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_LOGIN_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOGIN_LOCKOUT_SECS: u64 = 15 * 60;
pub const DEFAULT_LOGIN_RETENTION_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_UPLOAD_RATE_MAX: u32 = 10;
pub const DEFAULT_UPLOAD_RATE_WINDOW_SECS: u64 = 60;
pub const DEFAULT_UPLOAD_MAX_SIZE: usize = 5 * 1024 * 1024;
pub const DEFAULT_MAX_BODY_SIZE: usize = 5 * 1024 * 1024;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60 * 60;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
pub const STATS_RETENTION_DAYS: i64 = 90;
pub const STATIC_ASSET_MAX_AGE_SECS: u64 = 7 * 24 * 60 * 60;

/// 持久化后端选择，启动时确定。
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StorageBackend {
    /// 每个资源一个 JSON 文件。
    Json,
    /// 嵌入式 SQLite 数据库。
    Sqlite,
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "barbershop-cms", version = VERSION_INFO, about = "Barbershop site CMS server")]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "CMS_BIND",
        default_value = "127.0.0.1",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "CMS_HTTP_PORT",
        default_value_t = 8000,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "CMS_HTTPS_PORT",
        default_value_t = 8443,
        help = "HTTPS port (used only when a certificate is configured)"
    )]
    pub https_port: u16,
    #[arg(short = 'c', long, env = "CMS_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "CMS_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(
        long,
        env = "ADMIN_PASSWORD",
        hide_env_values = true,
        help = "Admin password (plaintext, argon2 PHC string or pbkdf2 salt_hex:key_hex)"
    )]
    pub admin_password: Option<String>,
    #[arg(
        long,
        env = "CMS_SITE_DIR",
        default_value = ".",
        help = "Directory with the built static site"
    )]
    pub site_dir: String,
    #[arg(
        short = 'd',
        long,
        env = "CMS_DATA_DIR",
        default_value = "data",
        help = "Directory for JSON documents"
    )]
    pub data_dir: String,
    #[arg(
        long,
        env = "CMS_UPLOADS_DIR",
        default_value = "uploads",
        help = "Directory for uploaded images"
    )]
    pub uploads_dir: String,
    #[arg(
        long,
        value_enum,
        env = "CMS_STORAGE",
        default_value_t = StorageBackend::Sqlite,
        help = "Storage backend"
    )]
    pub storage: StorageBackend,
    #[arg(
        long,
        env = "CMS_DB_PATH",
        default_value = "data/cms.db",
        help = "SQLite database path"
    )]
    pub db_path: String,
    #[arg(long, env = "CMS_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "CMS_TRUSTED_PROXY",
        help = "Take the client address from X-Forwarded-For (only behind a reverse proxy)"
    )]
    pub trusted_proxy: bool,
    #[arg(
        long,
        env = "CMS_CONFIG_FILE",
        default_value = "config.json",
        help = "Optional JSON file with auth settings"
    )]
    pub config_file: String,
    #[arg(
        long,
        env = "CMS_SESSION_TTL_SECS",
        help = "Session expiration in seconds [default: 86400]"
    )]
    pub session_ttl_secs: Option<u64>,
    #[arg(
        long,
        env = "CMS_LOGIN_MAX_ATTEMPTS",
        help = "Max failed logins before lockout, 0 to disable [default: 5]"
    )]
    pub login_max_attempts: Option<u32>,
    #[arg(
        long,
        env = "CMS_LOGIN_LOCKOUT_SECS",
        help = "Login lockout time after max attempts [default: 900]"
    )]
    pub login_lockout_secs: Option<u64>,
    #[arg(long, env = "SESSION_TIMEOUT_HOURS", hide = true)]
    pub session_timeout_hours: Option<u64>,
    #[arg(long, env = "MAX_LOGIN_ATTEMPTS", hide = true)]
    pub max_login_attempts: Option<u32>,
    #[arg(long, env = "LOCKOUT_MINUTES", hide = true)]
    pub lockout_minutes: Option<u64>,
    #[arg(
        long,
        env = "CMS_LOGIN_RETENTION_SECS",
        default_value_t = DEFAULT_LOGIN_RETENTION_SECS,
        help = "How long expired lockout records are kept"
    )]
    pub login_retention_secs: u64,
    #[arg(
        long,
        env = "CMS_UPLOAD_RATE_MAX",
        default_value_t = DEFAULT_UPLOAD_RATE_MAX,
        help = "Max uploads per client within the rate window"
    )]
    pub upload_rate_max: u32,
    #[arg(
        long,
        env = "CMS_UPLOAD_RATE_WINDOW_SECS",
        default_value_t = DEFAULT_UPLOAD_RATE_WINDOW_SECS,
        help = "Upload rate window in seconds"
    )]
    pub upload_rate_window_secs: u64,
    #[arg(
        long,
        env = "CMS_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload request size in bytes"
    )]
    pub upload_max_size: usize,
    #[arg(
        long,
        env = "CMS_MAX_BODY_SIZE",
        default_value_t = DEFAULT_MAX_BODY_SIZE,
        help = "Max JSON body size for content writes in bytes"
    )]
    pub max_body_size: usize,
    #[arg(
        long,
        env = "CMS_CLEANUP_INTERVAL_SECS",
        default_value_t = DEFAULT_CLEANUP_INTERVAL_SECS,
        help = "Interval of session and rate limit cleanup"
    )]
    pub cleanup_interval_secs: u64,
}

/// 会话与登录锁定参数的最终取值。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthSettings {
    pub session_ttl: Duration,
    pub login_max_attempts: u32,
    pub login_lockout: Duration,
}

impl Args {
    /// Precedence: `CMS_*` options, then the `SESSION_TIMEOUT_HOURS` /
    /// `MAX_LOGIN_ATTEMPTS` / `LOCKOUT_MINUTES` variables, then the config
    /// file, then built-in defaults.
    pub fn auth_settings(&self, file: &FileConfig) -> AuthSettings {
        let file = file.auth_section();
        let session_ttl_secs = self
            .session_ttl_secs
            .or(self.session_timeout_hours.map(|hours| hours * 3600))
            .or(file.session_timeout_hours.map(|hours| hours * 3600))
            .unwrap_or(DEFAULT_SESSION_TTL_SECS);
        let login_max_attempts = self
            .login_max_attempts
            .or(self.max_login_attempts)
            .or(file.max_login_attempts)
            .unwrap_or(DEFAULT_LOGIN_MAX_ATTEMPTS);
        let login_lockout_secs = self
            .login_lockout_secs
            .or(self.lockout_minutes.map(|minutes| minutes * 60))
            .or(file.lockout_minutes.map(|minutes| minutes * 60))
            .unwrap_or(DEFAULT_LOGIN_LOCKOUT_SECS);
        AuthSettings {
            session_ttl: Duration::from_secs(session_ttl_secs),
            login_max_attempts,
            login_lockout: Duration::from_secs(login_lockout_secs),
        }
    }
}

/// `config.json`: either an `auth` section in camelCase or the same keys
/// in snake_case at the top level.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    auth: Option<AuthSection>,
    session_timeout_hours: Option<u64>,
    max_login_attempts: Option<u32>,
    lockout_minutes: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct AuthSection {
    session_timeout_hours: Option<u64>,
    max_login_attempts: Option<u32>,
    lockout_minutes: Option<u64>,
}

impl FileConfig {
    /// A missing file is an empty config; an unreadable one is logged and ignored.
    pub async fn load(path: &Path) -> Self {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Self::default(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read config file");
                return Self::default();
            }
        };
        serde_json::from_slice(&bytes).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "failed to parse config file");
            Self::default()
        })
    }

    fn auth_section(&self) -> AuthSection {
        self.auth.clone().unwrap_or(AuthSection {
            session_timeout_hours: self.session_timeout_hours,
            max_login_attempts: self.max_login_attempts,
            lockout_minutes: self.lockout_minutes,
        })
    }
}
