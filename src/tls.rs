//! 可选 HTTPS：从配置的 PEM 证书与私钥构建 Rustls 配置。

use axum_server::tls_rustls::RustlsConfig;
use std::io;
use tokio::fs;
use tracing::warn;

use crate::config::Args;

/// 证书与私钥都配置时返回 Rustls 配置；只配置其一视为错误。
pub async fn build_rustls_config(args: &Args) -> io::Result<Option<RustlsConfig>> {
    match (&args.tls_cert, &args.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            let cert = fs::read(cert_path).await?;
            let key = fs::read(key_path).await?;
            RustlsConfig::from_pem(cert, key).await.map(Some)
        }
        (None, None) => Ok(None),
        _ => {
            warn!("both --tls-cert and --tls-key are required for HTTPS");
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "incomplete TLS configuration",
            ))
        }
    }
}
