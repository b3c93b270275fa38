//! HTTP 辅助工具：CORS、客户端 IP、预检请求与缓存/安全响应头。

use axum::body::Body as AxumBody;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header};
use axum::{middleware, response::IntoResponse, response::Response};
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::LazyLock;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

use crate::config::STATIC_ASSET_MAX_AGE_SECS;

static LOCAL_ORIGIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://(localhost|127\.0\.0\.1|\[::1\])(:\d+)?$").expect("origin regex")
});

const CACHEABLE_EXTENSIONS: &[&str] = &[
    "css", "jpg", "jpeg", "png", "gif", "webp", "svg", "woff", "woff2", "ttf", "eot",
];

/// 构建 CORS Layer：配置的来源列表（逗号分隔）加本机开发来源。
pub fn build_cors_layer(cors_origins: Option<&str>) -> CorsLayer {
    let origins = cors_origins
        .unwrap_or_default()
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            origins.contains(origin) || is_local_origin(origin)
        }))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

fn is_local_origin(origin: &HeaderValue) -> bool {
    origin
        .to_str()
        .map(|value| LOCAL_ORIGIN_RE.is_match(value))
        .unwrap_or(false)
}

/// 从 `x-forwarded-for` 解析客户端 IP。
pub fn extract_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<IpAddr>().ok())
}

/// 客户端 IP：默认取连接地址；仅在信任反向代理时采用 `x-forwarded-for`。
/// 两者都没有时视为本机。
pub fn client_ip(request: &Request<AxumBody>, trust_forwarded: bool) -> IpAddr {
    let connect_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    trust_forwarded
        .then(|| extract_forwarded_ip(request.headers()))
        .flatten()
        .or(connect_ip)
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// 任意路径的 OPTIONS 请求直接返回 200 空响应。
pub async fn answer_preflight(request: Request<AxumBody>, next: middleware::Next) -> Response {
    if request.method() == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }
    next.run(request).await
}

/// 添加缓存策略与基础安全响应头。
pub async fn add_response_headers(request: Request<AxumBody>, next: middleware::Next) -> Response {
    let cache_control = cache_control_for(request.uri().path());
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    if let Ok(value) = HeaderValue::from_str(&cache_control) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    response
}

fn cache_control_for(path: &str) -> String {
    if path.starts_with("/api/") || path == "/api" {
        return "no-store, no-cache, must-revalidate".into();
    }
    let extension = Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if extension == "js" {
        return "no-cache, must-revalidate".into();
    }
    if CACHEABLE_EXTENSIONS.contains(&extension.as_str()) {
        return format!("public, max-age={STATIC_ASSET_MAX_AGE_SECS}, immutable");
    }
    if extension == "html" || path == "/" || path.is_empty() {
        return "no-cache, must-revalidate".into();
    }
    "public, max-age=300, must-revalidate".into()
}
