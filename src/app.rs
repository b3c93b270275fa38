//! 应用装配：共享状态、axum 路由与 API 请求分发。

use axum::body::{Body as AxumBody, Bytes};
use axum::extract::{Extension, Query};
use axum::http::{HeaderMap, Request, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Router, middleware};
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::{Authorization, HeaderMapExt};
use http_body_util::LengthLimitError;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::error::ApiError;
use crate::frontend::{self, SiteDir};
use crate::http::{self, build_cors_layer};
use crate::ratelimit::{RateLimiter, UploadRateLimiter};
use crate::router::{ApiRouter, Handler};
use crate::session::SessionManager;
use crate::storage::Storage;
use crate::{auth, content, stats, upload};

const MIB: usize = 1024 * 1024;

/// Everything request handlers share; built once in `main`.
pub struct AppState {
    pub storage: Storage,
    pub sessions: SessionManager,
    pub login_limiter: RateLimiter,
    pub upload_limiter: UploadRateLimiter,
    pub router: ApiRouter,
    /// Plaintext, argon2 PHC or pbkdf2 `salt_hex:key_hex`. `None` rejects every login.
    pub admin_password: Option<String>,
    pub site: SiteDir,
    pub uploads_dir: PathBuf,
    pub upload_max_size: usize,
    pub max_body_size: usize,
    /// Take the client address from `x-forwarded-for` (behind a reverse proxy).
    pub trust_forwarded: bool,
}

/// A routed API call, detached from axum extractors.
pub struct ApiRequest {
    pub params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub client_ip: IpAddr,
    body: AxumBody,
}

impl ApiRequest {
    /// 路径参数或路由上下文值，缺失时为空串。
    pub fn param(&self, name: &str) -> &str {
        self.params.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn bearer_token(&self) -> Option<String> {
        self.headers
            .typed_get::<Authorization<Bearer>>()
            .map(|auth| auth.token().to_string())
    }

    /// 读取请求体，超过 `limit` 时返回 413。`subject` 用于错误消息。
    pub async fn body_bytes(&mut self, limit: usize, subject: &str) -> Result<Bytes, ApiError> {
        let too_large = || {
            ApiError::PayloadTooLarge(format!(
                "{subject} too large. Max size is {}.",
                size_label(limit)
            ))
        };
        let declared = self
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok());
        if declared.is_some_and(|length| length > limit) {
            return Err(too_large());
        }

        let body = std::mem::take(&mut self.body);
        axum::body::to_bytes(body, limit).await.map_err(|err| {
            let inner = err.into_inner();
            if is_length_limit(&*inner) {
                too_large()
            } else {
                ApiError::BadRequest("Failed to read request body".into())
            }
        })
    }

    /// 读取并解析 JSON 请求体，空请求体视为错误。
    pub async fn json(&mut self, limit: usize) -> Result<Value, ApiError> {
        let bytes = self.body_bytes(limit, "Request").await?;
        if bytes.is_empty() {
            return Err(ApiError::BadRequest("Missing request body".into()));
        }
        parse_json(&bytes)
    }
}

pub fn parse_json(bytes: &[u8]) -> Result<Value, ApiError> {
    serde_json::from_slice(bytes).map_err(|_| ApiError::BadRequest("Invalid JSON".into()))
}

fn size_label(limit: usize) -> String {
    if limit >= MIB && limit % MIB == 0 {
        format!("{}MB", limit / MIB)
    } else {
        format!("{limit} bytes")
    }
}

fn is_length_limit(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(error) = current {
        if error.is::<LengthLimitError>() {
            return true;
        }
        current = error.source();
    }
    false
}

fn query_params(uri: &Uri) -> HashMap<String, String> {
    Query::<HashMap<String, String>>::try_from_uri(uri)
        .map(|Query(query)| query)
        .unwrap_or_default()
}

/// 组装完整的 axum 应用。
pub fn build_app(state: Arc<AppState>, cors_origins: Option<&str>) -> Router {
    let uploads = ServeDir::new(&state.uploads_dir);
    let trust_forwarded = state.trust_forwarded;
    Router::new()
        .route("/api", any(dispatch))
        .route("/api/{*rest}", any(dispatch))
        .nest_service("/uploads", uploads)
        .fallback(frontend::serve_site)
        .layer(middleware::from_fn(http::answer_preflight))
        .layer(middleware::from_fn(http::add_response_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |request: &Request<AxumBody>| {
                    let client_ip = http::client_ip(request, trust_forwarded).to_string();
                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(state))
        .layer(build_cors_layer(cors_origins))
}

/// API 入口：路由解析、认证检查、按处理器分发。
pub async fn dispatch(
    Extension(state): Extension<Arc<AppState>>,
    request: Request<AxumBody>,
) -> Response {
    let client_ip = http::client_ip(&request, state.trust_forwarded);
    let (parts, body) = request.into_parts();
    let Some(route) = state.router.resolve(parts.uri.path(), &parts.method) else {
        return ApiError::NotFound("Not Found".into()).into_response();
    };

    let request = ApiRequest {
        params: route.params,
        query: query_params(&parts.uri),
        headers: parts.headers,
        client_ip,
        body,
    };
    if route.auth_required
        && !state
            .sessions
            .validate(request.bearer_token().as_deref())
            .await
    {
        return ApiError::Unauthorized("Unauthorized: Invalid or expired token".into())
            .into_response();
    }

    let result = match route.handler {
        Handler::Login => auth::login(&state, request).await,
        Handler::Logout => auth::logout(&state, request).await,
        Handler::AuthCheck => auth::check(&state, request).await,
        Handler::GetStats => stats::get_stats(&state).await,
        Handler::RecordVisit => stats::record_visit(&state, request).await,
        Handler::GenericGet => content::get_document(&state, request).await,
        Handler::GenericSave => content::save_document(&state, request).await,
        Handler::GetLegalDocument => content::get_legal_document(&state, request).await,
        Handler::GetProducts => content::get_products(&state, request).await,
        Handler::GetProduct => content::get_product(&state, request).await,
        Handler::Upload => upload::upload_image(&state, request).await,
        Handler::DeleteUpload => upload::delete_upload(&state, request).await,
    };
    match result {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}
