//! 站点静态文件服务：页面重写规则与私有目录屏蔽。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{Method, Request, Uri};
use axum::response::{IntoResponse, Response};
use percent_encoding::percent_decode_str;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::services::ServeDir;

use crate::app::AppState;
use crate::error::ApiError;

/// Root of the built site plus top-level directories that must never be
/// served from it (data files and the database live there by default).
#[derive(Clone, Debug)]
pub struct SiteDir {
    root: PathBuf,
    hidden: Vec<String>,
}

impl SiteDir {
    /// `private` entries (directories or files) that resolve inside `root`
    /// are hidden by their first path component. Paths must already exist.
    pub fn new(root: PathBuf, private: &[&Path]) -> Self {
        let canonical_root = std::fs::canonicalize(&root).unwrap_or_else(|_| root.clone());
        let hidden = private
            .iter()
            .filter_map(|dir| std::fs::canonicalize(dir).ok())
            .filter_map(|dir| {
                dir.strip_prefix(&canonical_root)
                    .ok()
                    .and_then(|rest| rest.components().next())
                    .and_then(|first| match first {
                        Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
                        _ => None,
                    })
            })
            .collect();
        Self { root, hidden }
    }

    /// `path` must already be percent-decoded.
    fn is_private(&self, path: &str) -> bool {
        path.split(['/', '\\'])
            .filter(|segment| !segment.is_empty())
            .enumerate()
            .any(|(index, segment)| {
                segment.starts_with('.') || (index == 0 && self.hidden.iter().any(|h| h == segment))
            })
    }
}

/// 页面别名：返回重写后的路径，None 表示按原路径提供。
fn rewrite(path: &str) -> Option<&'static str> {
    match path {
        "/" => Some("/index.html"),
        "/robots.txt" => Some("/public/robots.txt"),
        "/sitemap.xml" => Some("/public/sitemap.xml"),
        "/favicon.ico" => Some("/public/favicon.ico"),
        _ if path == "/legal" || path.starts_with("/legal/") => Some("/legal.html"),
        _ if path == "/shop" || path.starts_with("/shop/") => Some("/shop.html"),
        _ => None,
    }
}

/// 非 API 请求的回退处理器。
pub async fn serve_site(
    Extension(state): Extension<Arc<AppState>>,
    request: Request<AxumBody>,
) -> Response {
    if request.method() != Method::GET && request.method() != Method::HEAD {
        return ApiError::NotFound("Not Found".into()).into_response();
    }
    // ServeDir opens the decoded path; check that one.
    let path = match percent_decode_str(request.uri().path()).decode_utf8() {
        Ok(path) => path.into_owned(),
        Err(_) => return ApiError::NotFound("Not Found".into()).into_response(),
    };
    if state.site.is_private(&path) {
        return ApiError::NotFound("Not Found".into()).into_response();
    }

    let (mut parts, body) = request.into_parts();
    if let Some(target) = rewrite(&path) {
        parts.uri = Uri::from_static(target);
    }
    let request = Request::from_parts(parts, body);
    match ServeDir::new(&state.site.root).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(err) => ApiError::Internal(err.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn page_aliases() {
        assert_eq!(rewrite("/"), Some("/index.html"));
        assert_eq!(rewrite("/favicon.ico"), Some("/public/favicon.ico"));
        assert_eq!(rewrite("/legal/privacy"), Some("/legal.html"));
        assert_eq!(rewrite("/shop"), Some("/shop.html"));
        assert_eq!(rewrite("/shopping.html"), None);
        assert_eq!(rewrite("/css/site.css"), None);
    }

    #[test]
    fn data_directory_and_dotfiles_are_hidden() {
        let temp = tempdir().expect("tempdir");
        let data = temp.path().join("data");
        std::fs::create_dir_all(&data).expect("data dir");
        let outside = tempdir().expect("outside");

        let config = temp.path().join("config.json");
        std::fs::write(&config, "{}").expect("config");

        let site = SiteDir::new(temp.path().to_path_buf(), &[&data, outside.path(), &config]);
        assert!(site.is_private("/config.json"));
        assert!(site.is_private("/data/masters.json"));
        assert!(site.is_private("/.env"));
        assert!(site.is_private("/css/.hidden"));
        assert!(site.is_private("/css\\..\\data\\masters.json"));
        assert!(!site.is_private("/css/data/x.css"));
        assert!(!site.is_private("/index.html"));
    }
}
