//! 图片上传（base64 / data URL）与按文件名删除。

use axum::Json;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::json;
use std::io::ErrorKind;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::{ApiRequest, AppState, parse_json};
use crate::atomic::write_atomic;
use crate::error::ApiError;
use crate::validation::{is_valid_filename, sniff_image};

#[derive(Deserialize)]
struct UploadRequest {
    /// Data URL (`data:image/png;base64,...`) or bare base64.
    #[serde(default)]
    image: String,
}

/// 保存上传的图片，文件名为随机 UUID 加探测到的扩展名。
pub async fn upload_image(state: &AppState, mut request: ApiRequest) -> Result<Response, ApiError> {
    let ip = request.client_ip;
    if !state.upload_limiter.check(ip).await {
        warn!(client_ip = %ip, "upload rate limit exceeded");
        return Err(ApiError::TooManyRequests {
            message: "Too many uploads. Please wait and try again.".into(),
            retry_after: 0,
        });
    }

    let bytes = request.body_bytes(state.upload_max_size, "File").await?;
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("Missing request body".into()));
    }
    let UploadRequest { image: data } = serde_json::from_value(parse_json(&bytes)?)
        .map_err(|_| ApiError::BadRequest("Invalid JSON".into()))?;
    let encoded = data.split_once(',').map_or(data.as_str(), |(_, rest)| rest);
    let image = STANDARD
        .decode(encoded.trim())
        .map_err(|_| ApiError::BadRequest("Invalid base64 data".into()))?;
    let extension = sniff_image(&image).ok_or_else(|| {
        ApiError::BadRequest("Invalid image format. Only PNG, JPG, GIF, WebP allowed.".into())
    })?;

    let filename = format!("{}.{extension}", Uuid::new_v4().simple());
    write_atomic(&state.uploads_dir.join(&filename), &image)
        .await
        .map_err(|err| ApiError::Internal(format!("store upload {filename}: {err}")))?;
    info!(client_ip = %ip, filename, size = image.len(), "image uploaded");

    Ok(Json(json!({
        "success": true,
        "filename": filename,
        "url": format!("/uploads/{filename}"),
    }))
    .into_response())
}

/// 删除上传文件；解析后的真实路径必须位于上传目录内。
pub async fn delete_upload(state: &AppState, request: ApiRequest) -> Result<Response, ApiError> {
    let filename = request.param("filename");
    if !is_valid_filename(filename) {
        return Err(ApiError::BadRequest("Invalid filename".into()));
    }

    let root = fs::canonicalize(&state.uploads_dir)
        .await
        .map_err(|err| ApiError::Internal(format!("resolve uploads dir: {err}")))?;
    let target = match fs::canonicalize(root.join(filename)).await {
        Ok(path) => path,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(ApiError::NotFound("File not found".into()));
        }
        Err(err) => return Err(ApiError::Internal(format!("resolve {filename}: {err}"))),
    };
    if !target.starts_with(&root) {
        warn!(filename, "upload delete escaped the uploads directory");
        return Err(ApiError::Forbidden("Access denied".into()));
    }

    match fs::remove_file(&target).await {
        Ok(()) => {
            info!(filename, "upload deleted");
            Ok(Json(json!({"success": true, "message": "File deleted"})).into_response())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            Err(ApiError::NotFound("File not found".into()))
        }
        Err(err) => Err(ApiError::Internal(format!("delete {filename}: {err}"))),
    }
}
