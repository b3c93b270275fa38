//! 内容集合的读取与整体替换，以及法律文档和商品查询。

use axum::Json;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::info;

use crate::app::{ApiRequest, AppState};
use crate::error::ApiError;
use crate::storage::Resource;
use crate::validation::{is_valid_slug, validate_document};

fn resource_of(request: &ApiRequest) -> Result<Resource, ApiError> {
    Resource::from_name(request.param("resource"))
        .ok_or_else(|| ApiError::NotFound("Resource not found".into()))
}

/// 返回整个文档，尚无数据时为 `{}`。
pub async fn get_document(state: &AppState, request: ApiRequest) -> Result<Response, ApiError> {
    let resource = resource_of(&request)?;
    let document = state.storage.read(resource.name(), json!({})).await;
    Ok(Json(document).into_response())
}

/// 校验后整体替换文档。
pub async fn save_document(
    state: &AppState,
    mut request: ApiRequest,
) -> Result<Response, ApiError> {
    let resource = resource_of(&request)?;
    let mut document = request.json(state.max_body_size).await?;
    if !document.is_object() {
        return Err(ApiError::BadRequest("Expected JSON object".into()));
    }
    validate_document(resource, &mut document).map_err(ApiError::BadRequest)?;

    state.storage.write(resource.name(), &document).await?;
    info!(resource = resource.name(), "content saved");
    Ok(Json(json!({"success": true, "message": "Data saved"})).into_response())
}

pub async fn get_legal_document(
    state: &AppState,
    request: ApiRequest,
) -> Result<Response, ApiError> {
    let slug = request.param("slug");
    if !is_valid_slug(slug) {
        return Err(ApiError::BadRequest("Invalid slug format".into()));
    }
    match state.storage.legal_by_slug(slug).await? {
        Some(document) => Ok(Json(document).into_response()),
        None => Err(ApiError::NotFound("Document not found".into())),
    }
}

/// `?category=<slug>` 过滤，`all` 或缺省表示不过滤；只返回上架商品。
pub async fn get_products(state: &AppState, request: ApiRequest) -> Result<Response, ApiError> {
    let category = request
        .query
        .get("category")
        .map(String::as_str)
        .filter(|slug| *slug != "all");
    let products = state.storage.products_filtered(category).await?;
    Ok(Json(json!({ "products": products })).into_response())
}

pub async fn get_product(state: &AppState, request: ApiRequest) -> Result<Response, ApiError> {
    match state.storage.product_by_id(request.param("id")).await? {
        Some(product) => Ok(Json(product).into_response()),
        None => Err(ApiError::NotFound("Product not found".into())),
    }
}
