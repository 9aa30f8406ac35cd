use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use tracing::error;

use crate::catalog::CatalogError;

/// `{success, message, data}` envelope shared by every JSON response.
pub fn envelope(
    status: StatusCode,
    success: bool,
    message: &str,
    data: serde_json::Value,
) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "success": success,
        "message": message,
        "data": data,
    });
    let json = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(json)))
        .unwrap()
}

pub fn ok(message: &str, data: serde_json::Value) -> Response<Full<Bytes>> {
    envelope(StatusCode::OK, true, message, data)
}

pub fn created(message: &str, data: serde_json::Value) -> Response<Full<Bytes>> {
    envelope(StatusCode::CREATED, true, message, data)
}

pub fn error(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    envelope(status, false, message, serde_json::Value::Null)
}

/// Maps a catalog error to its HTTP response. Internal faults are logged and
/// reported generically.
pub fn catalog_error(err: &CatalogError) -> Response<Full<Bytes>> {
    let status = match err {
        CatalogError::QuotaExceeded => StatusCode::BAD_REQUEST,
        CatalogError::InvalidName(_) => StatusCode::BAD_REQUEST,
        CatalogError::NotFound => StatusCode::NOT_FOUND,
        CatalogError::FolderNotFound => StatusCode::NOT_FOUND,
        CatalogError::FolderExists => StatusCode::CONFLICT,
        CatalogError::Storage { .. } => StatusCode::BAD_GATEWAY,
        CatalogError::Conflict => StatusCode::SERVICE_UNAVAILABLE,
        CatalogError::Meta(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %err, "request failed");
        return error(status, "internal error");
    }
    error(status, &err.to_string())
}
