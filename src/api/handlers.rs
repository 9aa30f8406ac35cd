use std::collections::HashMap;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, Request, Response, StatusCode};
use serde::Deserialize;
use tracing::error;

use crate::auth::{AuthError, UserRecord};
use crate::blobstore::BlobStore;
use crate::catalog::{FileItem, ListFilter, ListOrdering};
use crate::metastore::FolderNode;

use super::{responses, ApiState};

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    user_id: String,
    password: String,
}

pub async fn register(state: &ApiState, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let body = match read_body(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let parsed: RegisterRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            return responses::error(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {}", e),
            )
        }
    };
    if parsed.user_id.is_empty() || parsed.password.is_empty() {
        return responses::error(StatusCode::BAD_REQUEST, "user_id and password are required");
    }

    match state.users.register(&parsed.user_id, &parsed.password) {
        Ok(user) => responses::created(
            "user registered",
            serde_json::json!({
                "user_id": user.user_id,
                "access_key": user.access_key,
            }),
        ),
        Err(AuthError::UserExists) => {
            responses::error(StatusCode::CONFLICT, "user already exists")
        }
        Err(e) => {
            error!(error = %e, "registration failed");
            responses::error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

pub async fn upload(
    state: &ApiState,
    user: &UserRecord,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let params = query_params(req.uri());
    let Some(name) = params.get("name").cloned() else {
        return responses::error(StatusCode::BAD_REQUEST, "missing 'name' query parameter");
    };
    let folder_id = params.get("folder_id").cloned();

    let body = match read_body(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    match state
        .catalog
        .upload(&user.user_id, folder_id.as_deref(), &name, body)
        .await
    {
        Ok(item) => responses::created("file uploaded", file_json(&item)),
        Err(e) => responses::catalog_error(&e),
    }
}

pub fn list(
    state: &ApiState,
    user: &UserRecord,
    req: &Request<Incoming>,
) -> Response<Full<Bytes>> {
    let params = query_params(req.uri());
    let filter = ListFilter {
        name: params.get("name").cloned(),
        ordering: ListOrdering::parse(params.get("ordering").map(String::as_str)),
    };

    match state.catalog.list(
        &user.user_id,
        params.get("folder_id").map(String::as_str),
        &filter,
    ) {
        Ok(listing) => responses::ok(
            "folder listed",
            serde_json::json!({
                "files": listing.files.iter().map(file_json).collect::<Vec<_>>(),
                "folders": listing.folders.iter().map(folder_json).collect::<Vec<_>>(),
                "storage_used": listing.storage_used,
                "storage_limit": listing.storage_limit,
            }),
        ),
        Err(e) => responses::catalog_error(&e),
    }
}

pub async fn delete(state: &ApiState, user: &UserRecord, file_id: &str) -> Response<Full<Bytes>> {
    match state.catalog.delete(&user.user_id, file_id).await {
        Ok(()) => responses::ok("file deleted", serde_json::Value::Null),
        Err(e) => responses::catalog_error(&e),
    }
}

pub async fn download_url(
    state: &ApiState,
    user: &UserRecord,
    file_id: &str,
) -> Response<Full<Bytes>> {
    match state.catalog.download_url(&user.user_id, file_id).await {
        Ok(info) => responses::ok(
            "download URL issued",
            serde_json::json!({
                "download_url": info.download_url,
                "filename": info.filename,
                "size": info.size,
            }),
        ),
        Err(e) => responses::catalog_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct CreateFolderRequest {
    name: String,
    #[serde(default)]
    parent_id: Option<String>,
}

pub async fn create_folder(
    state: &ApiState,
    user: &UserRecord,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let body = match read_body(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let parsed: CreateFolderRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            return responses::error(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {}", e),
            )
        }
    };

    match state
        .catalog
        .create_folder(&user.user_id, &parsed.name, parsed.parent_id.as_deref())
    {
        Ok(folder) => responses::created("folder created", folder_json(&folder)),
        Err(e) => responses::catalog_error(&e),
    }
}

/// Redeems a download token issued by the filesystem blob store.
pub async fn download(state: &ApiState, token: &str) -> Response<Full<Bytes>> {
    let Some(ref store) = state.downloads else {
        return responses::error(StatusCode::NOT_FOUND, "not found");
    };
    let Some(blob_key) = store.resolve_token(token) else {
        return responses::error(StatusCode::NOT_FOUND, "invalid or expired download token");
    };

    match store.get(&blob_key).await {
        Ok(Some(data)) => {
            state.metrics.bytes_sent(data.len());
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/octet-stream")
                .body(Full::new(data))
                .unwrap()
        }
        Ok(None) => responses::error(StatusCode::NOT_FOUND, "blob not found"),
        Err(e) => {
            error!(error = %e, "blob read failed");
            responses::error(StatusCode::BAD_GATEWAY, "blob store unavailable")
        }
    }
}

fn file_json(item: &FileItem) -> serde_json::Value {
    serde_json::json!({
        "id": item.file.id,
        "name": item.file.name,
        "folder_id": item.file.folder_id,
        "size": item.size,
        "content_hash": item.file.content_hash,
        "created_at": item.file.created_at,
        "updated_at": item.file.updated_at,
    })
}

fn folder_json(folder: &FolderNode) -> serde_json::Value {
    serde_json::json!({
        "id": folder.id,
        "name": folder.name,
        "parent_id": folder.parent_id,
        "created_at": folder.created_at,
    })
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes, Response<Full<Bytes>>> {
    match req.into_body().collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => {
            error!(error = %e, "failed to read request body");
            Err(responses::error(
                StatusCode::BAD_REQUEST,
                "failed to read request body",
            ))
        }
    }
}

fn query_params(uri: &hyper::Uri) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let Some(query) = uri.query() else {
        return params;
    };
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or("");
        let value = parts.next().unwrap_or("");
        if key.is_empty() {
            continue;
        }
        let key = urlencoding::decode(key)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| key.to_string());
        let value = urlencoding::decode(value)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| value.to_string());
        params.insert(key, value);
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_params_decode() {
        let uri: hyper::Uri = "http://localhost/api/files?name=my%20file.txt&folder_id=abc"
            .parse()
            .unwrap();
        let params = query_params(&uri);
        assert_eq!(params.get("name").unwrap(), "my file.txt");
        assert_eq!(params.get("folder_id").unwrap(), "abc");
        assert!(params.get("ordering").is_none());
    }

    #[test]
    fn query_params_empty() {
        let uri: hyper::Uri = "http://localhost/api/files".parse().unwrap();
        assert!(query_params(&uri).is_empty());
    }
}
