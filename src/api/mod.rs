//! HTTP API of the storage backend.
//!
//! Bearer-token authenticated JSON endpoints over hyper. Every response uses
//! the `{success, message, data}` envelope. Routes:
//!
//! - `POST /api/register` - create an account (unauthenticated)
//! - `POST /api/files?name=..&folder_id=..` - upload a file (raw body)
//! - `GET /api/files?folder_id=..&name=..&ordering=..` - list a folder
//! - `DELETE /api/files/{id}` - delete a file
//! - `GET /api/files/{id}/download` - issue a download URL
//! - `POST /api/folders` - create a folder
//! - `GET /download/{token}` - redeem a download token (unauthenticated)
//! - `GET /health` - liveness check

mod handlers;
mod responses;

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Request, Response, StatusCode};

use crate::auth::{UserRecord, UserStore};
use crate::blobstore::FsBlobStore;
use crate::catalog::FileCatalog;
use crate::metrics::SharedMetrics;

pub struct ApiState {
    pub catalog: FileCatalog,
    pub users: UserStore,
    /// Backs the `/download/{token}` route; `None` when the blob store
    /// issues externally served URLs.
    pub downloads: Option<Arc<FsBlobStore>>,
    pub metrics: SharedMetrics,
}

/// HTTP API service.
#[derive(Clone)]
pub struct ApiService {
    state: Arc<ApiState>,
}

impl ApiService {
    pub fn new(state: ApiState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Main request handler.
    pub async fn handle_request(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
        Ok(self.route_request(req).await)
    }

    async fn route_request(&self, req: Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        match (&method, path.as_str()) {
            (&Method::GET, "/health") => responses::ok(
                "healthy",
                serde_json::json!({
                    "status": "healthy",
                    "version": env!("CARGO_PKG_VERSION"),
                }),
            ),
            (&Method::POST, "/api/register") => handlers::register(&self.state, req).await,
            (&Method::GET, p) if p.starts_with("/download/") => {
                let token = p.trim_start_matches("/download/");
                handlers::download(&self.state, token).await
            }
            _ if path.starts_with("/api/") => {
                let user = match self.authenticate(&req) {
                    Ok(user) => user,
                    Err(resp) => return resp,
                };
                self.route_authenticated(user, &method, &path, req).await
            }
            _ => responses::error(StatusCode::NOT_FOUND, "not found"),
        }
    }

    async fn route_authenticated(
        &self,
        user: UserRecord,
        method: &Method,
        path: &str,
        req: Request<hyper::body::Incoming>,
    ) -> Response<Full<Bytes>> {
        match (method, path) {
            (&Method::POST, "/api/files") => handlers::upload(&self.state, &user, req).await,
            (&Method::GET, "/api/files") => handlers::list(&self.state, &user, &req),
            (&Method::POST, "/api/folders") => {
                handlers::create_folder(&self.state, &user, req).await
            }
            (&Method::GET, p) if p.starts_with("/api/files/") && p.ends_with("/download") => {
                let file_id = p
                    .trim_start_matches("/api/files/")
                    .trim_end_matches("/download");
                handlers::download_url(&self.state, &user, file_id).await
            }
            (&Method::DELETE, p) if p.starts_with("/api/files/") => {
                let file_id = p.trim_start_matches("/api/files/");
                handlers::delete(&self.state, &user, file_id).await
            }
            _ => responses::error(StatusCode::NOT_FOUND, "not found"),
        }
    }

    /// Resolves the `Authorization: Bearer <access_key>` header to a user.
    fn authenticate(
        &self,
        req: &Request<hyper::body::Incoming>,
    ) -> Result<UserRecord, Response<Full<Bytes>>> {
        let unauthorized =
            || responses::error(StatusCode::UNAUTHORIZED, "invalid or missing access key");

        let header = req
            .headers()
            .get(hyper::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(unauthorized)?;
        let access_key = header.strip_prefix("Bearer ").ok_or_else(unauthorized)?;

        match self.state.users.authenticate_key(access_key) {
            Ok(Some(user)) => Ok(user),
            Ok(None) => Err(unauthorized()),
            Err(e) => {
                tracing::error!(error = %e, "authentication lookup failed");
                Err(responses::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error",
                ))
            }
        }
    }
}
