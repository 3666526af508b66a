#![doc = "Authenticated HTTP client for the remote content repository, used behind the local auth proxy."]
//
//! # Remote client (CLI <-> Core)
//!
//! Implements [`RemoteContentClient`] from `site-indexer-core::contract` over reqwest. The
//! core crate never sees credentials: it hands this client to the local auth proxy, which
//! uses it for pass-through reads and CSRF-protected writes.
//!
//! ## Client Usage
//!
//! - Build a [`ServerConfig`] with [`crate::load_config::resolve_server`] (secrets come from
//!   `SITE_INDEXER_TOKEN` or `SITE_INDEXER_PASSWORD`).
//! - Construct [`HttpRemoteClient::new`] and pass it to `run_index_site` as an `Arc`.

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;

use site_indexer_core::contract::{RemoteContentClient, RemoteResponse, WriteMethod};
use site_indexer_core::error::RepoError;
use site_indexer_core::proxy::RemoteRoutes;

use crate::load_config::{ServerAuth, ServerConfig};

const CSRF_HEADER: &str = "X-CSRF-TOKEN";
const REQUESTED_WITH_HEADER: &str = "X-REQUESTED-WITH";

#[derive(Deserialize)]
struct CsrfToken {
    token: String,
}

pub struct HttpRemoteClient {
    http: Client,
    base_url: String,
    auth: ServerAuth,
    routes: RemoteRoutes,
}

impl HttpRemoteClient {
    pub fn new(server: &ServerConfig, routes: RemoteRoutes) -> Self {
        tracing::info!(
            server = %server.name,
            url = %server.url,
            auth = server.auth.kind(),
            "Initialized remote content client"
        );
        HttpRemoteClient {
            http: Client::new(),
            base_url: server.url.trim_end_matches('/').to_string(),
            auth: server.auth.clone(),
            routes,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorised(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            ServerAuth::Basic { username, password } => request.basic_auth(username, Some(password)),
            ServerAuth::Bearer(token) => request.bearer_auth(token),
        }
    }

    async fn execute(&self, request: RequestBuilder, url: &str) -> Result<RemoteResponse, RepoError> {
        let response = self.authorised(request).send().await.map_err(|e| {
            tracing::error!(error = ?e, url = %url, "Remote request failed");
            RepoError::Transport(format!("{url}: {e}"))
        })?;
        into_remote_response(response, url).await
    }
}

async fn into_remote_response(response: Response, url: &str) -> Result<RemoteResponse, RepoError> {
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response
        .bytes()
        .await
        .map_err(|e| RepoError::Transport(format!("{url}: {e}")))?
        .to_vec();
    tracing::debug!(url = %url, status, bytes = body.len(), "Remote response received");
    Ok(RemoteResponse {
        status,
        content_type,
        body,
    })
}

#[async_trait]
impl RemoteContentClient for HttpRemoteClient {
    async fn get(&self, path_and_query: &str) -> Result<RemoteResponse, RepoError> {
        let url = self.url(path_and_query);
        self.execute(self.http.get(&url), &url).await
    }

    async fn fetch_csrf_token(&self) -> Result<String, RepoError> {
        let url = self.url(&self.routes.csrf_token());
        let response = self.execute(self.http.get(&url), &url).await?;
        if !response.is_success() {
            tracing::error!(status = response.status, url = %url, "Failed to obtain CSRF token");
            return Err(RepoError::Status {
                status: response.status,
                body: String::from_utf8_lossy(&response.body).into_owned(),
                url,
            });
        }
        let token: CsrfToken = serde_json::from_slice(&response.body).map_err(|e| RepoError::Decode {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        tracing::info!("Obtained CSRF token for the remote session");
        Ok(token.token)
    }

    async fn send(
        &self,
        method: WriteMethod,
        path: &str,
        body: Value,
        csrf_token: &str,
    ) -> Result<RemoteResponse, RepoError> {
        let url = self.url(path);
        let request = match method {
            WriteMethod::Post => self.http.post(&url),
            WriteMethod::Put => self.http.put(&url),
        }
        .header(CSRF_HEADER, csrf_token)
        .header(REQUESTED_WITH_HEADER, "XMLHttpRequest")
        .json(&body);
        tracing::info!(?method, url = %url, "Sending write to remote");
        self.execute(request, &url).await
    }
}
