//! Local auth proxy.
//!
//! The repository's write endpoints need a CSRF token bound to the authenticated session. The
//! pipeline therefore sends every request to this short-lived loopback server, which owns the
//! token and the credentials:
//!
//! | route | behaviour |
//! |---|---|
//! | `GET <documents/content/sites api>/*` | forwarded verbatim with the stored auth |
//! | `POST /items?index=N` | creates the pending record `N` of the current pass |
//! | `PUT /items?index=N` | updates the item behind pending update `N` |
//! | `POST /bulkItemsOperations` | `{channelId, op, itemIds}` → remote bulk payload |
//! | `POST /jobs/publishjobs` | publish job over the accumulated publish set |
//!
//! The server binds `127.0.0.1:0` and lives for one `index-site` invocation.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{header, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::{PassTarget, PendingCreate, PendingUpdate, PendingWritesHandle};
use crate::contract::{
    BulkOperation, BulkRequest, PublishJobRequest, RemoteContentClient, RemoteResponse, WriteMethod,
};
use crate::error::{IndexError, RepoError};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// API roots on the remote server. Shared by the proxy and [`crate::repository::ProxyRepository`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRoutes {
    pub documents_api: String,
    pub content_api: String,
    pub sites_api: String,
}

impl Default for RemoteRoutes {
    fn default() -> Self {
        RemoteRoutes {
            documents_api: "/documents/api/1.2".to_string(),
            content_api: "/content/management/api/v1.1".to_string(),
            sites_api: "/sites/management/api/v1".to_string(),
        }
    }
}

impl RemoteRoutes {
    /// Reads under these API roots may be passed through. A root only matches whole path
    /// segments, and paths with `..` segments are never forwarded.
    pub fn is_passthrough(&self, path: &str) -> bool {
        if path.split('/').any(is_parent_segment) {
            return false;
        }
        [&self.documents_api, &self.content_api, &self.sites_api]
            .iter()
            .filter_map(|root| path.strip_prefix(root.trim_end_matches('/')))
            .any(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    pub fn csrf_token(&self) -> String {
        format!("{}/token", self.content_api)
    }

    pub fn site_by_name(&self, name: &str) -> String {
        format!("{}/sites/name:{name}", self.sites_api)
    }

    pub fn folder_items(&self, folder_id: &str) -> String {
        format!("{}/folders/{folder_id}/items", self.documents_api)
    }

    pub fn file_data(&self, file_id: &str) -> String {
        format!("{}/files/{file_id}/data", self.documents_api)
    }

    pub fn repository(&self, id: &str) -> String {
        format!("{}/repositories/{id}", self.content_api)
    }

    pub fn content_type(&self, name: &str) -> String {
        format!("{}/types/{name}", self.content_api)
    }

    pub fn localization_policy(&self, id: &str) -> String {
        format!("{}/localizationPolicies/{id}", self.content_api)
    }

    pub fn items(&self) -> String {
        format!("{}/items", self.content_api)
    }

    pub fn item(&self, id: &str) -> String {
        format!("{}/items/{id}", self.content_api)
    }

    pub fn bulk_items(&self) -> String {
        format!("{}/bulkItemsOperations", self.content_api)
    }

    pub fn publish_jobs(&self) -> String {
        format!("{}/jobs/publishjobs", self.content_api)
    }

    pub fn publish_job(&self, id: &str) -> String {
        format!("{}/jobs/publishjobs/{id}", self.content_api)
    }
}

fn is_parent_segment(segment: &str) -> bool {
    segment.replace("%2e", ".").replace("%2E", ".") == ".."
}

/// Everything the proxy is built from.
pub struct ProxyConfig {
    pub remote: Arc<dyn RemoteContentClient>,
    pub pending: PendingWritesHandle,
    pub routes: RemoteRoutes,
}

#[derive(Clone)]
struct ProxyState {
    remote: Arc<dyn RemoteContentClient>,
    csrf_token: Arc<str>,
    pending: PendingWritesHandle,
    routes: Arc<RemoteRoutes>,
}

/// Remote create payload for a pending record.
pub fn create_payload(target: &PassTarget, create: &PendingCreate) -> Value {
    let mut body = json!({
        "type": target.content_type,
        "name": create.record.item_name(),
        "description": "",
        "repositoryId": target.repository_id,
        "language": target.language,
        "translatable": true,
        "fields": create.record.to_fields(),
    });
    if !target.is_master {
        if let Some(source_id) = &create.source_id {
            body["sourceId"] = json!(source_id);
        }
    }
    body
}

/// Remote update payload for a pending update.
pub fn update_payload(target: &PassTarget, update: &PendingUpdate) -> Value {
    json!({
        "id": update.item_id,
        "type": target.content_type,
        "name": update.record.item_name(),
        "language": target.language,
        "fields": update.record.to_fields(),
    })
}

/// Remote bulk payload for a simplified bulk request.
pub fn bulk_payload(request: &BulkRequest) -> Value {
    let q = request
        .item_ids
        .iter()
        .map(|id| format!("id eq \"{id}\""))
        .collect::<Vec<_>>()
        .join(" or ");
    let channels = json!({ "channels": [{ "id": request.channel_id }] });
    let operations = match request.op {
        BulkOperation::AddChannels => json!({ "addChannels": channels }),
        BulkOperation::RemoveChannels => json!({ "removeChannels": channels }),
        BulkOperation::SetAsTranslated => json!({ "setAsTranslated": { "value": "true" } }),
        BulkOperation::DeleteItems => json!({ "deleteItems": { "value": "true" } }),
        BulkOperation::Unpublish => json!({ "unpublish": channels }),
    };
    json!({ "q": q, "operations": operations })
}

/// Remote publish job payload over `item_ids`.
pub fn publish_payload(request: &PublishJobRequest, item_ids: &[String]) -> Value {
    json!({
        "name": request.name,
        "channels": [{ "id": request.channel_id }],
        "items": item_ids.iter().map(|id| json!({ "id": id })).collect::<Vec<_>>(),
    })
}

fn forward(response: RemoteResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = response
        .content_type
        .unwrap_or_else(|| "application/json".to_string());
    (status, [(header::CONTENT_TYPE, content_type)], response.body).into_response()
}

fn remote_error(e: RepoError) -> Response {
    let status = match &e {
        RepoError::NotFound(_) => StatusCode::NOT_FOUND,
        RepoError::Status { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        RepoError::Transport(_) | RepoError::Decode { .. } => StatusCode::BAD_GATEWAY,
    };
    error!(error = %e, "[PROXY] Remote call failed");
    (status, e.to_string()).into_response()
}

async fn send_write(state: &ProxyState, method: WriteMethod, path: &str, body: Value) -> Response {
    debug!(?method, path = %path, "[PROXY] Forwarding write");
    match state
        .remote
        .send(method, path, body, &state.csrf_token)
        .await
    {
        Ok(response) => forward(response),
        Err(e) => remote_error(e),
    }
}

async fn pass_through(State(state): State<ProxyState>, method: Method, uri: Uri) -> Response {
    if method != Method::GET {
        return (StatusCode::METHOD_NOT_ALLOWED, "only GET is passed through").into_response();
    }
    if !state.routes.is_passthrough(uri.path()) {
        return (StatusCode::NOT_FOUND, format!("no route for {}", uri.path())).into_response();
    }
    let path_and_query = uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or_else(|| uri.path());
    debug!(path = %path_and_query, "[PROXY] Passing through read");
    match state.remote.get(path_and_query).await {
        Ok(response) => forward(response),
        Err(e) => remote_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct PendingIndex {
    index: usize,
}

async fn create_item(State(state): State<ProxyState>, Query(q): Query<PendingIndex>) -> Response {
    let pending = state.pending.read(|p| {
        let target = p.target.clone()?;
        p.creates.get(q.index).map(|c| (target, c.clone()))
    });
    let Some((target, create)) = pending else {
        warn!(index = q.index, "[PROXY] No pending create at index");
        return (StatusCode::NOT_FOUND, format!("no pending create at index {}", q.index))
            .into_response();
    };
    let body = create_payload(&target, &create);
    send_write(&state, WriteMethod::Post, &state.routes.items(), body).await
}

async fn update_item(State(state): State<ProxyState>, Query(q): Query<PendingIndex>) -> Response {
    let pending = state.pending.read(|p| {
        let target = p.target.clone()?;
        p.updates.get(q.index).map(|u| (target, u.clone()))
    });
    let Some((target, update)) = pending else {
        warn!(index = q.index, "[PROXY] No pending update at index");
        return (StatusCode::NOT_FOUND, format!("no pending update at index {}", q.index))
            .into_response();
    };
    let body = update_payload(&target, &update);
    send_write(&state, WriteMethod::Put, &state.routes.item(&update.item_id), body).await
}

async fn bulk_items(State(state): State<ProxyState>, Json(request): Json<BulkRequest>) -> Response {
    if request.item_ids.is_empty() {
        return (StatusCode::BAD_REQUEST, "itemIds must not be empty").into_response();
    }
    let body = bulk_payload(&request);
    send_write(&state, WriteMethod::Post, &state.routes.bulk_items(), body).await
}

async fn publish_job(
    State(state): State<ProxyState>,
    Json(request): Json<PublishJobRequest>,
) -> Response {
    let item_ids = state.pending.publish_ids();
    if item_ids.is_empty() {
        return (StatusCode::BAD_REQUEST, "nothing to publish").into_response();
    }
    info!(items = item_ids.len(), channel_id = %request.channel_id, "[PROXY] Submitting publish job");
    let body = publish_payload(&request, &item_ids);
    send_write(&state, WriteMethod::Post, &state.routes.publish_jobs(), body).await
}

fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/items", post(create_item).put(update_item))
        .route("/bulkItemsOperations", post(bulk_items))
        .route("/jobs/publishjobs", post(publish_job))
        .fallback(pass_through)
        .with_state(state)
}

/// A running proxy. Call [`LocalAuthProxy::shutdown`] when the invocation ends; dropping it
/// also signals the server to stop.
pub struct LocalAuthProxy {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl LocalAuthProxy {
    /// Fetches a CSRF token, binds a loopback port and starts serving.
    pub async fn start(config: ProxyConfig) -> Result<Self, IndexError> {
        let csrf_token = config.remote.fetch_csrf_token().await?;

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;

        let state = ProxyState {
            remote: config.remote,
            csrf_token: Arc::from(csrf_token),
            pending: config.pending,
            routes: Arc::new(config.routes),
        };
        let app = router(state);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                    info!("[PROXY] Shutting down local auth proxy");
                })
                .await;
            if let Err(e) = served {
                error!(error = ?e, "[PROXY] Local auth proxy stopped with error");
            }
        });

        info!(addr = %addr, "[PROXY] Local auth proxy listening");
        Ok(LocalAuthProxy {
            addr,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stops the server and waits for it to finish, aborting it after a short grace period.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("[PROXY] Proxy did not stop within the grace period, aborting");
                task.abort();
            }
        }
    }
}

impl Drop for LocalAuthProxy {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
