//! # contract: seams between the indexing pipeline and the remote content repository
//!
//! Two traits live here:
//! - [`RemoteContentClient`]: the raw, authenticated HTTP client for the repository. It is an
//!   external collaborator; the CLI crate ships the reqwest implementation. Only the
//!   [`crate::proxy::LocalAuthProxy`] talks to it.
//! - [`SiteRepository`]: the pipeline's view of the repository. The production implementation
//!   ([`crate::repository::ProxyRepository`]) sends every request through the local proxy.
//!
//! Both traits are annotated for `mockall` so the pipeline and the proxy can be exercised
//! without a network.
//!
//! The request/response types below mirror the JSON documents exchanged with the repository.

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RepoError;

/// A site as returned by the site lookup endpoint. The site id doubles as its folder id.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SiteSummary {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// One entry of a folder listing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FolderEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub name: String,
}

impl FolderEntry {
    pub fn is_folder(&self) -> bool {
        self.kind == "folder"
    }

    pub fn is_file(&self) -> bool {
        self.kind == "file"
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NamedRef {
    pub name: String,
}

/// Repository metadata: which content types it accepts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content_types: Vec<NamedRef>,
}

impl Repository {
    pub fn has_content_type(&self, name: &str) -> bool {
        self.content_types.iter().any(|t| t.name == name)
    }
}

/// Field declaration of a content type.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub datatype: String,
    #[serde(default)]
    pub valuecount: Option<String>,
    #[serde(default)]
    pub settings: Option<Value>,
}

impl FieldDefinition {
    pub fn is_text(&self) -> bool {
        matches!(self.datatype.as_str(), "text" | "largetext")
    }

    pub fn is_list(&self) -> bool {
        self.valuecount.as_deref() == Some("list")
    }

    pub fn is_rich_text(&self) -> bool {
        self.settings
            .as_ref()
            .and_then(|s| s.pointer("/caas/editor/name"))
            .and_then(Value::as_str)
            == Some("rich-text-editor")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContentType {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

impl ContentType {
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Which locales a site must (required) or may (optional) carry besides its default.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalizationPolicy {
    #[serde(default, alias = "defaultValue")]
    pub default_language: Option<String>,
    #[serde(default)]
    pub required_values: Vec<String>,
    #[serde(default)]
    pub optional_values: Vec<String>,
}

impl LocalizationPolicy {
    /// Required then optional locales, deduplicated, without `default_language`.
    pub fn additional_locales(&self, default_language: &str) -> Vec<String> {
        let mut locales: Vec<String> = Vec::new();
        for locale in self.required_values.iter().chain(&self.optional_values) {
            if locale != default_language && !locales.contains(locale) {
                locales.push(locale.clone());
            }
        }
        locales
    }
}

/// A content item as returned by item reads and queries (`fields=ALL`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    pub id: String,
    #[serde(rename = "type", default)]
    pub item_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub is_published: bool,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

/// One page of an item query.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPage {
    #[serde(default)]
    pub items: Vec<ContentItem>,
    #[serde(default)]
    pub has_more: bool,
}

/// Item query against the repository.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemQuery {
    pub content_type: Option<String>,
    pub language: Option<String>,
    pub channel_id: Option<String>,
    /// Extra query clause, AND-ed with the others.
    pub filter: Option<String>,
    pub order_by: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl ItemQuery {
    pub fn to_q(&self) -> String {
        let mut clauses = Vec::new();
        if let Some(t) = &self.content_type {
            clauses.push(format!("type eq \"{t}\""));
        }
        if let Some(l) = &self.language {
            clauses.push(format!("language eq \"{l}\""));
        }
        if let Some(c) = &self.channel_id {
            clauses.push(format!("channels co \"{c}\""));
        }
        if let Some(f) = self.filter.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
            clauses.push(f.to_string());
        }
        clauses
            .iter()
            .map(|c| format!("({c})"))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("q", self.to_q()),
            ("limit", self.limit.to_string()),
            ("offset", self.offset.to_string()),
            ("fields", "ALL".to_string()),
        ];
        if let Some(order_by) = &self.order_by {
            params.push(("orderBy", order_by.clone()));
        }
        params
    }
}

/// Response of an item create or update.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreatedItem {
    pub id: String,
}

/// Bulk operations understood by the proxy's `/bulkItemsOperations` route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BulkOperation {
    AddChannels,
    RemoveChannels,
    SetAsTranslated,
    DeleteItems,
    Unpublish,
}

/// Simplified bulk request sent to the proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRequest {
    pub channel_id: String,
    pub op: BulkOperation,
    pub item_ids: Vec<String>,
}

/// Publish job submission sent to the proxy; the proxy fills in the item ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishJobRequest {
    pub channel_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubmittedJob {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JobError {
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// Raw job status document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JobStatus {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub progress: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<JobError>,
}

/// Interpreted job state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Running,
    Success,
    Failed(String),
}

impl JobStatus {
    pub fn state(&self) -> JobState {
        match self.status.to_ascii_lowercase().as_str() {
            "success" => JobState::Success,
            "failed" => {
                let message = self
                    .error
                    .as_ref()
                    .and_then(|e| e.detail.clone().or_else(|| e.title.clone()))
                    .or_else(|| self.message.clone())
                    .unwrap_or_else(|| "publish job failed".to_string());
                JobState::Failed(message)
            }
            _ => JobState::Running,
        }
    }
}

/// A response from the remote repository, reduced to what the proxy forwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl RemoteResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMethod {
    Post,
    Put,
}

/// Raw authenticated access to the remote repository.
///
/// `get` is used for transparent pass-through reads; `send` performs a write and must attach
/// the CSRF token obtained from [`RemoteContentClient::fetch_csrf_token`].
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait RemoteContentClient: Send + Sync {
    /// GET `path_and_query` (relative to the server root) with the stored credentials.
    async fn get(&self, path_and_query: &str) -> Result<RemoteResponse, RepoError>;

    /// Obtain a CSRF token for the current session.
    async fn fetch_csrf_token(&self) -> Result<String, RepoError>;

    /// Send a JSON write request carrying the CSRF token.
    async fn send(
        &self,
        method: WriteMethod,
        path: &str,
        body: Value,
        csrf_token: &str,
    ) -> Result<RemoteResponse, RepoError>;
}

/// Everything the indexing pipeline needs from the repository.
///
/// `create_item` / `update_item` take a position into the pending writes of the current
/// locale pass (see [`crate::context::PendingWrites`]); the implementor resolves the record.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait SiteRepository: Send + Sync {
    async fn find_site(&self, name: &str) -> Result<SiteSummary, RepoError>;

    async fn list_folder(&self, folder_id: &str) -> Result<Vec<FolderEntry>, RepoError>;

    async fn read_file(&self, file_id: &str) -> Result<Vec<u8>, RepoError>;

    async fn get_repository(&self, id: &str) -> Result<Repository, RepoError>;

    async fn get_content_type(&self, name: &str) -> Result<ContentType, RepoError>;

    async fn get_localization_policy(&self, id: &str) -> Result<LocalizationPolicy, RepoError>;

    async fn query_items(&self, query: &ItemQuery) -> Result<ItemPage, RepoError>;

    async fn get_item(&self, id: &str) -> Result<ContentItem, RepoError>;

    /// Create the pending record at `index`.
    async fn create_item(&self, index: usize) -> Result<CreatedItem, RepoError>;

    /// Update the item behind the pending update at `index`.
    async fn update_item(&self, index: usize) -> Result<CreatedItem, RepoError>;

    async fn bulk_operation(&self, request: &BulkRequest) -> Result<(), RepoError>;

    /// Submit a publish job covering the accumulated publish set; returns the job id.
    async fn submit_publish_job(&self, request: &PublishJobRequest) -> Result<String, RepoError>;

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, RepoError>;
}
