//! [`SiteRepository`] over the local auth proxy.
//!
//! Reads use the repository's own paths and are passed through by the proxy; writes use the
//! proxy's simplified routes and reference pending records by position.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::contract::{
    BulkRequest, ContentItem, ContentType, CreatedItem, FolderEntry, ItemPage, ItemQuery, JobStatus,
    LocalizationPolicy, PublishJobRequest, Repository, SiteRepository, SiteSummary, SubmittedJob,
};
use crate::error::RepoError;
use crate::proxy::RemoteRoutes;

#[derive(Deserialize)]
struct FolderListing {
    #[serde(default)]
    items: Vec<FolderEntry>,
}

pub struct ProxyRepository {
    http: Client,
    base_url: String,
    routes: RemoteRoutes,
}

impl ProxyRepository {
    pub fn new(base_url: impl Into<String>, routes: RemoteRoutes) -> Self {
        ProxyRepository {
            // The proxy is on loopback; never route it through an environment proxy.
            http: Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            routes,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute(&self, request: RequestBuilder, url: &str) -> Result<Response, RepoError> {
        let response = request
            .send()
            .await
            .map_err(|e| RepoError::Transport(format!("{url}: {e}")))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RepoError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<Failed to decode response body>"));
            return Err(RepoError::Status {
                status: status.as_u16(),
                url: url.to_string(),
                body,
            });
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(response: Response, url: &str) -> Result<T, RepoError> {
        response.json::<T>().await.map_err(|e| RepoError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, RepoError> {
        let url = self.url(path);
        let response = self.execute(self.http.get(&url).query(query), &url).await?;
        Self::decode(response, &url).await
    }

    async fn write<B, T>(&self, method: Method, path: &str, query: &[(&str, String)], body: Option<&B>) -> Result<T, RepoError>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        let mut request = self.http.request(method, &url).query(query);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = self.execute(request, &url).await?;
        Self::decode(response, &url).await
    }
}

#[async_trait]
impl SiteRepository for ProxyRepository {
    async fn find_site(&self, name: &str) -> Result<SiteSummary, RepoError> {
        self.get_json(&self.routes.site_by_name(name), &[("fields", "id,name".to_string())])
            .await
    }

    async fn list_folder(&self, folder_id: &str) -> Result<Vec<FolderEntry>, RepoError> {
        let listing: FolderListing = self.get_json(&self.routes.folder_items(folder_id), &[]).await?;
        Ok(listing.items)
    }

    async fn read_file(&self, file_id: &str) -> Result<Vec<u8>, RepoError> {
        let url = self.url(&self.routes.file_data(file_id));
        let response = self.execute(self.http.get(&url), &url).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RepoError::Transport(format!("{url}: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn get_repository(&self, id: &str) -> Result<Repository, RepoError> {
        self.get_json(&self.routes.repository(id), &[("fields", "all".to_string())])
            .await
    }

    async fn get_content_type(&self, name: &str) -> Result<ContentType, RepoError> {
        self.get_json(&self.routes.content_type(name), &[]).await
    }

    async fn get_localization_policy(&self, id: &str) -> Result<LocalizationPolicy, RepoError> {
        self.get_json(&self.routes.localization_policy(id), &[]).await
    }

    async fn query_items(&self, query: &ItemQuery) -> Result<ItemPage, RepoError> {
        self.get_json(&self.routes.items(), &query.to_params()).await
    }

    async fn get_item(&self, id: &str) -> Result<ContentItem, RepoError> {
        self.get_json(&self.routes.item(id), &[("fields", "ALL".to_string())])
            .await
    }

    async fn create_item(&self, index: usize) -> Result<CreatedItem, RepoError> {
        self.write::<(), _>(Method::POST, "/items", &[("index", index.to_string())], None)
            .await
    }

    async fn update_item(&self, index: usize) -> Result<CreatedItem, RepoError> {
        self.write::<(), _>(Method::PUT, "/items", &[("index", index.to_string())], None)
            .await
    }

    async fn bulk_operation(&self, request: &BulkRequest) -> Result<(), RepoError> {
        let url = self.url("/bulkItemsOperations");
        self.execute(self.http.post(&url).json(request), &url).await?;
        Ok(())
    }

    async fn submit_publish_job(&self, request: &PublishJobRequest) -> Result<String, RepoError> {
        let job: SubmittedJob = self
            .write(Method::POST, "/jobs/publishjobs", &[], Some(request))
            .await?;
        Ok(job.id)
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, RepoError> {
        self.get_json(&self.routes.publish_job(job_id), &[]).await
    }
}
