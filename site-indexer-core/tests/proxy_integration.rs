use std::sync::Arc;

use serde_json::{json, Value};

use site_indexer_core::config::IndexRequest;
use site_indexer_core::context::{PassTarget, PendingCreate, PendingWritesHandle, RunControl};
use site_indexer_core::contract::{
    BulkOperation, BulkRequest, MockRemoteContentClient, PublishJobRequest, RemoteResponse,
    SiteRepository, WriteMethod,
};
use site_indexer_core::error::{IndexError, RepoError};
use site_indexer_core::proxy::{LocalAuthProxy, ProxyConfig, RemoteRoutes};
use site_indexer_core::record::PageIndexRecord;
use site_indexer_core::repository::ProxyRepository;
use site_indexer_core::synchronise::run_index_site;

fn json_response(status: u16, body: Value) -> RemoteResponse {
    RemoteResponse {
        status,
        content_type: Some("application/json".into()),
        body: body.to_string().into_bytes(),
    }
}

async fn start(remote: MockRemoteContentClient, pending: PendingWritesHandle) -> (LocalAuthProxy, ProxyRepository) {
    let proxy = LocalAuthProxy::start(ProxyConfig {
        remote: Arc::new(remote),
        pending,
        routes: RemoteRoutes::default(),
    })
    .await
    .expect("proxy should start");
    let repo = ProxyRepository::new(proxy.base_url(), RemoteRoutes::default());
    (proxy, repo)
}

fn remote_with_token() -> MockRemoteContentClient {
    let mut remote = MockRemoteContentClient::new();
    remote
        .expect_fetch_csrf_token()
        .times(1)
        .returning(|| Ok("CSRF-TOKEN".into()));
    remote
}

#[tokio::test]
async fn proxy_binds_loopback_and_passes_reads_through() {
    let mut remote = remote_with_token();
    remote
        .expect_get()
        .withf(|path| path.starts_with("/sites/management/api/v1/sites/name:blog"))
        .times(1)
        .returning(|_| Ok(json_response(200, json!({"id": "SITE1", "name": "blog"}))));
    remote
        .expect_get()
        .withf(|path| path == "/documents/api/1.2/files/F1/data")
        .returning(|_| {
            Ok(RemoteResponse {
                status: 200,
                content_type: Some("application/octet-stream".into()),
                body: b"{\"pages\":[]}".to_vec(),
            })
        });

    let (proxy, repo) = start(remote, PendingWritesHandle::default()).await;
    assert!(proxy.addr().ip().is_loopback());

    let site = repo.find_site("blog").await.expect("site lookup");
    assert_eq!(site.id, "SITE1");
    let bytes = repo.read_file("F1").await.expect("file read");
    assert_eq!(bytes, b"{\"pages\":[]}".to_vec());

    proxy.shutdown().await;
}

#[tokio::test]
async fn remote_not_found_surfaces_as_not_found() {
    let mut remote = remote_with_token();
    remote
        .expect_get()
        .returning(|path| Err(RepoError::NotFound(path.to_string())));

    let (proxy, repo) = start(remote, PendingWritesHandle::default()).await;
    let err = repo.list_folder("NOPE").await.unwrap_err();
    assert!(err.is_not_found(), "unexpected error {err:?}");
    proxy.shutdown().await;
}

#[tokio::test]
async fn create_resolves_pending_record_and_injects_csrf_token() {
    let mut remote = remote_with_token();
    remote
        .expect_send()
        .withf(|method, path, body, token| {
            *method == WriteMethod::Post
                && path == "/content/management/api/v1.1/items"
                && token == "CSRF-TOKEN"
                && body["sourceId"] == "MASTER2"
                && body["language"] == "fr-FR"
                && body["name"] == "blog_fr-FR_2"
                && body["fields"]["pageid"] == "fr-FR_2"
        })
        .times(1)
        .returning(|_, _, _, _| Ok(json_response(201, json!({"id": "LOCALE2"}))));

    let pending = PendingWritesHandle::default();
    pending.begin_pass(
        PassTarget {
            repository_id: "REPO1".into(),
            content_type: "SiteIndex".into(),
            language: "fr-FR".into(),
            is_master: false,
        },
        vec![PendingCreate {
            record: PageIndexRecord {
                site: "blog".into(),
                pageid: "fr-FR_2".into(),
                ..Default::default()
            },
            source_id: Some("MASTER2".into()),
        }],
        Vec::new(),
    );

    let (proxy, repo) = start(remote, pending).await;
    let created = repo.create_item(0).await.expect("create through proxy");
    assert_eq!(created.id, "LOCALE2");

    let missing = repo.create_item(7).await.unwrap_err();
    assert!(missing.is_not_found());
    let no_update = repo.update_item(0).await.unwrap_err();
    assert!(no_update.is_not_found());

    proxy.shutdown().await;
}

#[tokio::test]
async fn bulk_and_publish_requests_are_expanded() {
    let mut remote = remote_with_token();
    remote
        .expect_send()
        .withf(|_, path, body, _| {
            path.ends_with("/bulkItemsOperations")
                && body["q"] == "id eq \"A\" or id eq \"B\""
                && body["operations"]["addChannels"]["channels"][0]["id"] == "CH1"
        })
        .times(1)
        .returning(|_, _, _, _| Ok(json_response(202, json!({}))));
    remote
        .expect_send()
        .withf(|_, path, body, _| {
            path.ends_with("/jobs/publishjobs")
                && body["channels"][0]["id"] == "CH1"
                && body["items"] == json!([{"id": "A"}, {"id": "B"}])
        })
        .times(1)
        .returning(|_, _, _, _| Ok(json_response(202, json!({"id": "JOB9"}))));

    let pending = PendingWritesHandle::default();
    pending.add_publish_ids(vec!["A".to_string(), "B".to_string()]);
    let (proxy, repo) = start(remote, pending).await;

    repo.bulk_operation(&BulkRequest {
        channel_id: "CH1".into(),
        op: BulkOperation::AddChannels,
        item_ids: vec!["A".into(), "B".into()],
    })
    .await
    .expect("bulk through proxy");

    let job = repo
        .submit_publish_job(&PublishJobRequest {
            channel_id: "CH1".into(),
            name: "index-site-test".into(),
        })
        .await
        .expect("publish job through proxy");
    assert_eq!(job, "JOB9");

    proxy.shutdown().await;
}

#[tokio::test]
async fn unknown_routes_are_rejected() {
    let remote = remote_with_token();
    let (proxy, _repo) = start(remote, PendingWritesHandle::default()).await;

    let client = reqwest::Client::new();
    let outside = client
        .get(format!("{}/admin/settings", proxy.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(outside.status(), reqwest::StatusCode::NOT_FOUND);

    let write = client
        .delete(format!("{}/content/management/api/v1.1/items/X", proxy.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(write.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);

    let empty_bulk = client
        .post(format!("{}/bulkItemsOperations", proxy.base_url()))
        .json(&json!({"channelId": "CH1", "op": "deleteItems", "itemIds": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(empty_bulk.status(), reqwest::StatusCode::BAD_REQUEST);

    proxy.shutdown().await;
}

#[tokio::test]
async fn cancelled_run_does_not_start_the_proxy() {
    let mut remote = MockRemoteContentClient::new();
    remote.expect_fetch_csrf_token().never();
    remote.expect_get().never();
    let control = RunControl::new();
    control.cancel_token().cancel();

    let result = run_index_site(
        Arc::new(remote),
        RemoteRoutes::default(),
        IndexRequest::new("blog", "SiteIndex"),
        control,
    )
    .await;
    assert!(matches!(result, Err(IndexError::Cancelled)), "got {result:?}");
}
