use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use site_indexer_core::config::IndexRequest;
use site_indexer_core::context::{IndexContext, PendingWritesHandle, RunControl};
use site_indexer_core::contract::{
    BulkOperation, BulkRequest, ContentItem, ContentType, CreatedItem, FieldDefinition, FolderEntry,
    ItemPage, ItemQuery, JobStatus, LocalizationPolicy, MockSiteRepository, NamedRef,
    PublishJobRequest, Repository, SiteRepository, SiteSummary,
};
use site_indexer_core::error::{IndexError, RepoError};
use site_indexer_core::publish::PublishCoordinator;
use site_indexer_core::record::PageIndexRecord;
use site_indexer_core::synchronise::synchronise;

const SITE: &str = "blog";
const INDEX_TYPE: &str = "SiteIndex";

fn file(id: &str, name: &str) -> FolderEntry {
    FolderEntry {
        kind: "file".into(),
        id: id.into(),
        name: name.into(),
    }
}

fn folder(id: &str, name: &str) -> FolderEntry {
    FolderEntry {
        kind: "folder".into(),
        id: id.into(),
        name: name.into(),
    }
}

fn field(name: &str, datatype: &str, valuecount: Option<&str>) -> FieldDefinition {
    FieldDefinition {
        name: name.into(),
        datatype: datatype.into(),
        valuecount: valuecount.map(str::to_string),
        settings: None,
    }
}

fn index_type() -> ContentType {
    ContentType {
        name: INDEX_TYPE.into(),
        fields: vec![
            field("site", "text", None),
            field("pageid", "text", None),
            field("pagename", "text", None),
            field("pageurl", "text", None),
            field("pagetitle", "text", None),
            field("pagedescription", "largetext", None),
            field("keywords", "text", Some("list")),
        ],
    }
}

fn page_json(title: &str, text: &str) -> Value {
    json!({
        "properties": {"title": title, "pageDescription": format!("About {title}")},
        "componentInstances": {
            "p1": {"type": "scs-paragraph", "data": {"userText": format!("<p>{text}</p>")}}
        }
    })
}

#[derive(Debug, Clone, PartialEq)]
struct CreateCall {
    language: String,
    pageid: String,
    source_id: Option<String>,
    item_id: String,
}

#[derive(Default)]
struct State {
    folders: HashMap<String, Vec<FolderEntry>>,
    files: HashMap<String, Vec<u8>>,
    items: Vec<ContentItem>,
    next_id: usize,
    creates: Vec<CreateCall>,
    updates: Vec<String>,
    bulk: Vec<BulkRequest>,
    published: Vec<Vec<String>>,
    job_statuses: VecDeque<JobStatus>,
    failing_create_language: Option<String>,
}

/// In-memory repository holding one site and its stored index items.
struct FakeRepository {
    pending: Mutex<PendingWritesHandle>,
    state: Mutex<State>,
}

impl FakeRepository {
    /// Site `blog` with pages 1, 2 and 3, an `en-US` default and an optional `fr-FR` locale.
    fn new() -> Self {
        let mut state = State::default();
        state.folders.insert(
            "SITE".into(),
            vec![
                folder("PAGES", "pages"),
                file("F-STRUCTURE", "structure.json"),
                file("F-SITEINFO", "siteinfo.json"),
            ],
        );
        state.folders.insert(
            "PAGES".into(),
            vec![file("F-1", "1.json"), file("F-2", "2.json"), file("F-3", "3.json")],
        );
        state.files.insert(
            "F-STRUCTURE".into(),
            json!({"pages": [
                {"id": 1, "name": "Home", "pageUrl": "index.html"},
                {"id": 2, "name": "News", "pageUrl": "news.html", "parentId": 1},
                {"id": 3, "name": "Contact", "pageUrl": "contact.html", "parentId": 1}
            ]})
            .to_string()
            .into_bytes(),
        );
        state.files.insert(
            "F-SITEINFO".into(),
            json!({"properties": {
                "siteName": SITE,
                "defaultLanguage": "en-US",
                "repositoryId": "REPO1",
                "channelId": "CHANNEL1",
                "localizationPolicy": "POLICY1"
            }})
            .to_string()
            .into_bytes(),
        );
        let mut news = page_json("News", "Latest news");
        news["componentInstances"]["article"] =
            json!({"type": "scs-component", "data": {"contentId": "CORE1"}});
        state.files.insert("F-1".into(), page_json("Home", "Welcome home").to_string().into_bytes());
        state.files.insert("F-2".into(), news.to_string().into_bytes());
        state.files.insert("F-3".into(), page_json("Contact", "Write to us").to_string().into_bytes());

        FakeRepository {
            pending: Mutex::new(PendingWritesHandle::default()),
            state: Mutex::new(state),
        }
    }

    fn context(&self, publish: bool) -> IndexContext {
        let mut request = IndexRequest::new(SITE, INDEX_TYPE);
        request.publish = publish;
        request.poll_interval = Duration::from_millis(5);
        request.publish_timeout = Duration::from_secs(5);
        let ctx = IndexContext::new(request, RunControl::new());
        *self.pending.lock().unwrap() = ctx.pending.clone();
        ctx
    }

    fn pending(&self) -> PendingWritesHandle {
        self.pending.lock().unwrap().clone()
    }

    fn add_french_locale(&self) {
        let mut state = self.state.lock().unwrap();
        state.folders.get_mut("SITE").unwrap().extend([
            file("F-FR-STRUCTURE", "fr-FR_structure.json"),
            file("F-FR-SITEINFO", "fr-FR_siteinfo.json"),
        ]);
        state
            .folders
            .get_mut("PAGES")
            .unwrap()
            .push(file("F-FR-1", "fr-FR_1.json"));
        state.files.insert(
            "F-FR-STRUCTURE".into(),
            json!({"pages": [{"id": 1, "name": "Accueil", "pageUrl": "index.html"}]})
                .to_string()
                .into_bytes(),
        );
        state.files.insert(
            "F-FR-SITEINFO".into(),
            json!({"properties": {"siteName": SITE, "defaultLanguage": "fr-FR"}})
                .to_string()
                .into_bytes(),
        );
        state.files.insert(
            "F-FR-1".into(),
            page_json("Accueil", "Bienvenue").to_string().into_bytes(),
        );
    }

    fn remove_page_3(&self) {
        let mut state = self.state.lock().unwrap();
        state.files.insert(
            "F-STRUCTURE".into(),
            json!({"pages": [
                {"id": 1, "name": "Home", "pageUrl": "index.html"},
                {"id": 2, "name": "News", "pageUrl": "news.html", "parentId": 1}
            ]})
            .to_string()
            .into_bytes(),
        );
        state.folders.get_mut("PAGES").unwrap().retain(|f| f.name != "3.json");
    }

    fn mark_all_published(&self) {
        for item in &mut self.state.lock().unwrap().items {
            item.is_published = true;
        }
    }

    fn item_id_of(&self, pageid: &str) -> String {
        let state = self.state.lock().unwrap();
        state
            .items
            .iter()
            .find(|i| PageIndexRecord::from_fields(&i.fields).pageid == pageid)
            .map(|i| i.id.clone())
            .unwrap()
    }
}

fn not_found(what: &str) -> RepoError {
    RepoError::NotFound(what.to_string())
}

#[async_trait]
impl SiteRepository for FakeRepository {
    async fn find_site(&self, name: &str) -> Result<SiteSummary, RepoError> {
        if name == SITE {
            Ok(SiteSummary {
                id: "SITE".into(),
                name: name.into(),
            })
        } else {
            Err(not_found(name))
        }
    }

    async fn list_folder(&self, folder_id: &str) -> Result<Vec<FolderEntry>, RepoError> {
        let state = self.state.lock().unwrap();
        state.folders.get(folder_id).cloned().ok_or_else(|| not_found(folder_id))
    }

    async fn read_file(&self, file_id: &str) -> Result<Vec<u8>, RepoError> {
        let state = self.state.lock().unwrap();
        state.files.get(file_id).cloned().ok_or_else(|| not_found(file_id))
    }

    async fn get_repository(&self, id: &str) -> Result<Repository, RepoError> {
        Ok(Repository {
            id: id.into(),
            name: "Site Content".into(),
            content_types: vec![
                NamedRef { name: INDEX_TYPE.into() },
                NamedRef { name: "Article".into() },
            ],
        })
    }

    async fn get_content_type(&self, name: &str) -> Result<ContentType, RepoError> {
        match name {
            INDEX_TYPE => Ok(index_type()),
            "Article" => Ok(ContentType {
                name: "Article".into(),
                fields: vec![field("body", "largetext", None), field("rank", "number", None)],
            }),
            other => Err(not_found(other)),
        }
    }

    async fn get_localization_policy(&self, _id: &str) -> Result<LocalizationPolicy, RepoError> {
        Ok(LocalizationPolicy {
            default_language: Some("en-US".into()),
            required_values: vec!["en-US".into()],
            optional_values: vec!["fr-FR".into()],
        })
    }

    async fn query_items(&self, query: &ItemQuery) -> Result<ItemPage, RepoError> {
        let state = self.state.lock().unwrap();
        let matching: Vec<ContentItem> = state
            .items
            .iter()
            .filter(|i| Some(&i.item_type) == query.content_type.as_ref())
            .filter(|i| i.language == query.language)
            .cloned()
            .collect();
        let page: Vec<ContentItem> = matching
            .iter()
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect();
        Ok(ItemPage {
            has_more: query.offset + page.len() < matching.len(),
            items: page,
        })
    }

    async fn get_item(&self, id: &str) -> Result<ContentItem, RepoError> {
        if id == "CORE1" {
            Ok(ContentItem {
                id: "CORE1".into(),
                item_type: "Article".into(),
                name: "Harbour opening".into(),
                description: Some("The harbour reopens".into()),
                fields: json!({"body": "Boats are back", "rank": 3})
                    .as_object()
                    .unwrap()
                    .clone(),
                ..Default::default()
            })
        } else {
            Err(not_found(id))
        }
    }

    async fn create_item(&self, index: usize) -> Result<CreatedItem, RepoError> {
        let (target, create) = self
            .pending()
            .read(|p| (p.target.clone(), p.creates.get(index).cloned()));
        let (target, create) = target.zip(create).ok_or_else(|| not_found("pending create"))?;
        let mut state = self.state.lock().unwrap();
        if state.failing_create_language.as_deref() == Some(target.language.as_str()) {
            return Err(RepoError::Status {
                status: 500,
                url: "/content/management/api/v1.1/items".into(),
                body: "repository unavailable".into(),
            });
        }
        state.next_id += 1;
        let item_id = format!("ITEM{}", state.next_id);
        state.items.push(ContentItem {
            id: item_id.clone(),
            item_type: target.content_type.clone(),
            name: create.record.item_name(),
            language: Some(target.language.clone()),
            fields: create.record.to_fields(),
            ..Default::default()
        });
        state.creates.push(CreateCall {
            language: target.language,
            pageid: create.record.pageid,
            source_id: create.source_id,
            item_id: item_id.clone(),
        });
        Ok(CreatedItem { id: item_id })
    }

    async fn update_item(&self, index: usize) -> Result<CreatedItem, RepoError> {
        let update = self
            .pending()
            .read(|p| p.updates.get(index).cloned())
            .ok_or_else(|| not_found("pending update"))?;
        let mut state = self.state.lock().unwrap();
        let item = state
            .items
            .iter_mut()
            .find(|i| i.id == update.item_id)
            .ok_or_else(|| not_found(&update.item_id))?;
        item.fields = update.record.to_fields();
        state.updates.push(update.item_id.clone());
        Ok(CreatedItem { id: update.item_id })
    }

    async fn bulk_operation(&self, request: &BulkRequest) -> Result<(), RepoError> {
        let mut state = self.state.lock().unwrap();
        match request.op {
            BulkOperation::DeleteItems => state.items.retain(|i| !request.item_ids.contains(&i.id)),
            BulkOperation::Unpublish => state
                .items
                .iter_mut()
                .filter(|i| request.item_ids.contains(&i.id))
                .for_each(|i| i.is_published = false),
            _ => {}
        }
        state.bulk.push(request.clone());
        Ok(())
    }

    async fn submit_publish_job(&self, _request: &PublishJobRequest) -> Result<String, RepoError> {
        let ids = self.pending().publish_ids();
        self.state.lock().unwrap().published.push(ids);
        Ok("JOB1".into())
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, RepoError> {
        let mut state = self.state.lock().unwrap();
        Ok(state.job_statuses.pop_front().unwrap_or(JobStatus {
            id: job_id.into(),
            status: "SUCCESS".into(),
            ..Default::default()
        }))
    }
}

fn ops(bulk: &[BulkRequest]) -> Vec<BulkOperation> {
    bulk.iter().map(|b| b.op).collect()
}

#[tokio::test]
async fn new_site_creates_one_item_per_page_and_publishes_them() {
    let repo = FakeRepository::new();
    let report = synchronise(&repo, repo.context(true))
        .await
        .expect("synchronise should succeed");

    let state = repo.state.lock().unwrap();
    let pageids: Vec<&str> = state.creates.iter().map(|c| c.pageid.as_str()).collect();
    assert_eq!(pageids, vec!["1", "2", "3"]);
    assert!(state.creates.iter().all(|c| c.language == "en-US" && c.source_id.is_none()));

    let created: Vec<String> = state.creates.iter().map(|c| c.item_id.clone()).collect();
    assert_eq!(ops(&state.bulk), vec![BulkOperation::AddChannels]);
    assert_eq!(state.bulk[0].item_ids, created);
    assert_eq!(state.bulk[0].channel_id, "CHANNEL1");
    assert_eq!(state.published, vec![created.clone()]);

    assert_eq!(report.passes.len(), 2);
    assert_eq!(report.passes[0].created, created);
    assert!(report.passes[1].skipped, "fr-FR has no override files");
    let published = report.published.expect("publish report");
    assert_eq!(published.job_id, "JOB1");
    assert_eq!(published.item_ids, created);
}

#[tokio::test]
async fn keywords_include_component_and_content_item_text() {
    let repo = FakeRepository::new();
    synchronise(&repo, repo.context(false)).await.unwrap();

    let state = repo.state.lock().unwrap();
    let news = state
        .items
        .iter()
        .map(|i| PageIndexRecord::from_fields(&i.fields))
        .find(|r| r.pageid == "2")
        .unwrap();
    assert_eq!(news.pagetitle, "News");
    assert_eq!(news.pagedescription, "About News");
    assert_eq!(
        news.keywords,
        vec!["Latest news Harbour opening The harbour reopens Boats are back".to_string()]
    );
}

#[tokio::test]
async fn unchanged_site_makes_no_writes_on_second_run() {
    let repo = FakeRepository::new();
    synchronise(&repo, repo.context(false)).await.unwrap();
    let (creates, bulk) = {
        let state = repo.state.lock().unwrap();
        (state.creates.len(), state.bulk.len())
    };

    let report = synchronise(&repo, repo.context(false)).await.unwrap();

    let state = repo.state.lock().unwrap();
    assert_eq!(state.creates.len(), creates);
    assert_eq!(state.bulk.len(), bulk);
    assert!(state.updates.is_empty());
    assert_eq!(report.passes[0].unchanged, 3);
    assert!(report.passes[0].created.is_empty() && report.passes[0].deleted.is_empty());
}

#[tokio::test]
async fn removed_page_is_unpublished_removed_from_channel_and_deleted() {
    let repo = FakeRepository::new();
    synchronise(&repo, repo.context(false)).await.unwrap();
    repo.mark_all_published();
    let removed = repo.item_id_of("3");
    repo.remove_page_3();
    repo.state.lock().unwrap().bulk.clear();

    let report = synchronise(&repo, repo.context(false)).await.unwrap();

    let state = repo.state.lock().unwrap();
    assert_eq!(
        ops(&state.bulk),
        vec![
            BulkOperation::Unpublish,
            BulkOperation::RemoveChannels,
            BulkOperation::DeleteItems
        ]
    );
    assert!(state.bulk.iter().all(|b| b.item_ids == vec![removed.clone()]));
    assert_eq!(report.passes[0].deleted, vec![removed.clone()]);
    assert!(state.items.iter().all(|i| i.id != removed));
    assert!(state.updates.is_empty());
}

#[tokio::test]
async fn locale_records_reference_their_master_items() {
    let repo = FakeRepository::new();
    repo.add_french_locale();

    let report = synchronise(&repo, repo.context(true)).await.unwrap();

    let state = repo.state.lock().unwrap();
    let master: HashMap<&str, &str> = state
        .creates
        .iter()
        .filter(|c| c.language == "en-US")
        .map(|c| (c.pageid.as_str(), c.item_id.as_str()))
        .collect();
    let french: Vec<&CreateCall> = state.creates.iter().filter(|c| c.language == "fr-FR").collect();
    assert_eq!(french.len(), 3);
    for create in &french {
        let master_page = create.pageid.strip_prefix("fr-FR_").unwrap();
        assert_eq!(create.source_id.as_deref(), master.get(master_page).copied());
    }

    let french_ids: Vec<String> = french.iter().map(|c| c.item_id.clone()).collect();
    let translated = state
        .bulk
        .iter()
        .find(|b| b.op == BulkOperation::SetAsTranslated)
        .expect("locale items marked translated");
    assert_eq!(translated.item_ids, french_ids);

    let home = state
        .items
        .iter()
        .map(|i| PageIndexRecord::from_fields(&i.fields))
        .find(|r| r.pageid == "fr-FR_1")
        .unwrap();
    assert_eq!(home.pagename, "Accueil");
    assert_eq!(home.keywords, vec!["Bienvenue".to_string()]);

    assert!(!report.passes[1].skipped);
    assert_eq!(state.published.len(), 1);
    assert_eq!(state.published[0].len(), 6);
}

#[tokio::test]
async fn no_index_pages_are_left_out() {
    let repo = FakeRepository::new();
    {
        let mut state = repo.state.lock().unwrap();
        let mut hidden = page_json("Contact", "Write to us");
        hidden["properties"]["noIndex"] = json!(true);
        state.files.insert("F-3".into(), hidden.to_string().into_bytes());
    }

    let report = synchronise(&repo, repo.context(false)).await.unwrap();
    let pageids: Vec<String> = repo
        .state
        .lock()
        .unwrap()
        .creates
        .iter()
        .map(|c| c.pageid.clone())
        .collect();
    assert_eq!(pageids, vec!["1", "2"]);
    assert_eq!(report.passes[0].created.len(), 2);
}

#[tokio::test]
async fn approval_required_publish_failure_is_reported() {
    let repo = FakeRepository::new();
    repo.state.lock().unwrap().job_statuses.extend([
        JobStatus {
            id: "JOB1".into(),
            status: "RUNNING".into(),
            ..Default::default()
        },
        JobStatus {
            id: "JOB1".into(),
            status: "FAILED".into(),
            message: Some("Publishing requires approval of 3 items".into()),
            ..Default::default()
        },
    ]);

    let err = synchronise(&repo, repo.context(true)).await.unwrap_err();
    match err {
        IndexError::ApprovalRequired { job_id, message } => {
            assert_eq!(job_id, "JOB1");
            assert!(message.contains("approval"));
        }
        other => panic!("expected ApprovalRequired, got {other:?}"),
    }
    assert_eq!(repo.state.lock().unwrap().creates.len(), 3, "index writes stay applied");
}

#[tokio::test]
async fn invalid_index_type_fails_before_any_write() {
    let mut repo = MockSiteRepository::new();
    repo.expect_find_site().returning(|name| {
        Ok(SiteSummary {
            id: "SITE".into(),
            name: name.into(),
        })
    });
    repo.expect_list_folder().returning(|id| {
        Ok(match id {
            "SITE" => vec![
                folder("PAGES", "pages"),
                file("F-STRUCTURE", "structure.json"),
                file("F-SITEINFO", "siteinfo.json"),
            ],
            _ => vec![file("F-1", "1.json")],
        })
    });
    repo.expect_read_file().returning(|id| {
        let body = match id {
            "F-STRUCTURE" => json!({"pages": [{"id": 1, "name": "Home", "pageUrl": "index.html"}]}),
            _ => json!({"properties": {
                "repositoryId": "REPO1",
                "channelId": "CHANNEL1",
                "localizationPolicy": "POLICY1"
            }}),
        };
        Ok(body.to_string().into_bytes())
    });
    repo.expect_get_repository().returning(|id| {
        Ok(Repository {
            id: id.into(),
            name: "Site Content".into(),
            content_types: vec![NamedRef { name: INDEX_TYPE.into() }],
        })
    });
    repo.expect_get_content_type().returning(|name| {
        let mut broken = index_type();
        broken.name = name.into();
        broken.fields.retain(|f| f.name != "keywords");
        Ok(broken)
    });
    // Any write would hit an unexpected mock call and panic.

    let ctx = IndexContext::new(IndexRequest::new(SITE, INDEX_TYPE), RunControl::new());
    let err = synchronise(&repo, ctx).await.unwrap_err();
    assert!(
        matches!(&err, IndexError::Validation(msg) if msg.contains("keywords")),
        "unexpected error {err:?}"
    );
}

#[tokio::test]
async fn unknown_site_is_not_found() {
    let repo = FakeRepository::new();
    let mut ctx = repo.context(false);
    ctx.request.site = "missing".into();
    let err = synchronise(&repo, ctx).await.unwrap_err();
    assert!(matches!(err, IndexError::NotFound(what) if what.contains("missing")));
}

#[tokio::test]
async fn unresolvable_content_items_are_dropped_from_keywords() {
    let repo = FakeRepository::new();
    {
        let mut state = repo.state.lock().unwrap();
        let mut news = page_json("News", "Latest news");
        news["componentInstances"]["article"] =
            json!({"type": "scs-component", "data": {"contentIds": ["CORE1", "GONE"]}});
        state.files.insert("F-2".into(), news.to_string().into_bytes());
    }

    let report = synchronise(&repo, repo.context(false)).await.unwrap();

    assert_eq!(report.passes[0].created.len(), 3);
    let state = repo.state.lock().unwrap();
    let news = state
        .items
        .iter()
        .map(|i| PageIndexRecord::from_fields(&i.fields))
        .find(|r| r.pageid == "2")
        .expect("page with a missing content item is still indexed");
    assert_eq!(
        news.keywords,
        vec!["Latest news Harbour opening The harbour reopens Boats are back".to_string()]
    );
}

#[tokio::test]
async fn locale_write_failure_aborts_and_keeps_master_writes() {
    let repo = FakeRepository::new();
    repo.add_french_locale();
    repo.state.lock().unwrap().failing_create_language = Some("fr-FR".into());

    let err = synchronise(&repo, repo.context(true)).await.unwrap_err();
    match &err {
        IndexError::RemoteWrite { stage, source } => {
            assert_eq!(*stage, "item create");
            assert!(matches!(source, RepoError::Status { status: 500, .. }));
        }
        other => panic!("expected RemoteWrite, got {other:?}"),
    }

    let state = repo.state.lock().unwrap();
    assert_eq!(state.items.len(), 3);
    assert!(state.items.iter().all(|i| i.language.as_deref() == Some("en-US")));
    assert_eq!(ops(&state.bulk), vec![BulkOperation::AddChannels]);
    assert!(state.published.is_empty(), "no publish after a failed pass");
}

#[tokio::test]
async fn publish_job_that_never_finishes_times_out() {
    let mut repo = MockSiteRepository::new();
    repo.expect_submit_publish_job()
        .times(1)
        .returning(|_| Ok("J1".into()));
    repo.expect_job_status().returning(|id| {
        Ok(JobStatus {
            id: id.into(),
            status: "RUNNING".into(),
            ..Default::default()
        })
    });
    let control = RunControl::new();
    let pending = PendingWritesHandle::default();

    let coordinator = PublishCoordinator::new(
        &repo,
        &control,
        Duration::from_millis(10),
        Duration::from_millis(50),
    );
    let err = coordinator.publish("CHANNEL1", &pending).await.unwrap_err();
    match err {
        IndexError::Timeout(what) => assert!(what.contains("publish job J1"), "{what}"),
        other => panic!("expected Timeout, got {other:?}"),
    }
}
