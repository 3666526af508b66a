//! High-level pipeline: synchronises a site's search index with its current pages.
//!
//! One `index-site` invocation runs an explicit stage loop:
//!
//! ```text
//! PrepareData → IndexMaster → IndexLocale(0..n) → Publish → Done
//! ```
//!
//! - **PrepareData** locates the site, loads the master structure and site info, and validates
//!   the repository, the index content type and the localization policy. Nothing is written
//!   before this stage succeeds.
//! - **IndexMaster** indexes the default language and records every master item id.
//! - **IndexLocale** indexes each additional locale of the policy, one at a time, linking new
//!   records to their master item. A locale without override files is skipped.
//! - **Publish** runs only when requested and when the run touched at least one item.
//!
//! Every pass downloads pages, resolves content, extracts records, diffs them against the
//! stored index and then writes in a fixed order: creates, changed updates, channel
//! membership, translation state, and finally deletions. A failed write aborts the run;
//! passes already written stay applied.
//!
//! # Navigation
//! - Entry points: [`run_index_site`] (starts the local proxy) and [`synchronise`].
//! - Report types: [`SynchroniseReport`], [`LocalePassReport`].

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::IndexRequest;
use crate::context::{IndexContext, PassTarget, PendingCreate, PendingUpdate, RunControl};
use crate::contract::{
    BulkOperation, BulkRequest, ContentType, ItemQuery, RemoteContentClient, SiteRepository,
};
use crate::diff::{diff, IndexDiff};
use crate::download::{locale_page_files, master_page_files, PageDownloader};
use crate::error::{IndexError, Result};
use crate::keywords::KeywordExtractor;
use crate::proxy::{LocalAuthProxy, ProxyConfig, RemoteRoutes};
use crate::publish::{PublishCoordinator, PublishReport};
use crate::record::{ExistingIndexItem, PageIndexRecord};
use crate::repository::ProxyRepository;
use crate::resolve::ContentResolver;
use crate::site::{PageDocument, PageNode, SiteStructure};
use crate::structure::{load_locale, load_site, LocaleLookup, MasterSite};

/// Page size used when listing the index items already stored for the site.
pub const EXISTING_PAGE_SIZE: usize = 100;

/// Fields of the index content type that must be plain text.
const TEXT_FIELDS: [&str; 5] = ["site", "pageid", "pagename", "pageurl", "pagetitle"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalePassReport {
    pub locale: String,
    pub is_master: bool,
    /// Locale had no override files.
    pub skipped: bool,
    /// No fresh records: nothing was written for this pass.
    pub nothing_to_index: bool,
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: usize,
    pub deleted: Vec<String>,
}

impl LocalePassReport {
    fn new(locale: &str, is_master: bool) -> Self {
        LocalePassReport {
            locale: locale.to_string(),
            is_master,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynchroniseReport {
    pub site: String,
    pub passes: Vec<LocalePassReport>,
    pub published: Option<PublishReport>,
}

/// Checks the index content type declares the seven record fields with usable datatypes.
pub fn validate_index_type(content_type: &ContentType) -> Result<()> {
    let mut problems = Vec::new();
    for name in TEXT_FIELDS {
        match content_type.field(name) {
            Some(f) if f.datatype == "text" => {}
            Some(f) => problems.push(format!("field {name} must be text, found {}", f.datatype)),
            None => problems.push(format!("field {name} is missing")),
        }
    }
    match content_type.field("pagedescription") {
        Some(f) if f.is_text() => {}
        Some(f) => problems.push(format!(
            "field pagedescription must be text or largetext, found {}",
            f.datatype
        )),
        None => problems.push("field pagedescription is missing".to_string()),
    }
    match content_type.field("keywords") {
        Some(f) if f.datatype == "text" && f.is_list() => {}
        Some(_) => problems.push("field keywords must be a text list".to_string()),
        None => problems.push("field keywords is missing".to_string()),
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(IndexError::Validation(format!(
            "content type {} cannot hold index records: {}",
            content_type.name,
            problems.join("; ")
        )))
    }
}

/// Everything validated by the PrepareData stage.
#[derive(Debug, Clone)]
struct PreparedSite {
    master: MasterSite,
    repository_id: String,
    channel_id: String,
    default_language: String,
    locales: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    PrepareData,
    IndexMaster,
    IndexLocale(usize),
    Publish,
    Done,
}

/// Drives the stage loop of one invocation against a [`SiteRepository`].
pub struct LocaleOrchestrator<'a, R: ?Sized> {
    repo: &'a R,
    ctx: IndexContext,
    downloader: PageDownloader,
    master_docs: HashMap<String, PageDocument>,
}

impl<'a, R> LocaleOrchestrator<'a, R>
where
    R: SiteRepository + ?Sized,
{
    pub fn new(repo: &'a R, ctx: IndexContext) -> Self {
        LocaleOrchestrator {
            repo,
            ctx,
            downloader: PageDownloader::default(),
            master_docs: HashMap::new(),
        }
    }

    pub fn with_downloader(mut self, downloader: PageDownloader) -> Self {
        self.downloader = downloader;
        self
    }

    pub async fn run(mut self) -> Result<SynchroniseReport> {
        self.ctx.request.trace_loaded();
        let mut report = SynchroniseReport {
            site: self.ctx.request.site.clone(),
            ..Default::default()
        };
        let mut prepared: Option<PreparedSite> = None;
        let mut stage = Stage::PrepareData;

        loop {
            debug!(stage = ?stage, site = %report.site, "[SYNC] Entering stage");
            stage = match stage {
                Stage::PrepareData => {
                    prepared = Some(self.prepare().await?);
                    Stage::IndexMaster
                }
                Stage::Done => break,
                other => self.advance(other, prepared.as_ref(), &mut report).await?,
            };
        }

        info!(
            site = %report.site,
            passes = report.passes.len(),
            published = report.published.is_some(),
            "[SYNC] Site index synchronised"
        );
        Ok(report)
    }

    async fn advance(
        &mut self,
        stage: Stage,
        site: Option<&PreparedSite>,
        report: &mut SynchroniseReport,
    ) -> Result<Stage> {
        let site = site.ok_or_else(|| {
            IndexError::Internal(format!("stage {stage:?} reached without prepared site data"))
        })?;
        let next = match stage {
            Stage::IndexMaster => {
                report.passes.push(self.index_master(site).await?);
                Stage::IndexLocale(0)
            }
            Stage::IndexLocale(i) => match site.locales.get(i) {
                Some(locale) => {
                    report.passes.push(self.index_locale(site, locale).await?);
                    Stage::IndexLocale(i + 1)
                }
                None => Stage::Publish,
            },
            Stage::Publish => {
                report.published = self.publish(site).await?;
                Stage::Done
            }
            Stage::PrepareData | Stage::Done => Stage::Done,
        };
        Ok(next)
    }

    async fn prepare(&self) -> Result<PreparedSite> {
        let request = &self.ctx.request;
        let control = &self.ctx.control;
        let master = load_site(self.repo, control, &request.site).await?;

        let properties = &master.info.properties;
        let repository_id = required(properties.repository_id.as_deref(), "repositoryId", &request.site)?;
        let channel_id = required(properties.channel_id.as_deref(), "channelId", &request.site)?;
        let policy_id = required(
            properties.localization_policy.as_deref(),
            "localizationPolicy",
            &request.site,
        )?;

        let repository = control
            .guard("repository lookup", self.repo.get_repository(&repository_id))
            .await?;
        if !repository.has_content_type(&request.content_type) {
            return Err(IndexError::Validation(format!(
                "content type {} is not registered in repository {}",
                request.content_type, repository.name
            )));
        }

        let content_type = control
            .guard("content type lookup", self.repo.get_content_type(&request.content_type))
            .await?;
        validate_index_type(&content_type)?;

        let policy = control
            .guard("localization policy lookup", self.repo.get_localization_policy(&policy_id))
            .await?;
        let default_language = policy
            .default_language
            .clone()
            .or_else(|| properties.default_language.clone())
            .ok_or_else(|| {
                IndexError::Validation(format!("localization policy {policy_id} has no default language"))
            })?;
        let locales = policy.additional_locales(&default_language);

        info!(
            site = %request.site,
            repository = %repository.name,
            channel_id = %channel_id,
            default_language = %default_language,
            locales = ?locales,
            "[SYNC] Site validated"
        );
        Ok(PreparedSite {
            master,
            repository_id,
            channel_id,
            default_language,
            locales,
        })
    }

    async fn index_master(&mut self, site: &PreparedSite) -> Result<LocalePassReport> {
        let control = &self.ctx.control;
        let files = master_page_files(&site.master.files, &site.master.structure);
        let manifest = self.downloader.download_all(self.repo, control, &files).await?;
        self.master_docs = manifest.pages;

        let pages: Vec<(&PageNode, &PageDocument)> = site
            .master
            .structure
            .pages
            .iter()
            .filter_map(|node| self.master_docs.get(&node.id).map(|doc| (node, doc)))
            .collect();
        let docs: Vec<&PageDocument> = pages.iter().map(|(_, doc)| *doc).collect();
        let content = ContentResolver::new(self.repo, control, &site.channel_id, &site.default_language)
            .resolve(&docs)
            .await?;
        let records = KeywordExtractor::master(&self.ctx.request.site).extract_all(pages, &content);

        let mut report = LocalePassReport::new(&site.default_language, true);
        self.write_pass(site, &site.default_language, None, records, &mut report)
            .await?;
        Ok(report)
    }

    async fn index_locale(&mut self, site: &PreparedSite, locale: &str) -> Result<LocalePassReport> {
        let mut report = LocalePassReport::new(locale, false);
        let control = &self.ctx.control;

        let overrides = match load_locale(self.repo, control, &site.master.files, locale).await? {
            LocaleLookup::Present { structure, .. } => structure,
            LocaleLookup::Absent => {
                info!(locale = %locale, "[SYNC] Locale has no override files, skipping");
                report.skipped = true;
                return Ok(report);
            }
        };
        let structure: SiteStructure = site.master.structure.with_overrides(&overrides);

        let files = locale_page_files(&site.master.files, &structure, locale);
        let mut manifest = self.downloader.download_all(self.repo, control, &files).await?;

        let mut docs: Vec<(&PageNode, PageDocument)> = Vec::new();
        for node in &structure.pages {
            let key = format!("{locale}_{}", node.id);
            let doc = match (manifest.pages.remove(&key), self.master_docs.get(&node.id)) {
                (Some(local), Some(master)) => local.inherit_from(master),
                (Some(local), None) => local,
                (None, Some(master)) => PageDocument {
                    id: key,
                    ..master.clone()
                },
                (None, None) => {
                    debug!(locale = %locale, page_id = %node.id, "[SYNC] No page document, skipping page");
                    continue;
                }
            };
            docs.push((node, doc));
        }

        let doc_refs: Vec<&PageDocument> = docs.iter().map(|(_, doc)| doc).collect();
        let content = ContentResolver::new(self.repo, control, &site.channel_id, locale)
            .resolve(&doc_refs)
            .await?;
        let records = KeywordExtractor::locale(&self.ctx.request.site, locale)
            .extract_all(docs.iter().map(|(node, doc)| (*node, doc)), &content);

        self.write_pass(site, locale, Some(locale), records, &mut report)
            .await?;
        Ok(report)
    }

    /// Lists every stored index item of the site in `language`.
    async fn existing_items(&self, language: &str) -> Result<Vec<ExistingIndexItem>> {
        let mut query = ItemQuery {
            content_type: Some(self.ctx.request.content_type.clone()),
            language: Some(language.to_string()),
            filter: Some(format!("fields.site eq \"{}\"", self.ctx.request.site)),
            limit: EXISTING_PAGE_SIZE,
            ..Default::default()
        };
        let mut items = Vec::new();
        loop {
            let page = self
                .ctx
                .control
                .guard("existing index items", self.repo.query_items(&query))
                .await?;
            let fetched = page.items.len();
            items.extend(page.items.into_iter().map(ExistingIndexItem::from));
            if !page.has_more || fetched == 0 {
                break;
            }
            query.offset += fetched;
        }
        debug!(language = %language, existing = items.len(), "[SYNC] Listed stored index items");
        Ok(items)
    }

    async fn write_pass(
        &mut self,
        site: &PreparedSite,
        language: &str,
        locale: Option<&str>,
        records: Vec<PageIndexRecord>,
        report: &mut LocalePassReport,
    ) -> Result<()> {
        let existing = self.existing_items(language).await?;
        let changes: IndexDiff = diff(&self.ctx.request.site, records, existing);
        report.unchanged = changes.unchanged_updates().count();

        if changes.is_empty() {
            warn!(
                site = %self.ctx.request.site,
                language = %language,
                stale = changes.delete.len(),
                "[INDEX] Nothing to index, leaving stored items untouched"
            );
            report.nothing_to_index = true;
            return Ok(());
        }

        let is_master = locale.is_none();
        let creates: Vec<PendingCreate> = changes
            .create
            .iter()
            .map(|record| PendingCreate {
                source_id: locale.and_then(|l| self.master_item_of(l, &record.pageid)),
                record: record.clone(),
            })
            .collect();
        let updates: Vec<PendingUpdate> = changes
            .changed_updates()
            .map(|u| PendingUpdate {
                item_id: u.item_id.clone(),
                record: u.record.clone(),
            })
            .collect();
        self.ctx.pending.begin_pass(
            PassTarget {
                repository_id: site.repository_id.clone(),
                content_type: self.ctx.request.content_type.clone(),
                language: language.to_string(),
                is_master,
            },
            creates.clone(),
            updates.clone(),
        );
        info!(
            language = %language,
            create = creates.len(),
            update = updates.len(),
            delete = changes.delete.len(),
            "[INDEX] Writing index changes"
        );

        for (index, create) in creates.iter().enumerate() {
            let created = self
                .ctx
                .control
                .guard("item create", async {
                    self.repo
                        .create_item(index)
                        .await
                        .map_err(|e| IndexError::write("item create", e))
                })
                .await?;
            debug!(pageid = %create.record.pageid, item_id = %created.id, "[INDEX] Created index item");
            if is_master {
                self.ctx.registry.insert(&create.record.pageid, &created.id);
            }
            report.created.push(created.id);
        }

        for (index, update) in updates.iter().enumerate() {
            self.ctx
                .control
                .guard("item update", async {
                    self.repo
                        .update_item(index)
                        .await
                        .map_err(|e| IndexError::write("item update", e))
                })
                .await?;
            debug!(pageid = %update.record.pageid, item_id = %update.item_id, "[INDEX] Updated index item");
            report.updated.push(update.item_id.clone());
        }

        if is_master {
            for update in &changes.update {
                self.ctx.registry.insert(&update.record.pageid, &update.item_id);
            }
        }

        self.bulk(&site.channel_id, BulkOperation::AddChannels, report.created.clone())
            .await?;

        let written: Vec<String> = report
            .created
            .iter()
            .chain(&report.updated)
            .cloned()
            .collect();
        if is_master {
            self.ctx.pending.add_publish_ids(self.ctx.registry.item_ids());
        } else {
            self.bulk(&site.channel_id, BulkOperation::SetAsTranslated, written.clone())
                .await?;
            self.ctx.pending.add_publish_ids(written);
        }

        if !changes.delete.is_empty() {
            let published: Vec<String> = changes
                .delete
                .iter()
                .filter(|item| item.is_published)
                .map(|item| item.id.clone())
                .collect();
            let stale: Vec<String> = changes.delete.iter().map(|item| item.id.clone()).collect();
            self.bulk(&site.channel_id, BulkOperation::Unpublish, published)
                .await?;
            self.bulk(&site.channel_id, BulkOperation::RemoveChannels, stale.clone())
                .await?;
            self.bulk(&site.channel_id, BulkOperation::DeleteItems, stale.clone())
                .await?;
            report.deleted = stale;
        }

        info!(
            language = %language,
            created = report.created.len(),
            updated = report.updated.len(),
            unchanged = report.unchanged,
            deleted = report.deleted.len(),
            "[INDEX] Pass complete"
        );
        Ok(())
    }

    /// Master item id of the page a locale record was derived from.
    fn master_item_of(&self, locale: &str, pageid: &str) -> Option<String> {
        let master_page = pageid.strip_prefix(&format!("{locale}_"))?;
        let found = self.ctx.registry.get(master_page).map(str::to_string);
        if found.is_none() {
            warn!(locale = %locale, pageid = %pageid, "[INDEX] No master item for locale record");
        }
        found
    }

    async fn bulk(&self, channel_id: &str, op: BulkOperation, item_ids: Vec<String>) -> Result<()> {
        if item_ids.is_empty() {
            return Ok(());
        }
        let stage = bulk_stage(op);
        let request = BulkRequest {
            channel_id: channel_id.to_string(),
            op,
            item_ids,
        };
        debug!(op = ?op, items = request.item_ids.len(), "[INDEX] Bulk operation");
        self.ctx
            .control
            .guard(stage, async {
                self.repo
                    .bulk_operation(&request)
                    .await
                    .map_err(|e| IndexError::write(stage, e))
            })
            .await
    }

    async fn publish(&self, site: &PreparedSite) -> Result<Option<PublishReport>> {
        let request = &self.ctx.request;
        if !request.publish {
            return Ok(None);
        }
        if self.ctx.pending.publish_ids().is_empty() {
            info!(site = %request.site, "[PUBLISH] Nothing to publish");
            return Ok(None);
        }
        let coordinator = PublishCoordinator::new(
            self.repo,
            &self.ctx.control,
            request.poll_interval,
            request.publish_timeout,
        );
        coordinator
            .publish(&site.channel_id, &self.ctx.pending)
            .await
            .map(Some)
    }
}

fn bulk_stage(op: BulkOperation) -> &'static str {
    match op {
        BulkOperation::AddChannels => "add to channel",
        BulkOperation::RemoveChannels => "remove from channel",
        BulkOperation::SetAsTranslated => "mark translated",
        BulkOperation::DeleteItems => "delete items",
        BulkOperation::Unpublish => "unpublish",
    }
}

fn required(value: Option<&str>, name: &str, site: &str) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| IndexError::Validation(format!("siteinfo of site {site} has no {name}")))
}

/// Runs all stages of one invocation against `repo`.
pub async fn synchronise<R>(repo: &R, ctx: IndexContext) -> Result<SynchroniseReport>
where
    R: SiteRepository + ?Sized,
{
    LocaleOrchestrator::new(repo, ctx).run().await
}

/// Starts the local auth proxy, synchronises the site through it and stops the proxy again,
/// whatever the outcome.
pub async fn run_index_site(
    remote: Arc<dyn RemoteContentClient>,
    routes: RemoteRoutes,
    request: IndexRequest,
    control: RunControl,
) -> Result<SynchroniseReport> {
    let ctx = IndexContext::new(request, control);
    let proxy = ctx
        .control
        .guard(
            "local auth proxy start-up",
            LocalAuthProxy::start(ProxyConfig {
                remote,
                pending: ctx.pending.clone(),
                routes: routes.clone(),
            }),
        )
        .await?;
    let repo = ProxyRepository::new(proxy.base_url(), routes);

    let outcome = synchronise(&repo, ctx).await;
    proxy.shutdown().await;

    if let Err(e) = &outcome {
        error!(error = %e, "[SYNC] Site indexing failed");
    }
    outcome
}
