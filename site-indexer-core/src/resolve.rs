//! Content resolution: finds the content items whose text belongs to each page.
//!
//! Two kinds of component contribute items:
//! - components carrying a direct `contentId` / `contentIds` reference;
//! - content list components, which embed a query (type, paging, ordering, extra filter).
//!
//! All ids are deduplicated and fetched in rounds of [`ITEM_BATCH_SIZE`] (concurrent within
//! a round, rounds sequential). Ids that fail to resolve are dropped from the page, never
//! failing it.

use std::collections::{HashMap, HashSet};

use futures::future::join_all;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::context::RunControl;
use crate::contract::{ContentItem, ItemQuery, SiteRepository};
use crate::error::{IndexError, Result};
use crate::site::PageDocument;

pub const ITEM_BATCH_SIZE: usize = 20;
pub const CONTENT_LIST_KIND: &str = "scs-contentlist";
const DEFAULT_LIST_LIMIT: usize = 10;

/// The query embedded in a content list component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentListQuery {
    pub content_type: String,
    pub limit: usize,
    pub offset: usize,
    pub order_by: Option<String>,
    pub query_string: Option<String>,
    pub locale: Option<String>,
}

fn non_empty_str(data: &Map<String, Value>, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn as_count(value: Option<&Value>) -> Option<usize> {
    match value? {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl ContentListQuery {
    pub fn from_component(kind: &str, data: &Map<String, Value>) -> Option<Self> {
        if kind != CONTENT_LIST_KIND && !data.contains_key("contentTypes") {
            return None;
        }
        let content_type = data
            .get("contentTypes")
            .and_then(Value::as_array)
            .and_then(|types| types.iter().find_map(Value::as_str))
            .map(str::to_string)
            .or_else(|| non_empty_str(data, "contentType"))?;
        Some(ContentListQuery {
            content_type,
            limit: as_count(data.get("maxResults")).unwrap_or(DEFAULT_LIST_LIMIT),
            offset: as_count(data.get("firstItem")).unwrap_or(0),
            order_by: non_empty_str(data, "sortOrder"),
            query_string: non_empty_str(data, "queryString"),
            locale: non_empty_str(data, "locale"),
        })
    }

    pub fn to_item_query(&self, channel_id: &str, pass_locale: &str) -> ItemQuery {
        ItemQuery {
            content_type: Some(self.content_type.clone()),
            language: Some(self.locale.clone().unwrap_or_else(|| pass_locale.to_string())),
            channel_id: Some(channel_id.to_string()),
            filter: self.query_string.clone(),
            order_by: self.order_by.clone(),
            limit: self.limit,
            offset: self.offset,
        }
    }
}

/// Content ids referenced directly by the page's components, in component order.
pub fn direct_content_ids(doc: &PageDocument) -> Vec<String> {
    let mut ids = Vec::new();
    for (_, component) in &doc.component_instances {
        if let Some(id) = non_empty_str(&component.data, "contentId") {
            ids.push(id);
        }
        if let Some(list) = component.data.get("contentIds").and_then(Value::as_array) {
            ids.extend(
                list.iter()
                    .filter_map(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            );
        }
    }
    ids
}

pub fn content_list_queries(doc: &PageDocument) -> Vec<ContentListQuery> {
    doc.component_instances
        .iter()
        .filter_map(|(_, c)| ContentListQuery::from_component(&c.kind, &c.data))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextField {
    pub name: String,
    pub rich_text: bool,
}

/// Text and largetext fields per content type.
#[derive(Debug, Clone, Default)]
pub struct TextFieldIndex {
    by_type: HashMap<String, Vec<TextField>>,
}

impl TextFieldIndex {
    pub fn insert(&mut self, content_type: &str, fields: Vec<TextField>) {
        self.by_type.insert(content_type.to_string(), fields);
    }

    pub fn fields_of(&self, content_type: &str) -> &[TextField] {
        self.by_type
            .get(content_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Resolved items per page id, plus the text field index for their types.
#[derive(Debug, Clone, Default)]
pub struct ResolvedContent {
    pub by_page: HashMap<String, Vec<ContentItem>>,
    pub text_fields: TextFieldIndex,
}

impl ResolvedContent {
    pub fn items_for(&self, page_id: &str) -> &[ContentItem] {
        self.by_page.get(page_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

pub struct ContentResolver<'a, R: ?Sized> {
    repo: &'a R,
    control: &'a RunControl,
    channel_id: &'a str,
    locale: &'a str,
    batch_size: usize,
}

impl<'a, R> ContentResolver<'a, R>
where
    R: SiteRepository + ?Sized,
{
    pub fn new(repo: &'a R, control: &'a RunControl, channel_id: &'a str, locale: &'a str) -> Self {
        ContentResolver {
            repo,
            control,
            channel_id,
            locale,
            batch_size: ITEM_BATCH_SIZE,
        }
    }

    pub async fn resolve(&self, pages: &[&PageDocument]) -> Result<ResolvedContent> {
        let mut wanted: Vec<(String, Vec<String>)> = Vec::new();
        for doc in pages {
            let mut ids = direct_content_ids(doc);
            for query in content_list_queries(doc) {
                ids.extend(self.run_list_query(&doc.id, &query).await?);
            }
            if !ids.is_empty() {
                wanted.push((doc.id.clone(), ids));
            }
        }

        let mut seen: HashSet<String> = HashSet::new();
        let unique: Vec<String> = wanted
            .iter()
            .flat_map(|(_, ids)| ids.iter())
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect();
        info!(
            locale = %self.locale,
            pages = wanted.len(),
            items = unique.len(),
            "[RESOLVE] Resolving referenced content items"
        );

        let resolved = self.fetch_items(&unique).await?;

        let mut content = ResolvedContent::default();
        for (page_id, ids) in wanted {
            let mut page_seen: HashSet<&String> = HashSet::new();
            let items: Vec<ContentItem> = ids
                .iter()
                .filter(|id| page_seen.insert(*id))
                .filter_map(|id| resolved.get(id).cloned())
                .collect();
            content.by_page.insert(page_id, items);
        }

        let mut types: Vec<&str> = resolved.values().map(|i| i.item_type.as_str()).collect();
        types.sort_unstable();
        types.dedup();
        for content_type in types {
            let fields = self.text_fields_of(content_type).await?;
            content.text_fields.insert(content_type, fields);
        }
        Ok(content)
    }

    async fn run_list_query(&self, page_id: &str, query: &ContentListQuery) -> Result<Vec<String>> {
        let item_query = query.to_item_query(self.channel_id, self.locale);
        match self
            .control
            .guard("content list query", self.repo.query_items(&item_query))
            .await
        {
            Ok(page) => {
                debug!(page_id = %page_id, content_type = %query.content_type, found = page.items.len(), "[RESOLVE] Content list query");
                Ok(page.items.into_iter().map(|i| i.id).collect())
            }
            Err(e @ (IndexError::Cancelled | IndexError::Timeout(_))) => Err(e),
            Err(e) => {
                warn!(page_id = %page_id, content_type = %query.content_type, error = %e, "[RESOLVE] Content list query failed, skipping");
                Ok(Vec::new())
            }
        }
    }

    async fn fetch_items(&self, ids: &[String]) -> Result<HashMap<String, ContentItem>> {
        let mut resolved = HashMap::new();
        for batch in ids.chunks(self.batch_size) {
            let fetches = batch.iter().map(|id| async move {
                (id, self.control.guard(id, self.repo.get_item(id)).await)
            });
            for (id, outcome) in join_all(fetches).await {
                match outcome {
                    Ok(item) => {
                        resolved.insert(id.clone(), item);
                    }
                    Err(e @ (IndexError::Cancelled | IndexError::Timeout(_))) => return Err(e),
                    Err(e) => {
                        warn!(item_id = %id, error = %e, "[RESOLVE] Content item could not be resolved, dropping it");
                    }
                }
            }
        }
        Ok(resolved)
    }

    async fn text_fields_of(&self, content_type: &str) -> Result<Vec<TextField>> {
        match self
            .control
            .guard(content_type, self.repo.get_content_type(content_type))
            .await
        {
            Ok(definition) => Ok(definition
                .fields
                .iter()
                .filter(|f| f.is_text())
                .map(|f| TextField {
                    name: f.name.clone(),
                    rich_text: f.is_rich_text(),
                })
                .collect()),
            Err(e @ (IndexError::Cancelled | IndexError::Timeout(_))) => Err(e),
            Err(e) => {
                warn!(content_type = %content_type, error = %e, "[RESOLVE] Content type lookup failed, its fields will not be indexed");
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn page(json: Value) -> PageDocument {
        PageDocument::parse("7", json.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn collects_direct_ids_in_component_order() {
        let doc = page(json!({"componentInstances": {
            "a": {"type": "scs-contentitem", "data": {"contentId": "CORE1"}},
            "b": {"type": "scs-component", "data": {"contentIds": ["CORE2", "", "CORE3"]}},
            "c": {"type": "scs-paragraph", "data": {"userText": "no ids"}}
        }}));
        assert_eq!(direct_content_ids(&doc), vec!["CORE1", "CORE2", "CORE3"]);
    }

    #[test]
    fn content_list_descriptor_reads_paging_and_filter() {
        let doc = page(json!({"componentInstances": {
            "list": {"type": "scs-contentlist", "data": {
                "contentTypes": ["Article"],
                "maxResults": "5",
                "firstItem": 10,
                "sortOrder": "updatedDate:desc",
                "queryString": "fields.topic eq \"news\"",
                "locale": ""
            }}
        }}));
        let queries = content_list_queries(&doc);
        assert_eq!(
            queries,
            vec![ContentListQuery {
                content_type: "Article".into(),
                limit: 5,
                offset: 10,
                order_by: Some("updatedDate:desc".into()),
                query_string: Some("fields.topic eq \"news\"".into()),
                locale: None,
            }]
        );
        let item_query = queries[0].to_item_query("CH1", "fr-FR");
        assert_eq!(item_query.language.as_deref(), Some("fr-FR"));
        assert_eq!(item_query.channel_id.as_deref(), Some("CH1"));
    }

    #[test]
    fn content_list_without_type_is_ignored() {
        let doc = page(json!({"componentInstances": {
            "list": {"type": "scs-contentlist", "data": {"maxResults": 3}}
        }}));
        assert!(content_list_queries(&doc).is_empty());
    }
}
