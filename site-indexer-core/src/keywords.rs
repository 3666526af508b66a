//! Keyword extraction: turns a page's components and its resolved content items into
//! a [`PageIndexRecord`].
//!
//! Text is gathered in component order, followed by each content item's name, description
//! and text fields. The joined text is stripped of HTML tags and a fixed set of entities,
//! then re-accumulated token by token into strings of at most [`MAX_KEYWORD_BYTES`] bytes,
//! leaving headroom under the repository's 2000 byte field limit. Tokens are never split.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

use crate::contract::ContentItem;
use crate::record::PageIndexRecord;
use crate::resolve::ResolvedContent;
use crate::site::{PageDocument, PageNode};

pub const MAX_KEYWORD_BYTES: usize = 1990;

/// Entities removed from the keyword text.
const STRIPPED_ENTITIES: [&str; 7] = ["&nbsp;", "&amp;", "&lt;", "&gt;", "&quot;", "&#39;", "&apos;"];

/// Entities decoded in rich text values before they join the keyword text.
const UNESCAPED_ENTITIES: [(&str, &str); 7] = [
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&quot;", "\""),
    ("&#39;", "'"),
    ("&apos;", "'"),
    ("&nbsp;", " "),
    ("&amp;", "&"),
];

fn tag_pattern() -> &'static Regex {
    static TAGS: OnceLock<Regex> = OnceLock::new();
    TAGS.get_or_init(|| Regex::new(r"<[^>]*>").expect("tag pattern is valid"))
}

pub fn unescape_html(text: &str) -> String {
    UNESCAPED_ENTITIES
        .iter()
        .fold(text.to_string(), |acc, (entity, plain)| acc.replace(entity, plain))
}

pub fn strip_html(text: &str) -> String {
    let without_tags = tag_pattern().replace_all(text, " ");
    STRIPPED_ENTITIES
        .iter()
        .fold(without_tags.into_owned(), |acc, entity| acc.replace(entity, " "))
}

/// Splits `text` on whitespace and packs the tokens into strings of at most `limit` bytes.
/// A token longer than `limit` on its own is dropped.
pub fn chunk_keywords(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for token in text.split_whitespace() {
        if token.len() > limit {
            debug!(bytes = token.len(), "[KEYWORDS] Dropping token longer than the keyword limit");
            continue;
        }
        let needed = if current.is_empty() {
            token.len()
        } else {
            current.len() + 1 + token.len()
        };
        if needed > limit {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(token);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn push_str(buffer: &mut Vec<String>, value: Option<&Value>) {
    if let Some(text) = value.and_then(Value::as_str).filter(|s| !s.trim().is_empty()) {
        buffer.push(text.to_string());
    }
}

/// Text carried by one component, depending on its kind.
pub fn component_text(kind: &str, data: &serde_json::Map<String, Value>) -> Vec<String> {
    let mut out = Vec::new();
    match kind {
        "scs-paragraph" | "scs-title" | "scs-button" | "scs-inline-text" => {
            push_str(&mut out, data.get("userText"));
        }
        "scs-image" => {
            push_str(&mut out, data.get("altText"));
            push_str(&mut out, data.get("description"));
        }
        "scs-gallery" => {
            if let Some(images) = data.get("images").and_then(Value::as_array) {
                for image in images {
                    push_str(&mut out, image.get("altText"));
                    push_str(&mut out, image.get("title"));
                    push_str(&mut out, image.get("description"));
                }
            }
        }
        _ => {}
    }
    out
}

fn field_values(value: &Value) -> Vec<&str> {
    match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(values) => values.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

/// Text carried by a content item: name, description, then every text field of its type.
pub fn item_text(item: &ContentItem, content: &ResolvedContent) -> Vec<String> {
    let mut out = Vec::new();
    if !item.name.trim().is_empty() {
        out.push(item.name.clone());
    }
    if let Some(description) = item.description.as_deref().filter(|d| !d.trim().is_empty()) {
        out.push(description.to_string());
    }
    for field in content.text_fields.fields_of(&item.item_type) {
        let Some(value) = item.fields.get(&field.name) else {
            continue;
        };
        for text in field_values(value) {
            if field.rich_text {
                out.push(unescape_html(text));
            } else {
                out.push(text.to_string());
            }
        }
    }
    out
}

/// Builds index records for one locale pass.
pub struct KeywordExtractor<'a> {
    pub site: &'a str,
    /// `None` for the master pass, the locale otherwise; prefixes the record's page id.
    pub locale_prefix: Option<&'a str>,
}

impl<'a> KeywordExtractor<'a> {
    pub fn master(site: &'a str) -> Self {
        KeywordExtractor {
            site,
            locale_prefix: None,
        }
    }

    pub fn locale(site: &'a str, locale: &'a str) -> Self {
        KeywordExtractor {
            site,
            locale_prefix: Some(locale),
        }
    }

    pub fn page_id(&self, master_page_id: &str) -> String {
        match self.locale_prefix {
            Some(locale) => format!("{locale}_{master_page_id}"),
            None => master_page_id.to_string(),
        }
    }

    /// `None` when the page is marked `noIndex`.
    pub fn extract(
        &self,
        node: &PageNode,
        doc: &PageDocument,
        content: &ResolvedContent,
    ) -> Option<PageIndexRecord> {
        if doc.is_no_index() {
            debug!(page_id = %node.id, "[KEYWORDS] Page is marked noIndex, skipping");
            return None;
        }

        let mut buffer: Vec<String> = Vec::new();
        for (_, component) in &doc.component_instances {
            buffer.extend(component_text(&component.kind, &component.data));
        }
        for item in content.items_for(&doc.id) {
            buffer.extend(item_text(item, content));
        }
        let keywords = chunk_keywords(&strip_html(&buffer.join(" ")), MAX_KEYWORD_BYTES);

        Some(PageIndexRecord {
            site: self.site.to_string(),
            pageid: self.page_id(&node.id),
            pagename: node.name.clone(),
            pageurl: node.page_url.clone(),
            pagetitle: doc.properties.title.clone().unwrap_or_else(|| node.name.clone()),
            pagedescription: doc.properties.page_description.clone().unwrap_or_default(),
            keywords,
        })
    }

    /// Records for every page of `pages` that has a document; noIndex pages are left out.
    pub fn extract_all<'p, I>(&self, pages: I, content: &ResolvedContent) -> Vec<PageIndexRecord>
    where
        I: IntoIterator<Item = (&'p PageNode, &'p PageDocument)>,
    {
        let records: Vec<PageIndexRecord> = pages
            .into_iter()
            .filter_map(|(node, doc)| self.extract(node, doc, content))
            .collect();
        info!(
            site = %self.site,
            locale = ?self.locale_prefix,
            records = records.len(),
            "[KEYWORDS] Generated index records"
        );
        records
    }
}
