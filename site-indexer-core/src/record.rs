//! Index records: the searchable metadata of one page, and its stored counterpart.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::contract::ContentItem;

/// The seven fields every index content type must declare.
pub const INDEX_FIELDS: [&str; 7] = [
    "site",
    "pageid",
    "pagename",
    "pageurl",
    "pagetitle",
    "pagedescription",
    "keywords",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageIndexRecord {
    pub site: String,
    pub pageid: String,
    pub pagename: String,
    pub pageurl: String,
    pub pagetitle: String,
    pub pagedescription: String,
    pub keywords: Vec<String>,
}

impl PageIndexRecord {
    /// Diff key.
    pub fn key(&self) -> (&str, &str) {
        (&self.site, &self.pageid)
    }

    /// Name of the content item holding this record.
    pub fn item_name(&self) -> String {
        format!("{}_{}", self.site, self.pageid)
    }

    pub fn to_fields(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Reads the record back from an index item. Missing fields become empty.
    pub fn from_fields(fields: &Map<String, Value>) -> Self {
        let text = |name: &str| {
            fields
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let keywords = match fields.get("keywords") {
            Some(Value::Array(values)) => values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        };
        PageIndexRecord {
            site: text("site"),
            pageid: text("pageid"),
            pagename: text("pagename"),
            pageurl: text("pageurl"),
            pagetitle: text("pagetitle"),
            pagedescription: text("pagedescription"),
            keywords,
        }
    }
}

/// An index record already stored in the repository.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingIndexItem {
    pub id: String,
    pub language: Option<String>,
    pub is_published: bool,
    pub record: PageIndexRecord,
}

impl From<ContentItem> for ExistingIndexItem {
    fn from(item: ContentItem) -> Self {
        ExistingIndexItem {
            record: PageIndexRecord::from_fields(&item.fields),
            id: item.id,
            language: item.language,
            is_published: item.is_published,
        }
    }
}
