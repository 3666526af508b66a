//! Documents read from a site's file tree: `structure.json`, `siteinfo.json` and the
//! per-page JSON definitions under the `pages` folder.
//!
//! Page ids are numeric in some exports and strings in others; both are normalised
//! to `String` on the way in.

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Num(u64),
    Str(String),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Num(n) => n.to_string(),
            RawId::Str(s) => s,
        }
    }
}

fn de_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(RawId::deserialize(d)?.into())
}

fn de_opt_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<RawId>::deserialize(d)?.map(String::from))
}

/// One node of the page tree.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageNode {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub page_url: String,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub is_detail_page: bool,
    #[serde(default)]
    pub hide_in_navigation: bool,
}

/// The page tree of a site (master) or the sparse overrides of one locale.
///
/// Nodes keep their document order; the tree shape is carried by `parent_id`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SiteStructure {
    #[serde(default)]
    pub pages: Vec<PageNode>,
}

impl SiteStructure {
    pub fn page(&self, id: &str) -> Option<&PageNode> {
        self.pages.iter().find(|p| p.id == id)
    }

    /// Applies a sparse locale structure on top of this (master) structure.
    ///
    /// The result keeps the master page order; nodes present in `overrides` replace
    /// their master counterpart. Locale-only nodes are ignored since they have no
    /// master page to translate.
    pub fn with_overrides(&self, overrides: &SiteStructure) -> SiteStructure {
        let pages = self
            .pages
            .iter()
            .map(|master| overrides.page(&master.id).unwrap_or(master).clone())
            .collect();
        SiteStructure { pages }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteProperties {
    pub site_name: Option<String>,
    pub default_language: Option<String>,
    pub repository_id: Option<String>,
    pub channel_id: Option<String>,
    pub localization_policy: Option<String>,
}

/// `siteinfo.json` / `<locale>_siteinfo.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SiteInfo {
    #[serde(default)]
    pub properties: SiteProperties,
}

/// A component placed on a page. `data` carries free text, content ids or content
/// list query parameters depending on `kind`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ComponentInstance {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageProperties {
    pub title: Option<String>,
    pub page_description: Option<String>,
    pub no_index: Option<bool>,
}

fn de_components<'de, D>(d: D) -> Result<Vec<(String, ComponentInstance)>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Map::<String, Value>::deserialize(d)?;
    raw.into_iter()
        .map(|(key, value)| {
            serde_json::from_value(value)
                .map(|component| (key, component))
                .map_err(serde::de::Error::custom)
        })
        .collect()
}

/// A page definition file. Component instances keep the order they have in the file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageDocument {
    #[serde(skip)]
    pub id: String,
    #[serde(default, deserialize_with = "de_components")]
    pub component_instances: Vec<(String, ComponentInstance)>,
    #[serde(default)]
    pub properties: PageProperties,
}

impl PageDocument {
    pub fn parse(id: &str, bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let mut doc: PageDocument = serde_json::from_slice(bytes)?;
        doc.id = id.to_string();
        Ok(doc)
    }

    pub fn is_no_index(&self) -> bool {
        self.properties.no_index.unwrap_or(false)
    }

    /// Builds the effective locale page: master component instances the locale does
    /// not override are inherited, locale properties win where set.
    pub fn inherit_from(self, master: &PageDocument) -> PageDocument {
        let mut components = master.component_instances.clone();
        for (key, component) in self.component_instances {
            match components.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = component,
                None => components.push((key, component)),
            }
        }
        let properties = PageProperties {
            title: self.properties.title.or_else(|| master.properties.title.clone()),
            page_description: self
                .properties
                .page_description
                .or_else(|| master.properties.page_description.clone()),
            no_index: self.properties.no_index.or(master.properties.no_index),
        };
        PageDocument {
            id: self.id,
            component_instances: components,
            properties,
        }
    }
}
