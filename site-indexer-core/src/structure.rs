//! Site structure loading: finds the site folder, its `pages` folder and the
//! `structure.json` / `siteinfo.json` files (master or `<locale>_` prefixed).

use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::context::RunControl;
use crate::contract::{FolderEntry, SiteRepository, SiteSummary};
use crate::error::{IndexError, Result};
use crate::site::{SiteInfo, SiteStructure};

pub const PAGES_FOLDER: &str = "pages";
pub const STRUCTURE_FILE: &str = "structure.json";
pub const SITEINFO_FILE: &str = "siteinfo.json";

/// The parts of the site file tree the pipeline reads from.
#[derive(Debug, Clone)]
pub struct SiteFiles {
    pub site: SiteSummary,
    /// Entries of the site's root folder.
    pub entries: Vec<FolderEntry>,
    /// Files inside the `pages` folder.
    pub page_files: Vec<FolderEntry>,
}

impl SiteFiles {
    pub fn file(&self, name: &str) -> Option<&FolderEntry> {
        self.entries.iter().find(|e| e.is_file() && e.name == name)
    }

    pub fn page_file(&self, name: &str) -> Option<&FolderEntry> {
        self.page_files.iter().find(|e| e.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct MasterSite {
    pub files: SiteFiles,
    pub structure: SiteStructure,
    pub info: SiteInfo,
}

/// Outcome of a locale lookup. A missing override is not an error.
#[derive(Debug, Clone)]
pub enum LocaleLookup {
    Present {
        structure: SiteStructure,
        info: SiteInfo,
    },
    Absent,
}

pub fn locale_file_name(locale: &str, base: &str) -> String {
    format!("{locale}_{base}")
}

/// Loads the master structure and site info of `site_name`.
pub async fn load_site<R>(repo: &R, control: &RunControl, site_name: &str) -> Result<MasterSite>
where
    R: SiteRepository + ?Sized,
{
    info!(site = %site_name, "[STRUCTURE] Locating site folder");
    let site = control
        .guard("site lookup", repo.find_site(site_name))
        .await
        .map_err(|e| not_found_as(e, format!("site {site_name}")))?;

    let entries = control
        .guard("site folder listing", repo.list_folder(&site.id))
        .await
        .map_err(|e| not_found_as(e, format!("folder of site {site_name}")))?;

    let pages_folder = entries
        .iter()
        .find(|e| e.is_folder() && e.name == PAGES_FOLDER)
        .cloned()
        .ok_or_else(|| IndexError::NotFound(format!("pages folder of site {site_name}")))?;

    let page_files = control
        .guard("pages folder listing", repo.list_folder(&pages_folder.id))
        .await?;
    debug!(site = %site_name, page_files = page_files.len(), "[STRUCTURE] Listed pages folder");

    let files = SiteFiles {
        site,
        entries,
        page_files,
    };

    let structure_entry = files
        .file(STRUCTURE_FILE)
        .cloned()
        .ok_or_else(|| IndexError::NotFound(format!("{STRUCTURE_FILE} of site {site_name}")))?;
    let structure: SiteStructure = read_json(repo, control, &structure_entry).await?;

    let info_entry = files
        .file(SITEINFO_FILE)
        .cloned()
        .ok_or_else(|| IndexError::NotFound(format!("{SITEINFO_FILE} of site {site_name}")))?;
    let info: SiteInfo = read_json(repo, control, &info_entry).await?;

    info!(
        site = %site_name,
        pages = structure.pages.len(),
        "[STRUCTURE] Loaded master structure"
    );
    Ok(MasterSite {
        files,
        structure,
        info,
    })
}

/// Loads the locale override structure and site info.
///
/// Returns [`LocaleLookup::Absent`] when either file is missing or reported as not found.
/// Any other failure (transport, malformed JSON) is returned as an error.
pub async fn load_locale<R>(
    repo: &R,
    control: &RunControl,
    files: &SiteFiles,
    locale: &str,
) -> Result<LocaleLookup>
where
    R: SiteRepository + ?Sized,
{
    let structure_name = locale_file_name(locale, STRUCTURE_FILE);
    let info_name = locale_file_name(locale, SITEINFO_FILE);

    let (Some(structure_entry), Some(info_entry)) =
        (files.file(&structure_name), files.file(&info_name))
    else {
        warn!(locale = %locale, "[STRUCTURE] Locale override files absent, locale will be skipped");
        return Ok(LocaleLookup::Absent);
    };

    let structure = match read_json::<SiteStructure, _>(repo, control, structure_entry).await {
        Ok(s) => s,
        Err(IndexError::Repo(e)) if e.is_not_found() => return Ok(LocaleLookup::Absent),
        Err(e) => return Err(e),
    };
    let info = match read_json::<SiteInfo, _>(repo, control, info_entry).await {
        Ok(i) => i,
        Err(IndexError::Repo(e)) if e.is_not_found() => return Ok(LocaleLookup::Absent),
        Err(e) => return Err(e),
    };

    info!(
        locale = %locale,
        overridden_pages = structure.pages.len(),
        "[STRUCTURE] Loaded locale structure"
    );
    Ok(LocaleLookup::Present { structure, info })
}

async fn read_json<T, R>(repo: &R, control: &RunControl, entry: &FolderEntry) -> Result<T>
where
    T: DeserializeOwned,
    R: SiteRepository + ?Sized,
{
    let bytes = control.guard(&entry.name, repo.read_file(&entry.id)).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn not_found_as(e: IndexError, what: String) -> IndexError {
    match e {
        IndexError::Repo(repo) if repo.is_not_found() => IndexError::NotFound(what),
        other => other,
    }
}
