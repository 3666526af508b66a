//! Page data download: fetches the JSON page definitions of a site in bounded batches.
//!
//! Downloads inside a batch run concurrently; batches run one after the other so the number
//! of open connections never exceeds the batch size. A page that fails to download or parse
//! is logged and left out; callers must tolerate missing pages.

use std::collections::HashMap;

use futures::future::join_all;
use tracing::{debug, error, info};

use crate::context::RunControl;
use crate::contract::SiteRepository;
use crate::error::{IndexError, Result};
use crate::site::{PageDocument, SiteStructure};
use crate::structure::SiteFiles;

pub const PAGE_BATCH_SIZE: usize = 16;

/// A page JSON file to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFile {
    pub file_id: String,
    pub file_name: String,
}

impl PageFile {
    /// `12.json` → `12`, `fr-FR_12.json` → `fr-FR_12`.
    pub fn key(&self) -> &str {
        self.file_name
            .strip_suffix(".json")
            .unwrap_or(&self.file_name)
    }
}

/// Page files for every page of the master structure.
pub fn master_page_files(files: &SiteFiles, structure: &SiteStructure) -> Vec<PageFile> {
    select_page_files(files, structure, |id| format!("{id}.json"))
}

/// Locale override page files (`<locale>_<id>.json`) that exist for pages of `structure`.
pub fn locale_page_files(files: &SiteFiles, structure: &SiteStructure, locale: &str) -> Vec<PageFile> {
    select_page_files(files, structure, |id| format!("{locale}_{id}.json"))
}

fn select_page_files<F>(files: &SiteFiles, structure: &SiteStructure, name_of: F) -> Vec<PageFile>
where
    F: Fn(&str) -> String,
{
    structure
        .pages
        .iter()
        .filter_map(|page| {
            let name = name_of(&page.id);
            match files.page_file(&name) {
                Some(entry) => Some(PageFile {
                    file_id: entry.id.clone(),
                    file_name: entry.name.clone(),
                }),
                None => {
                    debug!(page_id = %page.id, file = %name, "[DOWNLOAD] No page file for page");
                    None
                }
            }
        })
        .collect()
}

/// Downloaded page documents keyed by [`PageFile::key`].
#[derive(Debug, Clone, Default)]
pub struct PageManifest {
    pub pages: HashMap<String, PageDocument>,
    pub skipped: Vec<String>,
}

/// Batch downloader for page files.
pub struct PageDownloader {
    batch_size: usize,
}

impl Default for PageDownloader {
    fn default() -> Self {
        Self::new(PAGE_BATCH_SIZE)
    }
}

impl PageDownloader {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Downloads and parses `files`. Only cancellation or deadline expiry fail the call.
    pub async fn download_all<R>(
        &self,
        repo: &R,
        control: &RunControl,
        files: &[PageFile],
    ) -> Result<PageManifest>
    where
        R: SiteRepository + ?Sized,
    {
        info!(
            files = files.len(),
            batch_size = self.batch_size,
            "[DOWNLOAD] Downloading page files"
        );
        let mut manifest = PageManifest::default();

        for (batch_no, batch) in files.chunks(self.batch_size).enumerate() {
            let downloads = batch.iter().map(|file| async move {
                let outcome = control
                    .guard(&file.file_name, repo.read_file(&file.file_id))
                    .await
                    .and_then(|bytes| {
                        PageDocument::parse(file.key(), &bytes).map_err(IndexError::from)
                    });
                (file, outcome)
            });

            for (file, outcome) in join_all(downloads).await {
                match outcome {
                    Ok(doc) => {
                        manifest.pages.insert(file.key().to_string(), doc);
                    }
                    Err(e @ (IndexError::Cancelled | IndexError::Timeout(_))) => return Err(e),
                    Err(e) => {
                        error!(file = %file.file_name, error = %e, "[DOWNLOAD] Failed to fetch page file, skipping");
                        manifest.skipped.push(file.file_name.clone());
                    }
                }
            }
            debug!(batch = batch_no, downloaded = manifest.pages.len(), "[DOWNLOAD] Batch complete");
        }

        info!(
            downloaded = manifest.pages.len(),
            skipped = manifest.skipped.len(),
            "[DOWNLOAD] Page files downloaded"
        );
        Ok(manifest)
    }
}
