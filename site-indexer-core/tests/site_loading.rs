use serde_json::json;

use site_indexer_core::context::RunControl;
use site_indexer_core::contract::{FolderEntry, MockSiteRepository, SiteSummary};
use site_indexer_core::download::{master_page_files, PageDownloader, PageFile};
use site_indexer_core::error::{IndexError, RepoError};
use site_indexer_core::structure::{load_locale, load_site, LocaleLookup};

fn entry(kind: &str, id: &str, name: &str) -> FolderEntry {
    FolderEntry {
        kind: kind.into(),
        id: id.into(),
        name: name.into(),
    }
}

fn site_repo(root: Vec<FolderEntry>) -> MockSiteRepository {
    let mut repo = MockSiteRepository::new();
    repo.expect_find_site().returning(|name| {
        Ok(SiteSummary {
            id: "SITE".into(),
            name: name.into(),
        })
    });
    repo.expect_list_folder().returning(move |id| {
        Ok(match id {
            "SITE" => root.clone(),
            _ => vec![
                entry("file", "F-1", "1.json"),
                entry("file", "F-2", "2.json"),
                entry("file", "F-FR-1", "fr-FR_1.json"),
            ],
        })
    });
    repo
}

fn standard_root() -> Vec<FolderEntry> {
    vec![
        entry("folder", "PAGES", "pages"),
        entry("file", "F-STRUCTURE", "structure.json"),
        entry("file", "F-SITEINFO", "siteinfo.json"),
        entry("file", "F-FR-STRUCTURE", "fr-FR_structure.json"),
        entry("file", "F-FR-SITEINFO", "fr-FR_siteinfo.json"),
    ]
}

#[tokio::test]
async fn loads_master_structure_and_page_files() {
    let mut repo = site_repo(standard_root());
    repo.expect_read_file().returning(|id| {
        let body = match id {
            "F-STRUCTURE" => json!({"pages": [
                {"id": 1, "name": "Home", "pageUrl": "index.html"},
                {"id": 2, "name": "News", "pageUrl": "news.html"},
                {"id": 3, "name": "Orphan", "pageUrl": "orphan.html"}
            ]}),
            _ => json!({"properties": {"channelId": "CH1"}}),
        };
        Ok(body.to_string().into_bytes())
    });

    let control = RunControl::new();
    let site = load_site(&repo, &control, "blog").await.expect("site loads");
    assert_eq!(site.structure.pages.len(), 3);
    assert_eq!(site.info.properties.channel_id.as_deref(), Some("CH1"));

    let files = master_page_files(&site.files, &site.structure);
    let names: Vec<&str> = files.iter().map(|f| f.file_name.as_str()).collect();
    assert_eq!(names, vec!["1.json", "2.json"], "page 3 has no file");
}

#[tokio::test]
async fn missing_structure_file_is_not_found() {
    let repo = site_repo(vec![entry("folder", "PAGES", "pages")]);
    let control = RunControl::new();
    let err = load_site(&repo, &control, "blog").await.unwrap_err();
    assert!(matches!(err, IndexError::NotFound(what) if what.contains("structure.json")));
}

#[tokio::test]
async fn locale_without_override_files_is_absent() {
    let mut repo = site_repo(standard_root());
    repo.expect_read_file()
        .returning(|_| Ok(json!({"pages": []}).to_string().into_bytes()));
    let control = RunControl::new();
    let site = load_site(&repo, &control, "blog").await.unwrap();

    let lookup = load_locale(&repo, &control, &site.files, "de-DE").await.unwrap();
    assert!(matches!(lookup, LocaleLookup::Absent));
}

#[tokio::test]
async fn locale_lookup_transport_failure_is_fatal() {
    let mut repo = site_repo(standard_root());
    repo.expect_read_file().returning(|id| match id {
        "F-FR-STRUCTURE" => Err(RepoError::Transport("connection reset".into())),
        "F-FR-SITEINFO" => Err(RepoError::NotFound(id.into())),
        _ => Ok(json!({"pages": []}).to_string().into_bytes()),
    });
    let control = RunControl::new();
    let site = load_site(&repo, &control, "blog").await.unwrap();

    let err = load_locale(&repo, &control, &site.files, "fr-FR").await.unwrap_err();
    assert!(matches!(err, IndexError::Repo(RepoError::Transport(_))));
}

#[tokio::test]
async fn downloads_every_batch_and_skips_broken_pages() {
    let mut repo = MockSiteRepository::new();
    repo.expect_read_file().times(40).returning(|id| match id {
        "F-3" => Ok(b"not json".to_vec()),
        "F-4" => Err(RepoError::Status {
            status: 500,
            url: id.into(),
            body: "boom".into(),
        }),
        _ => Ok(json!({"properties": {"title": id}}).to_string().into_bytes()),
    });

    let files: Vec<PageFile> = (1..=40)
        .map(|i| PageFile {
            file_id: format!("F-{i}"),
            file_name: format!("{i}.json"),
        })
        .collect();
    let control = RunControl::new();
    let manifest = PageDownloader::new(16)
        .download_all(&repo, &control, &files)
        .await
        .expect("download completes");

    assert_eq!(manifest.pages.len(), 38);
    assert_eq!(manifest.skipped, vec!["3.json".to_string(), "4.json".to_string()]);
    assert_eq!(manifest.pages["1"].id, "1");
    assert_eq!(manifest.pages["40"].properties.title.as_deref(), Some("F-40"));
}

#[tokio::test]
async fn cancelled_download_stops_the_run() {
    let mut repo = MockSiteRepository::new();
    repo.expect_read_file()
        .returning(|_| Ok(b"{}".to_vec()));
    let control = RunControl::new();
    control.cancel_token().cancel();

    let files = vec![PageFile {
        file_id: "F-1".into(),
        file_name: "1.json".into(),
    }];
    let err = PageDownloader::default()
        .download_all(&repo, &control, &files)
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::Cancelled));
}
