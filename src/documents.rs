use crate::blob::{join_path, normalize_folder, BlobEntry, BlobStore, StoredFile};
use crate::errors::ApiError;
use chrono::{Datelike, NaiveDate};
use log::{debug, info};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::OnceLock;

pub const DOCUMENT_TYPES: [&str; 2] = ["pdf", "docx"];
pub const DEFAULT_PER_PAGE: usize = 10;
pub const MAX_PER_PAGE: usize = 100;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub year: i32,
    pub date: NaiveDate,
    pub folder_path: String,
    pub url: String,
    pub size: u64,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Subfolder {
    pub name: String,
    pub path: String,
}

fn year_prefix() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d{4})\s*[-_]").expect("year pattern is valid"))
}

/// `2022 - Annual Report.pdf` -> 2022
pub fn year_from_name(name: &str) -> Option<i32> {
    year_prefix()
        .captures(name.trim_start())
        .and_then(|caps| caps[1].parse().ok())
}

pub fn extension(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// `None` for anything that is not a pdf or docx.
pub fn to_document(file: &StoredFile) -> Option<Document> {
    let doc_type = extension(&file.name).filter(|ext| DOCUMENT_TYPES.contains(&ext.as_str()))?;
    Some(Document {
        id: file.file_id.clone(),
        title: file.name.clone(),
        doc_type,
        year: year_from_name(&file.name).unwrap_or_else(|| file.created_at.year()),
        date: file.created_at.date_naive(),
        folder_path: file.folder(),
        url: file.url.clone(),
        size: file.size,
    })
}

/// Every file at or below `prefix`, descending into subfolders.
pub async fn collect_files(store: &dyn BlobStore, prefix: &str) -> Result<Vec<StoredFile>, ApiError> {
    let mut files = Vec::new();
    let mut visited = HashSet::new();
    let mut pending = VecDeque::from([normalize_folder(prefix)]);

    while let Some(folder) = pending.pop_front() {
        if !visited.insert(folder.clone()) {
            continue;
        }
        for entry in store.list_all(&folder).await? {
            match entry {
                BlobEntry::File(file) => files.push(file),
                BlobEntry::Folder { path, .. } => pending.push_back(path),
            }
        }
    }

    debug!("Collected {} files under {}", files.len(), prefix);
    Ok(files)
}

/// Full document listing under `prefix`, sorted by title.
pub async fn list_documents(store: &dyn BlobStore, prefix: &str) -> Result<Vec<Document>, ApiError> {
    let mut documents: Vec<Document> = collect_files(store, prefix)
        .await?
        .iter()
        .filter_map(to_document)
        .collect();
    documents.sort_by(|a, b| a.title.cmp(&b.title).then_with(|| a.id.cmp(&b.id)));
    Ok(documents)
}

/// Direct subfolders of `prefix`, sorted by name.
pub async fn list_subfolders(store: &dyn BlobStore, prefix: &str) -> Result<Vec<Subfolder>, ApiError> {
    let mut folders: Vec<Subfolder> = store
        .list_all(prefix)
        .await?
        .into_iter()
        .filter_map(|entry| match entry {
            BlobEntry::Folder { name, path } => Some(Subfolder { name, path }),
            BlobEntry::File(_) => None,
        })
        .collect();
    folders.sort_by(|a, b| a.name.cmp(&b.name));
    folders.dedup();
    Ok(folders)
}

/// Resolves a requested folder against `root`. Relative paths are taken
/// from `root`; absolute ones must stay inside it.
pub fn scoped_prefix(root: &str, requested: Option<&str>) -> Result<String, ApiError> {
    let root = normalize_folder(root);
    let requested = match requested.map(str::trim).filter(|p| !p.is_empty()) {
        None => return Ok(root),
        Some(p) if p.starts_with('/') => normalize_folder(p),
        Some(p) => join_path(&root, &normalize_folder(p)[1..]),
    };

    if requested.split('/').any(|segment| segment == "..") {
        return Err(ApiError::ValidationError("Folder path may not contain '..'".to_string()));
    }
    let inside = root == "/" || requested == root || requested.starts_with(&format!("{}/", root));
    if !inside {
        return Err(ApiError::ForbiddenError(format!("Folder must be inside {}", root)));
    }
    Ok(requested)
}

fn validate_file_name(name: &str) -> Result<(), ApiError> {
    let name = name.trim();
    if name.is_empty() || name.contains('/') {
        return Err(ApiError::ValidationError("A plain file name is required".to_string()));
    }
    match extension(name) {
        Some(ext) if DOCUMENT_TYPES.contains(&ext.as_str()) => Ok(()),
        _ => Err(ApiError::ValidationError(format!(
            "Only {} files are accepted",
            DOCUMENT_TYPES.join(" and ")
        ))),
    }
}

pub async fn upload_document(
    store: &dyn BlobStore,
    root: &str,
    folder: Option<&str>,
    file_name: &str,
    bytes: Vec<u8>,
) -> Result<Document, ApiError> {
    validate_file_name(file_name)?;
    if bytes.is_empty() {
        return Err(ApiError::ValidationError("Uploaded file is empty".to_string()));
    }
    let folder = scoped_prefix(root, folder)?;

    let stored = store.upload(&folder, file_name.trim(), bytes).await?;
    info!("Uploaded document {} to {}", stored.file_id, folder);
    to_document(&stored)
        .ok_or_else(|| ApiError::InternalError(format!("Uploaded file {} is not a document", stored.file_id)))
}

/// The file id is unchanged by a rename.
pub async fn rename_document(store: &dyn BlobStore, file_id: &str, new_name: &str) -> Result<Document, ApiError> {
    validate_file_name(new_name)?;
    let renamed = store.rename(file_id, new_name.trim()).await?;
    to_document(&renamed)
        .ok_or_else(|| ApiError::InternalError(format!("Renamed file {} is not a document", file_id)))
}

/// Not transactional with anything else; a failure leaves the file where it was.
pub async fn move_document(
    store: &dyn BlobStore,
    root: &str,
    source_path: &str,
    destination_folder: &str,
) -> Result<(), ApiError> {
    let source_path = source_path.trim();
    // A bare file name lives directly in the root.
    let (source_folder, file_name) = match source_path.rsplit_once('/') {
        Some(("", name)) => (Some("/"), name),
        Some((folder, name)) => (Some(folder), name),
        None => (None, source_path),
    };
    if file_name.is_empty() {
        return Err(ApiError::ValidationError("Source path must name a file".to_string()));
    }
    let source = join_path(&scoped_prefix(root, source_folder)?, file_name);
    let destination = scoped_prefix(root, Some(destination_folder))?;

    store.move_file(&source, &destination).await
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct DocumentQuery {
    pub prefix: Option<String>,
    pub search: Option<String>,
    #[serde(rename = "type")]
    pub doc_type: Option<String>,
    pub year: Option<i32>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct DocumentPage {
    pub items: Vec<Document>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
    /// Facets over the unfiltered listing
    pub years: Vec<i32>,
    pub types: Vec<String>,
}

impl DocumentQuery {
    fn matches(&self, doc: &Document) -> bool {
        let search = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty());
        if let Some(needle) = search {
            if !doc.title.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        if let Some(doc_type) = self.doc_type.as_deref().filter(|t| !t.is_empty() && *t != "all") {
            if !doc.doc_type.eq_ignore_ascii_case(doc_type) {
                return false;
            }
        }
        if let Some(year) = self.year {
            if doc.year != year {
                return false;
            }
        }
        true
    }

    /// Search, type and year filters, then one page of the result.
    pub fn apply(&self, documents: &[Document]) -> DocumentPage {
        let per_page = self.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
        let page = self.page.unwrap_or(1).max(1);

        let years: BTreeSet<i32> = documents.iter().map(|d| d.year).collect();
        let types: BTreeSet<String> = documents.iter().map(|d| d.doc_type.clone()).collect();

        let matching: Vec<&Document> = documents.iter().filter(|d| self.matches(d)).collect();
        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(page.saturating_sub(1).saturating_mul(per_page))
            .take(per_page)
            .cloned()
            .collect();

        DocumentPage {
            items,
            total,
            page,
            per_page,
            total_pages: total.div_ceil(per_page),
            years: years.into_iter().rev().collect(),
            types: types.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use chrono::{TimeZone, Utc};

    fn file(path: &str, year: i32) -> StoredFile {
        let name = path.rsplit('/').next().unwrap().to_string();
        StoredFile {
            file_id: format!("id:{}", path),
            name,
            file_path: path.to_string(),
            url: format!("https://cdn.example{}", path),
            created_at: Utc.with_ymd_and_hms(year, 3, 15, 12, 0, 0).unwrap(),
            size: 10,
            mime: None,
        }
    }

    #[test]
    fn year_prefix_wins_over_creation_date() {
        let doc = to_document(&file("/Docs/2022 - Annual Report.pdf", 2024)).unwrap();
        assert_eq!(doc.year, 2022);
        assert_eq!(doc.date, NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
    }

    #[test]
    fn creation_year_is_the_fallback() {
        let doc = to_document(&file("/Docs/Annual Report.pdf", 2021)).unwrap();
        assert_eq!(doc.year, 2021);
    }

    #[test]
    fn prefixes_stay_under_the_root() {
        assert_eq!(scoped_prefix("/StrategicDocs", None).unwrap(), "/StrategicDocs");
        assert_eq!(scoped_prefix("/StrategicDocs", Some("Webinar 1")).unwrap(), "/StrategicDocs/Webinar 1");
        assert_eq!(
            scoped_prefix("/StrategicDocs", Some("/StrategicDocs/Webinar 1/")).unwrap(),
            "/StrategicDocs/Webinar 1"
        );
        assert!(matches!(scoped_prefix("/StrategicDocs", Some("/Private")), Err(ApiError::ForbiddenError(_))));
        assert!(matches!(scoped_prefix("/StrategicDocs", Some("/StrategicDocsOld")), Err(ApiError::ForbiddenError(_))));
        assert!(scoped_prefix("/StrategicDocs", Some("../Private")).is_err());
    }

    #[tokio::test]
    async fn uploads_accept_documents_only() {
        let store = MemoryBlobStore::new();
        let doc = upload_document(&store, "/StrategicDocs", Some("Webinar 3"), "2023 - Slides.pdf", vec![1])
            .await
            .unwrap();
        assert_eq!(doc.folder_path, "/StrategicDocs/Webinar 3");
        assert_eq!(doc.year, 2023);

        let err = upload_document(&store, "/StrategicDocs", None, "logo.png", vec![1]).await.unwrap_err();
        assert!(matches!(err, ApiError::ValidationError(_)));
    }

    #[tokio::test]
    async fn move_keeps_the_file_under_the_root() {
        let store = MemoryBlobStore::with_files(vec![file("/StrategicDocs/a.pdf", 2020)]);
        let err = move_document(&store, "/StrategicDocs", "/StrategicDocs/a.pdf", "/Elsewhere")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::ForbiddenError(_)));

        move_document(&store, "/StrategicDocs", "/StrategicDocs/a.pdf", "Archive")
            .await
            .unwrap();
        let docs = list_documents(&store, "/StrategicDocs/Archive").await.unwrap();
        assert_eq!(docs.len(), 1);
    }

    #[tokio::test]
    async fn relative_move_source_resolves_under_the_root() {
        let store = MemoryBlobStore::with_files(vec![
            file("Private/secret.pdf", 2020),
            file("/StrategicDocs/Private/notes.pdf", 2020),
        ]);

        let err = move_document(&store, "/StrategicDocs", "Private/secret.pdf", "Archive")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFoundError(_)));

        move_document(&store, "/StrategicDocs", "Private/notes.pdf", "Archive")
            .await
            .unwrap();
        let moved = list_documents(&store, "/StrategicDocs/Archive").await.unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].title, "notes.pdf");
    }

    #[test]
    fn huge_page_number_is_just_empty() {
        let docs = vec![to_document(&file("/Docs/a.pdf", 2020)).unwrap()];
        let query = DocumentQuery {
            page: Some(usize::MAX),
            per_page: Some(10),
            ..Default::default()
        };
        let page = query.apply(&docs);
        assert!(page.items.is_empty());
        assert_eq!(page.total, 1);
        assert_eq!(page.total_pages, 1);
    }

    #[test]
    fn year_prefix_variants() {
        assert_eq!(year_from_name("2019_budget.docx"), Some(2019));
        assert_eq!(year_from_name("2019-budget.docx"), Some(2019));
        assert_eq!(year_from_name("2019 budget.docx"), None);
        assert_eq!(year_from_name("Budget 2019 - v2.docx"), None);
    }

    #[test]
    fn only_pdf_and_docx_become_documents() {
        let docs: Vec<Document> = ["/D/report.pdf", "/D/notes.docx", "/D/image.png", "/D/Scan.PDF", "/D/.pdf"]
            .iter()
            .filter_map(|p| to_document(&file(p, 2020)))
            .collect();
        assert_eq!(docs.len(), 3);
        assert!(docs.iter().all(|d| d.doc_type == "pdf" || d.doc_type == "docx"));
    }

    #[tokio::test]
    async fn listing_descends_and_sorts_by_title() {
        let store = MemoryBlobStore::with_files(vec![
            file("/StrategicDocs/b.pdf", 2020),
            file("/StrategicDocs/Webinar 1/a.docx", 2021),
            file("/StrategicDocs/Webinar 2/c.pdf", 2022),
            file("/StrategicDocs/Webinar 2/logo.png", 2022),
            file("/Other/z.pdf", 2022),
        ]);

        let docs = list_documents(&store, "StrategicDocs").await.unwrap();
        let titles: Vec<&str> = docs.iter().map(|d| d.title.as_str()).collect();
        assert_eq!(titles, vec!["a.docx", "b.pdf", "c.pdf"]);
        assert_eq!(docs[0].folder_path, "/StrategicDocs/Webinar 1");
    }

    #[tokio::test]
    async fn subfolders_are_first_level_only() {
        let store = MemoryBlobStore::with_files(vec![
            file("/StrategicDocs/Webinar 2/Slides/deck.pdf", 2022),
            file("/StrategicDocs/Webinar 1/a.pdf", 2021),
            file("/StrategicDocs/top.pdf", 2021),
        ]);

        let folders = list_subfolders(&store, "/StrategicDocs").await.unwrap();
        let names: Vec<&str> = folders.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Webinar 1", "Webinar 2"]);
        assert_eq!(folders[1].path, "/StrategicDocs/Webinar 2");
    }

    fn sample_docs() -> Vec<Document> {
        let mut docs: Vec<Document> = (0..25)
            .map(|i| {
                let ext = if i % 5 == 0 { "docx" } else { "pdf" };
                to_document(&file(&format!("/D/{} - Item {:02}.{}", 2015 + i % 3, i, ext), 2020)).unwrap()
            })
            .collect();
        docs.sort_by(|a, b| a.title.cmp(&b.title));
        docs
    }

    #[test]
    fn filters_combine_before_paging() {
        let docs = sample_docs();
        let query = DocumentQuery {
            doc_type: Some("pdf".to_string()),
            year: Some(2016),
            ..Default::default()
        };
        let page = query.apply(&docs);
        assert!(page.items.iter().all(|d| d.doc_type == "pdf" && d.year == 2016));
        assert_eq!(page.total, page.items.len());
        assert_eq!(page.years, vec![2017, 2016, 2015]);
        assert_eq!(page.types, vec!["docx".to_string(), "pdf".to_string()]);
    }

    #[test]
    fn search_is_case_insensitive_substring() {
        let docs = sample_docs();
        let query = DocumentQuery {
            search: Some("item 07".to_string()),
            ..Default::default()
        };
        let page = query.apply(&docs);
        assert_eq!(page.total, 1);
        assert!(page.items[0].title.contains("Item 07"));
    }

    #[test]
    fn pagination_reports_totals() {
        let docs = sample_docs();
        let query = DocumentQuery {
            page: Some(3),
            per_page: Some(10),
            ..Default::default()
        };
        let page = query.apply(&docs);
        assert_eq!(page.total, 25);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.items.len(), 5);

        let beyond = DocumentQuery { page: Some(9), ..query }.apply(&docs);
        assert!(beyond.items.is_empty());
    }
}
