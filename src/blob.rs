//! Blob store gateway. Files live under slash-delimited folder paths and are
//! addressed by store-assigned ids. `ImageKitClient` talks to the ImageKit
//! REST API; `MemoryBlobStore` keeps everything in process.

use crate::config::ImageKitConfig;
use crate::errors::ApiError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use reqwest::{multipart, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Mutex;
use uuid::Uuid;

pub const LIST_PAGE_SIZE: usize = 1000;

const IMAGEKIT_API: &str = "https://api.imagekit.io/v1";
const IMAGEKIT_UPLOAD: &str = "https://upload.imagekit.io/api/v1/files/upload";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredFile {
    pub file_id: String,
    pub name: String,
    /// Full path including the file name, e.g. `/StrategicDocs/2022 - Plan.pdf`
    pub file_path: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub size: u64,
    pub mime: Option<String>,
}

impl StoredFile {
    /// Folder part of `file_path`, `/` for top-level files.
    pub fn folder(&self) -> String {
        match self.file_path.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(idx) => self.file_path[..idx].to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlobEntry {
    File(StoredFile),
    Folder { name: String, path: String },
}

/// `StrategicDocs/`, `/StrategicDocs` and ` /StrategicDocs/ ` all become `/StrategicDocs`.
pub fn normalize_folder(folder: &str) -> String {
    let trimmed = folder.trim().trim_matches('/');
    let collapsed: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", collapsed.join("/"))
}

pub fn join_path(folder: &str, name: &str) -> String {
    let folder = normalize_folder(folder);
    if folder == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", folder, name)
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// One page of the direct children of `folder`.
    async fn list_folder(&self, folder: &str, skip: usize, limit: usize) -> Result<Vec<BlobEntry>, ApiError>;

    async fn upload(&self, folder: &str, file_name: &str, bytes: Vec<u8>) -> Result<StoredFile, ApiError>;

    async fn delete(&self, file_id: &str) -> Result<(), ApiError>;

    /// Changes the name only; the file id stays the same.
    async fn rename(&self, file_id: &str, new_name: &str) -> Result<StoredFile, ApiError>;

    async fn move_file(&self, source_path: &str, destination_folder: &str) -> Result<(), ApiError>;

    /// Every direct child of `folder`, walking pages until a short one.
    async fn list_all(&self, folder: &str) -> Result<Vec<BlobEntry>, ApiError> {
        let mut entries = Vec::new();
        let mut skip = 0;
        loop {
            let page = self.list_folder(folder, skip, LIST_PAGE_SIZE).await?;
            let fetched = page.len();
            entries.extend(page);
            if fetched < LIST_PAGE_SIZE {
                break;
            }
            skip += fetched;
        }
        Ok(entries)
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ImageKitItem {
    #[serde(rename = "type", default)]
    kind: String,
    name: String,
    file_id: Option<String>,
    file_path: Option<String>,
    folder_path: Option<String>,
    url: Option<String>,
    created_at: Option<DateTime<Utc>>,
    size: Option<u64>,
    mime: Option<String>,
}

impl ImageKitItem {
    fn into_entry(self) -> Option<BlobEntry> {
        if self.kind == "folder" {
            let path = self.folder_path.map(|p| normalize_folder(&p))?;
            return Some(BlobEntry::Folder { name: self.name, path });
        }
        self.into_file().map(BlobEntry::File)
    }

    fn into_file(self) -> Option<StoredFile> {
        Some(StoredFile {
            file_id: self.file_id?,
            file_path: self.file_path.unwrap_or_else(|| join_path("/", &self.name)),
            name: self.name,
            url: self.url.unwrap_or_default(),
            created_at: self.created_at.unwrap_or_else(Utc::now),
            size: self.size.unwrap_or(0),
            mime: self.mime,
        })
    }
}

pub struct ImageKitClient {
    client: reqwest::Client,
    private_key: String,
}

impl ImageKitClient {
    pub fn new(config: &ImageKitConfig) -> Self {
        info!("Using ImageKit blob store at {}", config.url_endpoint);
        Self {
            client: reqwest::Client::new(),
            private_key: config.private_key.clone(),
        }
    }

    async fn checked(response: reqwest::Response, what: &str) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFoundError(format!("{} not found", what)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::DependencyError(format!(
                "ImageKit {} failed with {}: {}",
                what, status, body
            )));
        }
        Ok(response)
    }

    async fn details(&self, file_id: &str) -> Result<StoredFile, ApiError> {
        let response = self
            .client
            .get(format!("{}/files/{}/details", IMAGEKIT_API, file_id))
            .basic_auth(&self.private_key, Some(""))
            .send()
            .await?;
        let item: ImageKitItem = Self::checked(response, "File").await?.json().await?;
        item.into_file()
            .ok_or_else(|| ApiError::DependencyError("ImageKit returned a file without id".to_string()))
    }
}

#[async_trait]
impl BlobStore for ImageKitClient {
    async fn list_folder(&self, folder: &str, skip: usize, limit: usize) -> Result<Vec<BlobEntry>, ApiError> {
        let folder = normalize_folder(folder);
        debug!("Listing ImageKit folder {} (skip={}, limit={})", folder, skip, limit);
        let response = self
            .client
            .get(format!("{}/files", IMAGEKIT_API))
            .basic_auth(&self.private_key, Some(""))
            .query(&[
                ("path", folder.clone()),
                ("type", "all".to_string()),
                ("skip", skip.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?;
        let items: Vec<ImageKitItem> = Self::checked(response, "Folder").await?.json().await?;
        Ok(items.into_iter().filter_map(ImageKitItem::into_entry).collect())
    }

    async fn upload(&self, folder: &str, file_name: &str, bytes: Vec<u8>) -> Result<StoredFile, ApiError> {
        let form = multipart::Form::new()
            .part("file", multipart::Part::bytes(bytes).file_name(file_name.to_string()))
            .text("fileName", file_name.to_string())
            .text("folder", normalize_folder(folder))
            .text("useUniqueFileName", "false");

        let response = self
            .client
            .post(IMAGEKIT_UPLOAD)
            .basic_auth(&self.private_key, Some(""))
            .multipart(form)
            .send()
            .await?;
        let item: ImageKitItem = Self::checked(response, "Upload").await?.json().await?;
        let file = item
            .into_file()
            .ok_or_else(|| ApiError::DependencyError("ImageKit upload returned no file id".to_string()))?;
        info!("Uploaded {} as {}", file.file_path, file.file_id);
        Ok(file)
    }

    async fn delete(&self, file_id: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .delete(format!("{}/files/{}", IMAGEKIT_API, file_id))
            .basic_auth(&self.private_key, Some(""))
            .send()
            .await?;
        Self::checked(response, "File").await?;
        info!("Deleted file {}", file_id);
        Ok(())
    }

    async fn rename(&self, file_id: &str, new_name: &str) -> Result<StoredFile, ApiError> {
        let current = self.details(file_id).await?;
        let response = self
            .client
            .put(format!("{}/files/rename", IMAGEKIT_API))
            .basic_auth(&self.private_key, Some(""))
            .json(&json!({
                "filePath": current.file_path,
                "newFileName": new_name,
                "purgeCache": false,
            }))
            .send()
            .await?;
        Self::checked(response, "File").await?;
        self.details(file_id).await
    }

    async fn move_file(&self, source_path: &str, destination_folder: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .post(format!("{}/files/move", IMAGEKIT_API))
            .basic_auth(&self.private_key, Some(""))
            .json(&json!({
                "sourceFilePath": source_path,
                "destinationPath": normalize_folder(destination_folder),
            }))
            .send()
            .await?;
        Self::checked(response, "File").await?;
        info!("Moved {} to {}", source_path, destination_folder);
        Ok(())
    }
}

/// Flat list of files; folders are implied by their paths.
#[derive(Default)]
pub struct MemoryBlobStore {
    files: Mutex<Vec<StoredFile>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files(files: Vec<StoredFile>) -> Self {
        Self {
            files: Mutex::new(files),
        }
    }

    fn files(&self) -> Result<std::sync::MutexGuard<'_, Vec<StoredFile>>, ApiError> {
        self.files
            .lock()
            .map_err(|_| ApiError::InternalError("blob store lock poisoned".to_string()))
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn list_folder(&self, folder: &str, skip: usize, limit: usize) -> Result<Vec<BlobEntry>, ApiError> {
        let folder = normalize_folder(folder);
        let prefix = if folder == "/" { "/".to_string() } else { format!("{}/", folder) };
        let files = self.files()?;

        let mut folders: Vec<String> = files
            .iter()
            .filter_map(|f| {
                let parent = f.folder();
                let rest = parent.strip_prefix(&prefix)?;
                rest.split('/').next().filter(|s| !s.is_empty()).map(str::to_string)
            })
            .collect();
        folders.sort();
        folders.dedup();

        let mut direct: Vec<StoredFile> = files.iter().filter(|f| f.folder() == folder).cloned().collect();
        direct.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(folders
            .into_iter()
            .map(|name| BlobEntry::Folder {
                path: join_path(&folder, &name),
                name,
            })
            .chain(direct.into_iter().map(BlobEntry::File))
            .skip(skip)
            .take(limit)
            .collect())
    }

    async fn upload(&self, folder: &str, file_name: &str, bytes: Vec<u8>) -> Result<StoredFile, ApiError> {
        let file_path = join_path(folder, file_name);
        let file = StoredFile {
            file_id: Uuid::new_v4().simple().to_string(),
            name: file_name.to_string(),
            url: format!("memory://{}", file_path.trim_start_matches('/')),
            file_path,
            created_at: Utc::now(),
            size: bytes.len() as u64,
            mime: None,
        };
        let mut files = self.files()?;
        files.retain(|f| f.file_path != file.file_path);
        files.push(file.clone());
        Ok(file)
    }

    async fn delete(&self, file_id: &str) -> Result<(), ApiError> {
        let mut files = self.files()?;
        let before = files.len();
        files.retain(|f| f.file_id != file_id);
        if files.len() == before {
            return Err(ApiError::NotFoundError("File not found".to_string()));
        }
        Ok(())
    }

    async fn rename(&self, file_id: &str, new_name: &str) -> Result<StoredFile, ApiError> {
        let mut files = self.files()?;
        let file = files
            .iter_mut()
            .find(|f| f.file_id == file_id)
            .ok_or_else(|| ApiError::NotFoundError("File not found".to_string()))?;
        file.file_path = join_path(&file.folder(), new_name);
        file.name = new_name.to_string();
        Ok(file.clone())
    }

    async fn move_file(&self, source_path: &str, destination_folder: &str) -> Result<(), ApiError> {
        let mut files = self.files()?;
        let file = files
            .iter_mut()
            .find(|f| f.file_path == source_path)
            .ok_or_else(|| ApiError::NotFoundError("File not found".to_string()))?;
        file.file_path = join_path(destination_folder, &file.name);
        Ok(())
    }
}
