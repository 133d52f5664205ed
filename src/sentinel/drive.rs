//! Google Drive v3 adapter
//!
//! This module provides:
//! 1. The `FileStore` trait the pipeline depends on (listing, download, parent lookup, reparent)
//! 2. `DriveClient`, a REST implementation holding its own HTTP client
//! 3. Credential loading; obtaining or refreshing the token happens outside this program

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::sentinel::config_loader::{DRIVE_TOKEN_ENV, Drive};
use crate::sentinel::FileDescriptor;

const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Error types for the Drive adapter
#[derive(Error, Debug)]
pub enum DriveError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Drive rejected the credentials ({status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("Drive API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Credentials error: {0}")]
    Credentials(String),
}

impl DriveError {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, DriveError::Unauthorized { .. } | DriveError::Credentials(_))
    }
}

/// Result type for Drive operations
pub type DriveResult<T> = Result<T, DriveError>;

/// Operations the pipeline needs from the file store.
///
/// A handle is used by one unit of work at a time; concurrent workers each get their own.
#[async_trait]
pub trait FileStore: Send + Sync + 'static {
    /// Every non-folder, non-trashed file created strictly after `created_after`,
    /// excluding anything directly inside `exclude_folder_ids`. Pagination is internal.
    async fn list_files(
        &self,
        created_after: Option<&str>,
        exclude_folder_ids: &[String],
    ) -> DriveResult<Vec<FileDescriptor>>;

    /// Id of the folder called `name`, created when missing.
    async fn ensure_folder(&self, name: &str) -> DriveResult<String>;

    async fn download(&self, file_id: &str) -> DriveResult<Vec<u8>>;

    async fn get_parents(&self, file_id: &str) -> DriveResult<Vec<String>>;

    /// Remove `remove` and add `add` in a single request. Returns the resulting parent set.
    async fn reparent(&self, file_id: &str, remove: &[String], add: &str) -> DriveResult<Vec<String>>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriveCredentials {
    pub access_token: String,
}

impl DriveCredentials {
    /// Load the bearer token from the environment, falling back to `token_file`.
    pub fn load(token_file: impl AsRef<Path>) -> DriveResult<Self> {
        if let Ok(token) = std::env::var(DRIVE_TOKEN_ENV) {
            if !token.trim().is_empty() {
                return Ok(Self { access_token: token.trim().to_string() });
            }
        }

        let path = token_file.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DriveError::Credentials(format!("failed to read {}: {}", path.display(), e))
        })?;
        let credentials: DriveCredentials = serde_json::from_str(&content).map_err(|e| {
            DriveError::Credentials(format!("failed to parse {}: {}", path.display(), e))
        })?;
        if credentials.access_token.trim().is_empty() {
            return Err(DriveError::Credentials(format!(
                "{} contains an empty access_token",
                path.display()
            )));
        }
        Ok(credentials)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mime_type: String,
    /// Drive encodes int64 fields as decimal strings.
    size: Option<String>,
    #[serde(default)]
    parents: Vec<String>,
}

impl DriveFile {
    fn into_descriptor(self) -> FileDescriptor {
        let size = match self.size {
            Some(raw) => match raw.parse::<u64>() {
                Ok(size) => Some(size),
                Err(_) => {
                    warn!("Ignoring unparsable size {:?} for file {}", raw, self.id);
                    None
                }
            },
            None => None,
        };
        FileDescriptor {
            id: self.id,
            name: self.name,
            size,
            mime_type: self.mime_type,
        }
    }
}

/// Quote a value for use inside a Drive search query string literal.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Build the `q` parameter for the discovery listing.
pub fn build_list_query(created_after: Option<&str>, exclude_folder_ids: &[String]) -> String {
    let mut query = format!("mimeType != {} and trashed = false", quote(FOLDER_MIME_TYPE));
    for id in exclude_folder_ids {
        query.push_str(&format!(" and not {} in parents", quote(id)));
    }
    if let Some(after) = created_after.filter(|after| !after.is_empty()) {
        query.push_str(&format!(" and createdTime > {}", quote(after)));
    }
    query
}

/// REST client for one worker slot.
pub struct DriveClient {
    client: Client,
    api_base: String,
    page_size: u32,
    credentials: Arc<DriveCredentials>,
}

impl DriveClient {
    pub fn new(config: &Drive, credentials: Arc<DriveCredentials>) -> DriveResult<Self> {
        let client = Client::builder()
            .user_agent(format!("drive_sentinel/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            page_size: config.page_size,
            credentials,
        })
    }

    fn files_url(&self) -> String {
        format!("{}/files", self.api_base)
    }

    fn file_url(&self, file_id: &str) -> String {
        format!("{}/files/{}", self.api_base, file_id)
    }

    /// Map non-success statuses to typed errors
    async fn check(response: Response) -> DriveResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED {
            return Err(DriveError::Unauthorized {
                status: status.as_u16(),
                message,
            });
        }
        Err(DriveError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn find_folder(&self, name: &str) -> DriveResult<Option<String>> {
        let query = format!(
            "mimeType = {} and name = {} and trashed = false",
            quote(FOLDER_MIME_TYPE),
            quote(name)
        );
        let response = self
            .client
            .get(self.files_url())
            .bearer_auth(&self.credentials.access_token)
            .query(&[("q", query.as_str()), ("spaces", "drive"), ("fields", "files(id)")])
            .send()
            .await?;
        let list: FileList = Self::check(response).await?.json().await?;
        Ok(list.files.into_iter().next().map(|file| file.id))
    }
}

#[async_trait]
impl FileStore for DriveClient {
    async fn list_files(
        &self,
        created_after: Option<&str>,
        exclude_folder_ids: &[String],
    ) -> DriveResult<Vec<FileDescriptor>> {
        let query = build_list_query(created_after, exclude_folder_ids);
        let page_size = self.page_size.to_string();
        debug!("Listing Drive files with query: {}", query);

        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![
                ("q", query.as_str()),
                ("pageSize", page_size.as_str()),
                ("fields", "nextPageToken, files(id, name, mimeType, size)"),
            ];
            if let Some(token) = page_token.as_deref() {
                params.push(("pageToken", token));
            }

            let response = self
                .client
                .get(self.files_url())
                .bearer_auth(&self.credentials.access_token)
                .query(&params)
                .send()
                .await?;
            let page: FileList = Self::check(response).await?.json().await?;
            debug!("Fetched a page of {} file(s)", page.files.len());

            files.extend(page.files.into_iter().map(DriveFile::into_descriptor));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(files)
    }

    async fn ensure_folder(&self, name: &str) -> DriveResult<String> {
        if let Some(id) = self.find_folder(name).await? {
            debug!("Found folder {} ({})", name, id);
            return Ok(id);
        }

        let response = self
            .client
            .post(self.files_url())
            .bearer_auth(&self.credentials.access_token)
            .query(&[("fields", "id")])
            .json(&json!({ "name": name, "mimeType": FOLDER_MIME_TYPE }))
            .send()
            .await?;
        let folder: DriveFile = Self::check(response).await?.json().await?;
        if folder.id.is_empty() {
            return Err(DriveError::InvalidResponse(format!(
                "folder {} was created without an id",
                name
            )));
        }
        Ok(folder.id)
    }

    async fn download(&self, file_id: &str) -> DriveResult<Vec<u8>> {
        let response = self
            .client
            .get(self.file_url(file_id))
            .bearer_auth(&self.credentials.access_token)
            .query(&[("alt", "media")])
            .send()
            .await?;
        let bytes = Self::check(response).await?.bytes().await?;
        Ok(bytes.to_vec())
    }

    async fn get_parents(&self, file_id: &str) -> DriveResult<Vec<String>> {
        let response = self
            .client
            .get(self.file_url(file_id))
            .bearer_auth(&self.credentials.access_token)
            .query(&[("fields", "parents")])
            .send()
            .await?;
        let file: DriveFile = Self::check(response).await?.json().await?;
        Ok(file.parents)
    }

    async fn reparent(&self, file_id: &str, remove: &[String], add: &str) -> DriveResult<Vec<String>> {
        let remove = remove.join(",");
        let mut params = vec![("addParents", add), ("fields", "id, parents")];
        if !remove.is_empty() {
            params.push(("removeParents", remove.as_str()));
        }

        let response = self
            .client
            .patch(self.file_url(file_id))
            .bearer_auth(&self.credentials.access_token)
            .query(&params)
            .json(&json!({}))
            .send()
            .await?;
        let file: DriveFile = Self::check(response).await?.json().await?;
        Ok(file.parents)
    }
}
