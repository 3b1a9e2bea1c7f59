use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{debug, info};

pub const ROOT_FOLDER_ID: &str = "root";
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
pub const ARCHIVE_MIME_TYPE: &str = "application/gzip";

const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

/// Remote object store reached through an already authenticated handle.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn find_folder(&self, name: &str, parent_id: &str) -> Result<Option<String>>;
    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<String>;
    async fn create_file(
        &self,
        name: &str,
        mime_type: &str,
        content: tokio::fs::File,
        parent_id: &str,
    ) -> Result<String>;
}

/// Resolves a `/`-separated folder path below `root_id`, creating missing
/// folders. Returns the id of the last folder.
pub async fn ensure_folder_path<S: RemoteStore + ?Sized>(
    store: &S,
    path: &str,
    root_id: &str,
) -> Result<String> {
    let mut parent = root_id.to_string();
    for segment in path_segments(path) {
        let existing = store.find_folder(segment, &parent).await?;
        parent = match existing {
            Some(id) => {
                debug!("Reusing remote folder {} ({})", segment, id);
                id
            }
            None => {
                let id = store
                    .create_folder(segment, &parent)
                    .await
                    .with_context(|| format!("Could not create remote directory: {}", segment))?;
                info!("Created remote folder {} ({})", segment, id);
                id
            }
        };
    }
    Ok(parent)
}

pub fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

// Google Drive v3 client
pub struct DriveClient {
    http: reqwest::Client,
    access_token: String,
    api_base: String,
    upload_base: String,
}

impl DriveClient {
    pub fn new(access_token: &str) -> Result<Self> {
        Self::with_endpoints(access_token, DRIVE_API_BASE, DRIVE_UPLOAD_BASE)
    }

    pub fn with_endpoints(access_token: &str, api_base: &str, upload_base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("gdrive-backup/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            access_token: access_token.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            upload_base: upload_base.trim_end_matches('/').to_string(),
        })
    }

    fn files_url(&self) -> String {
        format!("{}/files", self.api_base)
    }

    fn upload_url(&self) -> String {
        format!("{}/files?uploadType=multipart&fields=id", self.upload_base)
    }
}

async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    if !response.status().is_success() {
        let status = response.status();
        let error = response.text().await.unwrap_or_default();
        return Err(anyhow::anyhow!("{} failed ({}): {}", what, status, error));
    }
    Ok(response)
}

#[async_trait]
impl RemoteStore for DriveClient {
    async fn find_folder(&self, name: &str, parent_id: &str) -> Result<Option<String>> {
        let query = folder_query(name, parent_id);
        let url = format!(
            "{}?q={}&fields=files(id,name)",
            self.files_url(),
            url::form_urlencoded::byte_serialize(query.as_bytes()).collect::<String>()
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("Failed to search Google Drive")?;
        let response = check_status(response, "Google Drive search").await?;

        let list: DriveFileList = response
            .json()
            .await
            .context("Invalid Google Drive search response")?;
        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<String> {
        let metadata = file_metadata(name, FOLDER_MIME_TYPE, parent_id);

        let response = self
            .http
            .post(format!("{}?fields=id", self.files_url()))
            .bearer_auth(&self.access_token)
            .json(&metadata)
            .send()
            .await
            .context("Failed to create Google Drive folder")?;
        let response = check_status(response, "Google Drive folder creation").await?;

        let folder: DriveFile = response
            .json()
            .await
            .context("Invalid Google Drive folder response")?;
        Ok(folder.id)
    }

    async fn create_file(
        &self,
        name: &str,
        mime_type: &str,
        content: tokio::fs::File,
        parent_id: &str,
    ) -> Result<String> {
        info!("Uploading {} to Google Drive...", name);
        let length = content
            .metadata()
            .await
            .context("Failed to read upload size")?
            .len();
        let metadata = file_metadata(name, mime_type, parent_id);

        let form = Form::new()
            .part(
                "metadata",
                Part::text(serde_json::to_string(&metadata)?)
                    .mime_str("application/json; charset=UTF-8")?,
            )
            .part(
                "file",
                Part::stream_with_length(content, length)
                    .file_name(name.to_string())
                    .mime_str(mime_type)?,
            );

        let response = self
            .http
            .post(self.upload_url())
            .bearer_auth(&self.access_token)
            .multipart(form)
            .send()
            .await
            .context("Failed to upload to Google Drive")?;
        let response = check_status(response, "Google Drive upload").await?;

        let file: DriveFile = response
            .json()
            .await
            .context("Invalid Google Drive upload response")?;
        info!("Successfully uploaded: {} ({})", name, file.id);
        Ok(file.id)
    }
}

fn file_metadata(name: &str, mime_type: &str, parent_id: &str) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "mimeType": mime_type,
        "parents": [parent_id]
    })
}

fn folder_query(name: &str, parent_id: &str) -> String {
    format!(
        "name = '{}' and mimeType = '{}' and '{}' in parents and trashed = false",
        escape_query(name),
        FOLDER_MIME_TYPE,
        escape_query(parent_id)
    )
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
