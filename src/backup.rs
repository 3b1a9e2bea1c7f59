use crate::config::Config;
use crate::remote::{ensure_folder_path, RemoteStore, ARCHIVE_MIME_TYPE, ROOT_FOLDER_ID};
use crate::staging::{stage_archive, StagedArtifact};
use anyhow::{Context, Result};
use chrono::Local;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub folder_id: String,
    pub file_id: String,
    pub file_name: String,
}

pub struct BackupManager<'a> {
    config: &'a Config,
}

impl<'a> BackupManager<'a> {
    pub fn new(config: &'a Config) -> Self {
        if config.api_key.is_some() {
            warn!("--key is ignored; Google Drive access uses the OAuth credentials file");
        }
        Self { config }
    }

    pub fn create_backup(&self) -> Result<StagedArtifact> {
        info!("Starting backup of {}", self.config.source.display());
        stage_archive(
            &self.config.source,
            &self.config.staging_dir,
            &self.config.tag,
            &Local::now(),
        )
        .context("Failed to create staged archive")
    }

    pub async fn upload_backup<S: RemoteStore + ?Sized>(
        &self,
        store: &S,
        artifact: &StagedArtifact,
    ) -> Result<UploadReceipt> {
        let content = artifact.open().await?;

        let folder_id = ensure_folder_path(store, &self.config.destination, ROOT_FOLDER_ID)
            .await
            .context("Could not create remote directory")?;

        let file_name = artifact.file_name()?.to_string();
        let file_id = store
            .create_file(&file_name, ARCHIVE_MIME_TYPE, content, &folder_id)
            .await
            .with_context(|| format!("Could not create file: {}", file_name))?;

        Ok(UploadReceipt {
            folder_id,
            file_id,
            file_name,
        })
    }

    /// Deletes the staged archive after a successful upload unless the run
    /// asked to keep it.
    pub fn finish(&self, artifact: &StagedArtifact) -> Result<()> {
        if self.config.keep_staged {
            info!("Keeping staged archive: {}", artifact.path.display());
            return Ok(());
        }
        artifact.remove()?;
        info!("Removed staged archive: {}", artifact.path.display());
        Ok(())
    }
}
