//! Filesystem attachment store.
//!
//! Every upload is written to a fresh path, so a reference always names one
//! immutable blob and a re-upload under the same key never overwrites bytes a
//! record may still point at.
//!
//! Reference format: `attachments/{kind}/{entity_id}/{subtype}/{uuidv7}.{ext}`
//!
//! ## Example
//!
//! ```rust,ignore
//! use edupanel_db::FilesystemAttachmentStore;
//!
//! let store = FilesystemAttachmentStore::new("/var/edupanel/attachments");
//! store.validate().await?;
//! let reference = store.upload(&key, &file).await?;
//! ```

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use edupanel_core::defaults::ATTACHMENT_REF_PREFIX;
use edupanel_core::{
    storage_extension, AttachmentFile, AttachmentKey, AttachmentStore, Error, Result,
};

/// Build the reference for a new upload under `key`.
pub fn generate_reference(key: &AttachmentKey, blob_id: &Uuid, ext: &str) -> String {
    format!(
        "{}/{}/{}/{}/{}.{}",
        ATTACHMENT_REF_PREFIX,
        key.kind,
        key.entity_id,
        key.subtype,
        blob_id.as_hyphenated(),
        ext
    )
}

fn check_subtype(subtype: &str) -> Result<()> {
    let valid = !subtype.is_empty()
        && subtype.len() <= 64
        && subtype
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid attachment subtype: {:?}", subtype)))
    }
}

/// Attachment store backed by a local directory.
pub struct FilesystemAttachmentStore {
    base_path: PathBuf,
}

impl FilesystemAttachmentStore {
    /// Create a new store rooted at the given base directory.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a reference to a path under the base directory.
    ///
    /// Rejects absolute paths, `..` components, and anything outside the
    /// attachment prefix.
    fn full_path(&self, reference: &str) -> Result<PathBuf> {
        let relative = Path::new(reference);
        let mut components = relative.components();
        let prefix_ok = matches!(
            components.next(),
            Some(Component::Normal(first)) if first == ATTACHMENT_REF_PREFIX
        );
        if !prefix_ok || !components.all(|c| matches!(c, Component::Normal(_))) {
            return Err(Error::InvalidInput(format!(
                "invalid attachment reference: {}",
                reference
            )));
        }
        Ok(self.base_path.join(relative))
    }

    /// Validate that the store can write, read, and delete files.
    ///
    /// Run at startup to catch permission or mount problems before a saga
    /// depends on the store.
    pub async fn validate(&self) -> std::result::Result<(), String> {
        let test_dir = self.base_path.join(".health-check");
        let test_file = test_dir.join("probe.bin");

        fs::create_dir_all(&test_dir)
            .await
            .map_err(|e| format!("create_dir_all({:?}): {}", test_dir, e))?;

        let data = b"attachment-store-health-check";
        fs::write(&test_file, data)
            .await
            .map_err(|e| format!("write({:?}): {}", test_file, e))?;

        let read_back = fs::read(&test_file)
            .await
            .map_err(|e| format!("read({:?}): {}", test_file, e))?;
        if read_back != data {
            return Err("read-back mismatch".to_string());
        }

        fs::remove_file(&test_file)
            .await
            .map_err(|e| format!("remove_file({:?}): {}", test_file, e))?;
        let _ = fs::remove_dir(&test_dir).await;

        Ok(())
    }

    async fn write_atomic(&self, full_path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                warn!(
                    parent = %parent.display(),
                    error = %e,
                    "file_storage: create_dir_all failed"
                );
                e
            })?;
        }

        let temp_path = full_path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            warn!(
                temp_path = %temp_path.display(),
                error = %e,
                "file_storage: File::create failed"
            );
            e
        })?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, full_path).await {
            warn!(
                from = %temp_path.display(),
                to = %full_path.display(),
                error = %e,
                "file_storage: rename failed"
            );
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(full_path, std::fs::Permissions::from_mode(0o644)).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl AttachmentStore for FilesystemAttachmentStore {
    async fn upload(&self, key: &AttachmentKey, file: &AttachmentFile) -> Result<String> {
        check_subtype(&key.subtype)?;

        let ext = storage_extension(&file.filename, &file.data);
        let reference = generate_reference(key, &Uuid::now_v7(), &ext);
        let full_path = self.full_path(&reference)?;

        debug!(reference = %reference, size = file.data.len(), "file_storage: upload");
        self.write_atomic(&full_path, &file.data)
            .await
            .map_err(|e| Error::Storage(format!("upload {} failed: {}", key, e)))?;

        Ok(reference)
    }

    async fn delete(&self, reference: &str) -> Result<()> {
        let full_path = self.full_path(reference)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => {
                debug!(reference = %reference, "file_storage: deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("delete {} failed: {}", reference, e))),
        }
    }

    async fn exists(&self, reference: &str) -> Result<bool> {
        let full_path = self.full_path(reference)?;
        Ok(fs::try_exists(full_path).await?)
    }
}
