//! The configurable application logo.
//!
//! Only the file name is stored; the file itself lives in the uploads
//! directory. Replacing the logo writes the new file, then drops the old one
//! on a best-effort basis, then updates the stored name. A crash in between
//! leaves at worst an orphaned file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use rand::{thread_rng, Rng};
use sqlx::sqlite::SqlitePool;
use thiserror::Error;

use crate::clock::Clock;
use crate::db;

pub const MAX_LOGO_BYTES: usize = 3 * 1024 * 1024;
pub const ALLOWED_TYPES: [&str; 4] = ["image/png", "image/jpeg", "image/webp", "image/svg+xml"];
pub const DEFAULT_LOGO: &str = "logo.png";

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// A file received from the client, not yet validated.
#[derive(Debug, Clone)]
pub struct LogoUpload {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl LogoUpload {
    pub fn validate(&self) -> Result<(), AssetError> {
        let allowed = self
            .content_type
            .as_deref()
            .map(|ct| ALLOWED_TYPES.contains(&ct))
            .unwrap_or(false);
        if !allowed {
            return Err(AssetError::Validation("Invalid file type".to_string()));
        }
        if self.data.is_empty() {
            return Err(AssetError::Validation("No file uploaded".to_string()));
        }
        if self.data.len() > MAX_LOGO_BYTES {
            return Err(AssetError::Validation("File too large (max 3MB)".to_string()));
        }
        Ok(())
    }
}

/// Last path component, whether the stored value is a bare name or a path.
pub fn basename(raw: &str) -> Option<&str> {
    raw.rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
}

/// Lower-cased extension of the uploaded name, `.png` when there is none.
fn extension_of(filename: Option<&str>) -> String {
    filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_else(|| String::from(".png"))
}

pub fn generate_filename(original: Option<&str>, unix_millis: i64) -> String {
    let suffix: u32 = thread_rng().gen();
    format!("logo-{}-{:08x}{}", unix_millis, suffix, extension_of(original))
}

#[derive(Clone)]
pub struct LogoService {
    pool: SqlitePool,
    uploads_dir: PathBuf,
    public_base_url: String,
    clock: Arc<dyn Clock>,
}

impl LogoService {
    pub fn new(
        pool: SqlitePool,
        uploads_dir: PathBuf,
        public_base_url: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        LogoService {
            pool,
            uploads_dir,
            public_base_url: public_base_url.into(),
            clock,
        }
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    fn upload_url(&self, filename: &str) -> String {
        format!("{}/uploads/{}", self.public_base_url, filename)
    }

    fn default_url(&self) -> String {
        format!("{}/{}", self.public_base_url, DEFAULT_LOGO)
    }

    pub async fn logo_url(&self) -> Result<String, AssetError> {
        let stored = db::read_logo_filename(&self.pool).await?;

        Ok(match stored.as_deref().and_then(basename) {
            Some(name) => self.upload_url(name),
            None => self.default_url(),
        })
    }

    #[tracing::instrument(skip(self, upload), fields(size = upload.data.len()))]
    pub async fn set_logo(&self, upload: LogoUpload) -> Result<String, AssetError> {
        upload.validate()?;

        let filename = generate_filename(
            upload.filename.as_deref(),
            self.clock.now().timestamp_millis(),
        );

        tokio::fs::create_dir_all(&self.uploads_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.uploads_dir.display()))?;
        tokio::fs::write(self.uploads_dir.join(&filename), &upload.data)
            .await
            .context("Failed to write logo file")?;

        db::ensure_settings_row(&self.pool).await?;

        let previous = db::read_logo_filename(&self.pool).await?;
        if let Some(old) = previous.as_deref().and_then(basename) {
            if old != filename {
                self.remove_quietly(old).await;
            }
        }

        db::write_logo_filename(&self.pool, &filename).await?;
        tracing::info!(%filename, "logo replaced");

        Ok(self.upload_url(&filename))
    }

    async fn remove_quietly(&self, filename: &str) {
        let path = self.uploads_dir.join(filename);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove old logo"),
        }
    }
}
