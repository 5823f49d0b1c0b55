//! Multipart intake: exactly one image, streamed to a transient file.

use std::{collections::HashMap, path::Path};

use axum::{
    extract::{multipart::Field, Multipart},
    http::StatusCode,
};
use thiserror::Error;
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::debug;

use crate::storage::{generate_filename, TransientFile};

/// The multipart field that carries the image.
pub const FILE_FIELD: &str = "image";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("No file uploaded")]
    Missing,

    #[error("Only image files are allowed!")]
    NotAnImage,

    #[error("Upload failed: File too large (limit is {limit} bytes)")]
    TooLarge { limit: usize },

    #[error("Upload failed: Unexpected field `{0}`")]
    UnexpectedField(String),

    #[error("Upload failed: {0}")]
    Malformed(String),

    #[error("failed to store upload")]
    Storage(#[source] std::io::Error),
}

impl UploadError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            UploadError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<axum::extract::multipart::MultipartError> for UploadError {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        UploadError::Malformed(err.body_text())
    }
}

/// The user's file while one request is handled.
#[derive(Debug)]
pub struct Upload {
    file: TransientFile,
    original_name: Option<String>,
    mime: String,
    size: u64,
}

impl Upload {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Client-supplied name. Logged, never used for paths.
    pub fn original_name(&self) -> Option<&str> {
        self.original_name.as_deref()
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub async fn release(self) {
        self.file.release().await;
    }

    #[cfg(test)]
    pub(crate) fn for_tests(path: std::path::PathBuf, contents: &[u8]) -> Self {
        std::fs::write(&path, contents).unwrap();
        Self {
            file: TransientFile::new(path),
            original_name: Some("test.png".to_string()),
            mime: "image/png".to_string(),
            size: contents.len() as u64,
        }
    }
}

/// A parsed request: the stored upload plus its text fields.
#[derive(Debug)]
pub struct UploadForm {
    pub upload: Upload,
    fields: HashMap<String, String>,
}

impl UploadForm {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Reads the whole multipart body, storing the image under `dir`.
///
/// Nothing is left on disk when this returns an error.
pub async fn receive(
    multipart: &mut Multipart,
    dir: &Path,
    limit: usize,
) -> Result<UploadForm, UploadError> {
    let mut upload: Option<Upload> = None;
    let mut fields = HashMap::new();

    let outcome = read_fields(multipart, dir, limit, &mut upload, &mut fields).await;
    match (outcome, upload) {
        (Ok(()), Some(upload)) => Ok(UploadForm { upload, fields }),
        (Ok(()), None) => Err(UploadError::Missing),
        (Err(err), stored) => {
            if let Some(stored) = stored {
                stored.release().await;
            }
            Err(err)
        }
    }
}

async fn read_fields(
    multipart: &mut Multipart,
    dir: &Path,
    limit: usize,
    upload: &mut Option<Upload>,
    fields: &mut HashMap<String, String>,
) -> Result<(), UploadError> {
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();

        if field.file_name().is_none() {
            let value = field.text().await?;
            fields.insert(name, value);
            continue;
        }

        if name != FILE_FIELD || upload.is_some() {
            return Err(UploadError::UnexpectedField(name));
        }
        *upload = Some(store(field, dir, limit).await?);
    }
    Ok(())
}

async fn store(mut field: Field<'_>, dir: &Path, limit: usize) -> Result<Upload, UploadError> {
    let mime = field.content_type().map(str::to_string);
    let mime = match mime {
        Some(mime) if mime.starts_with("image/") => mime,
        mime => {
            debug!(?mime, "rejected non-image upload");
            return Err(UploadError::NotAnImage);
        }
    };
    let original_name = field.file_name().map(str::to_string);

    let file = TransientFile::new(dir.join(generate_filename()));
    let mut out = File::create(file.path())
        .await
        .map_err(UploadError::Storage)?;

    let mut size: u64 = 0;
    while let Some(chunk) = field.chunk().await? {
        size += chunk.len() as u64;
        if size > limit as u64 {
            // `file` drops here and takes the partial upload with it
            return Err(UploadError::TooLarge { limit });
        }
        out.write_all(&chunk).await.map_err(UploadError::Storage)?;
    }
    out.flush().await.map_err(UploadError::Storage)?;

    debug!(?original_name, %mime, size, path = %file.path().display(), "upload stored");
    Ok(Upload {
        file,
        original_name,
        mime,
        size,
    })
}
