use std::{
    io::ErrorKind::NotFound,
    path::{Path, PathBuf},
};

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use tokio::fs;
use tracing::{debug, warn};

use crate::config::Config;

/// Length of every generated file name. 32 alphanumerics is ~190 bits.
const FILENAME_LEN: usize = 32;

/// Extension given to every processed artifact.
pub const ARTIFACT_EXTENSION: &str = "png";

pub fn generate_filename() -> String {
    let mut rng = thread_rng();

    (0..FILENAME_LEN)
        .map(|_| rng.sample(Alphanumeric) as char)
        .collect::<String>()
}

pub fn artifact_filename() -> String {
    format!("{}.{}", generate_filename(), ARTIFACT_EXTENSION)
}

/// Creates every directory the gateway hands files through.
pub async fn prepare_directories(config: &Config) -> std::io::Result<()> {
    for dir in [&config.upload_dir, &config.processed_dir, &config.converted_dir] {
        fs::create_dir_all(dir).await?;
    }
    Ok(())
}

/// Best-effort delete. Failures are logged and swallowed.
pub async fn safe_delete(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "deleted file"),
        Err(err) if err.kind() == NotFound => {
            debug!(path = %path.display(), "nothing to delete")
        }
        Err(err) => warn!(path = %path.display(), error = %err, "failed to delete file"),
    }
}

/// A file the gateway owns only for the duration of one request.
///
/// The file is removed when the guard is released or dropped, unless it was
/// claimed with [`TransientFile::keep`]. Dropping falls back to a synchronous
/// delete so a cancelled request still leaves nothing behind.
#[derive(Debug)]
pub struct TransientFile {
    path: Option<PathBuf>,
}

impl TransientFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    pub fn path(&self) -> &Path {
        self.path
            .as_deref()
            .unwrap_or_else(|| Path::new(""))
    }

    /// Disarms the guard and hands the path to the caller.
    pub fn keep(mut self) -> PathBuf {
        self.path.take().unwrap_or_default()
    }

    pub async fn release(mut self) {
        if let Some(path) = self.path.take() {
            safe_delete(&path).await;
        }
    }
}

impl Drop for TransientFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            // Drop can't await; a single unlink is short enough to block on.
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "deleted file on drop"),
                Err(err) if err.kind() == NotFound => (),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to delete file on drop")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn filenames_are_alphanumeric_and_distinct() {
        let names: HashSet<String> = (0..1000).map(|_| generate_filename()).collect();

        assert_eq!(names.len(), 1000);
        assert!(names
            .iter()
            .all(|name| name.len() == FILENAME_LEN && name.chars().all(|c| c.is_ascii_alphanumeric())));
    }

    #[test]
    fn artifact_names_carry_png_extension() {
        assert!(artifact_filename().ends_with(".png"));
    }

    #[tokio::test]
    async fn release_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload");
        std::fs::write(&path, b"data").unwrap();

        TransientFile::new(path.clone()).release().await;

        assert!(!path.exists());
    }

    #[test]
    fn drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload");
        std::fs::write(&path, b"data").unwrap();

        drop(TransientFile::new(path.clone()));

        assert!(!path.exists());
    }

    #[test]
    fn keep_disarms_guard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.png");
        std::fs::write(&path, b"data").unwrap();

        let kept = TransientFile::new(path.clone()).keep();

        assert_eq!(kept, path);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn safe_delete_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        safe_delete(&dir.path().join("never-existed")).await;
    }
}
