//! One upload, one external command, one artifact.
//!
//! A job moves Received -> Validated -> Dispatched -> Completed. Intake and
//! validation happen in the route handlers; this module owns dispatch and
//! completion. The transient upload is released as soon as the command
//! returns, before its outcome is inspected, and a failed command never
//! leaves an output file behind.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::{fs, sync::Semaphore};
use tracing::{debug, error, info, warn};

use crate::{
    error::AppError,
    processor::{ExternalProcessor, ProcessError},
    storage::{self, TransientFile},
    upload::Upload,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Upscale,
    RemoveBackground,
    Convert,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Upscale => "upscale",
            Operation::RemoveBackground => "remove_background",
            Operation::Convert => "convert",
        }
    }

    /// The only thing a client learns about a failed command.
    pub fn failure_message(self) -> &'static str {
        match self {
            Operation::Upscale => "Failed to upscale image",
            Operation::RemoveBackground => "Failed to process image",
            Operation::Convert => "Conversion failed",
        }
    }
}

/// Output file of a finished job. Deleted on drop unless persisted.
#[derive(Debug)]
pub struct Artifact {
    filename: String,
    file: TransientFile,
}

impl Artifact {
    fn new(dir: &Path) -> Self {
        let filename = storage::artifact_filename();
        let file = TransientFile::new(dir.join(&filename));
        Self { filename, file }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Leaves the file on disk for good and returns its name.
    pub fn persist(self) -> String {
        self.file.keep();
        self.filename
    }

    pub fn into_parts(self) -> (String, TransientFile) {
        (self.filename, self.file)
    }
}

/// Everything needed to dispatch one upload.
#[derive(Clone)]
pub struct Job {
    pub operation: Operation,
    pub processor: Arc<dyn ExternalProcessor>,
    pub output_dir: PathBuf,
    pub params: Vec<String>,
    pub admission: Option<Arc<Semaphore>>,
}

impl Job {
    /// Runs the job to completion on its own task.
    ///
    /// If the caller goes away the task keeps going, so the command is never
    /// orphaned mid-write and cleanup still happens. An artifact nobody
    /// collects is removed when the task's output is dropped.
    pub async fn dispatch(self, upload: Upload) -> Result<Artifact, AppError> {
        let operation = self.operation;
        tokio::spawn(self.execute(upload))
            .await
            .map_err(|err| AppError::Internal(format!("join {} job: {err}", operation.as_str())))?
    }

    async fn execute(self, upload: Upload) -> Result<Artifact, AppError> {
        let operation = self.operation.as_str();

        if let Err(err) = fs::create_dir_all(&self.output_dir).await {
            upload.release().await;
            return Err(AppError::Internal(format!(
                "create output directory {}: {err}",
                self.output_dir.display()
            )));
        }

        let _permit = match &self.admission {
            Some(semaphore) => match semaphore.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    upload.release().await;
                    return Err(AppError::Internal("acquire job slot".to_string()));
                }
            },
            None => None,
        };

        let artifact = Artifact::new(&self.output_dir);
        info!(
            operation,
            processor = %self.processor.name(),
            upload = ?upload.original_name(),
            mime = upload.mime(),
            size = upload.size(),
            artifact = artifact.filename(),
            "dispatching"
        );

        let result = self
            .processor
            .run(upload.path(), artifact.path(), &self.params)
            .await;

        // the upload goes first, whatever the outcome
        upload.release().await;

        let result = match result {
            Ok(output) => match fs::try_exists(artifact.path()).await {
                Ok(true) => Ok(output),
                _ => Err(ProcessError::MissingOutput {
                    program: self.processor.name(),
                    output: artifact.path().to_path_buf(),
                }),
            },
            Err(err) => Err(err),
        };

        match result {
            Ok(output) => {
                if !output.stdout.is_empty() {
                    debug!(operation, stdout = %output.stdout, "processor output");
                }
                info!(operation, artifact = artifact.filename(), "processing finished");
                Ok(artifact)
            }
            Err(err) => {
                error!(
                    operation,
                    error = %err,
                    stderr = err.stderr().unwrap_or_default(),
                    "processing failed"
                );
                discard(artifact).await;
                Err(AppError::Processing {
                    message: self.operation.failure_message(),
                    source: err,
                })
            }
        }
    }
}

/// Removes whatever a failed command left at the output path.
async fn discard(artifact: Artifact) {
    let (filename, file) = artifact.into_parts();
    if fs::try_exists(file.path()).await.unwrap_or(true) {
        warn!(artifact = %filename, "removing output left by failed command");
    }
    file.release().await;
}
