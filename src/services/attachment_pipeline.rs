//! Attachment validation and upload.
//!
//! Validation covers the whole batch before anything touches the network. Uploads
//! report per-file results so one failure never hides or corrupts its siblings; the
//! caller decides whether to abort or keep the successes.

use crate::error::{AppError, AppResult, ValidationError};
use crate::models::{Attachment, PendingFile};
use crate::store::BlobStore;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_FILES: usize = 10;

pub fn default_allowed_types() -> Vec<String> {
    [
        "image/*",
        "application/pdf",
        "text/plain",
        "text/csv",
        "application/msword",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "application/vnd.ms-excel",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPolicy {
    pub max_bytes: u64,
    pub max_files: usize,
    /// Exact essences (`application/pdf`) or top-level wildcards (`image/*`)
    pub allowed_types: Vec<String>,
}

impl Default for AttachmentPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            max_files: DEFAULT_MAX_FILES,
            allowed_types: default_allowed_types(),
        }
    }
}

impl AttachmentPolicy {
    pub fn allows(&self, content_type: &str) -> bool {
        let Ok(parsed) = content_type.trim().parse::<mime::Mime>() else {
            return false;
        };
        let essence = parsed.essence_str();
        self.allowed_types.iter().any(|allowed| {
            match allowed.strip_suffix("/*") {
                Some(top) => parsed.type_().as_str().eq_ignore_ascii_case(top),
                None => essence.eq_ignore_ascii_case(allowed),
            }
        })
    }

    /// Check the batch as a whole; the first offending file rejects everything.
    pub fn validate(&self, files: &[PendingFile]) -> Result<(), ValidationError> {
        if files.len() > self.max_files {
            return Err(ValidationError::TooManyFiles {
                count: files.len(),
                max: self.max_files,
            });
        }
        for file in files {
            if file.size() == 0 {
                return Err(ValidationError::EmptyFile {
                    name: file.name.clone(),
                });
            }
            if file.size() > self.max_bytes {
                return Err(ValidationError::FileTooLarge {
                    name: file.name.clone(),
                    size: file.size(),
                    max: self.max_bytes,
                });
            }
            if !self.allows(&file.content_type) {
                return Err(ValidationError::MimeNotAllowed {
                    name: file.name.clone(),
                    mime: file.content_type.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStage {
    Uploading,
    Uploaded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadProgress {
    pub client_token: Uuid,
    pub file_index: usize,
    pub file_count: usize,
    pub stage: UploadStage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub path: String,
    pub attachment: Attachment,
}

pub struct AttachmentPipeline {
    policy: AttachmentPolicy,
    blobs: Arc<dyn BlobStore>,
    progress: watch::Sender<Option<UploadProgress>>,
}

impl AttachmentPipeline {
    pub fn new(policy: AttachmentPolicy, blobs: Arc<dyn BlobStore>) -> Self {
        let (progress, _) = watch::channel(None);
        Self {
            policy,
            blobs,
            progress,
        }
    }

    pub fn policy(&self) -> &AttachmentPolicy {
        &self.policy
    }

    pub fn validate(&self, files: &[PendingFile]) -> Result<(), ValidationError> {
        self.policy.validate(files)
    }

    /// Latest upload progress across all sends of this session
    pub fn progress(&self) -> watch::Receiver<Option<UploadProgress>> {
        self.progress.subscribe()
    }

    /// Object path namespaced by conversation and message so uploads never collide
    pub fn object_path(conversation_id: Uuid, client_token: Uuid, index: usize, name: &str) -> String {
        format!(
            "conversations/{conversation_id}/messages/{client_token}/{index}-{}",
            sanitize_file_name(name)
        )
    }

    pub async fn upload(
        &self,
        conversation_id: Uuid,
        client_token: Uuid,
        index: usize,
        file: &PendingFile,
    ) -> AppResult<UploadedFile> {
        let path = Self::object_path(conversation_id, client_token, index, &file.name);
        let url = self
            .blobs
            .put(&path, &file.content_type, file.bytes.clone())
            .await?;
        tracing::debug!(%conversation_id, %path, size = file.size(), "attachment uploaded");
        Ok(UploadedFile {
            path,
            attachment: Attachment::from_upload(url, file.name.clone(), file.size(), file.content_type.clone()),
        })
    }

    /// Upload every file, returning one result per input in the same order.
    ///
    /// Files still unfinished at `deadline` come back as `AppError::Timeout`; the files
    /// after them are not attempted.
    pub async fn upload_batch(
        &self,
        conversation_id: Uuid,
        client_token: Uuid,
        files: &[PendingFile],
        deadline: Instant,
    ) -> Vec<AppResult<UploadedFile>> {
        let file_count = files.len();
        let mut results = Vec::with_capacity(file_count);
        for (file_index, file) in files.iter().enumerate() {
            if Instant::now() >= deadline {
                results.push(Err(AppError::Timeout));
                continue;
            }
            self.report(client_token, file_index, file_count, UploadStage::Uploading);
            let upload = self.upload(conversation_id, client_token, file_index, file);
            let result = match tokio::time::timeout_at(deadline, upload).await {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout),
            };
            let stage = match &result {
                Ok(_) => UploadStage::Uploaded,
                Err(e) => {
                    tracing::warn!(%conversation_id, file = %file.name, error = %e, "attachment upload failed");
                    UploadStage::Failed
                }
            };
            self.report(client_token, file_index, file_count, stage);
            results.push(result);
        }
        results
    }

    /// Best-effort removal of blobs that never became part of a confirmed message
    pub async fn discard(&self, uploaded: &[UploadedFile]) {
        for file in uploaded {
            if let Err(e) = self.blobs.delete(&file.path).await {
                tracing::warn!(path = %file.path, error = %e, "failed to remove orphaned attachment");
            }
        }
    }

    fn report(&self, client_token: Uuid, file_index: usize, file_count: usize, stage: UploadStage) {
        self.progress.send_replace(Some(UploadProgress {
            client_token,
            file_index,
            file_count,
            stage,
        }));
    }
}

fn sanitize_file_name(name: &str) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    while cleaned.contains("..") {
        cleaned = cleaned.replace("..", ".");
    }
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.chars().take(120).collect()
    }
}
