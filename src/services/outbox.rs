//! Per-conversation send queue.
//!
//! Each conversation gets one writer task that handles sends strictly in the order they
//! were queued. Results come back over a channel; if the session is gone by then the
//! result is dropped and the write itself still completes.

use super::attachment_pipeline::{AttachmentPipeline, UploadedFile};
use crate::error::{AppError, AppResult};
use crate::models::{Message, MessageDraft, MessageKind, NewMessage};
use crate::store::RemoteStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use uuid::Uuid;

/// What to do when some files of a message fail to upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachmentFailurePolicy {
    /// Fail the whole message and remove the files that did upload
    #[default]
    AbortMessage,
    /// Send the message with the files that made it
    KeepSuccessful,
}

#[derive(Debug, Clone)]
pub struct SendJob {
    pub local_id: Uuid,
    pub sender_id: Uuid,
    pub kind: MessageKind,
    pub draft: MessageDraft,
}

#[derive(Debug, Clone)]
pub enum SendOutcome {
    Confirmed {
        local_id: Uuid,
        message: Message,
    },
    Failed {
        local_id: Uuid,
        conversation_id: Uuid,
        error: AppError,
    },
}

#[derive(Clone)]
struct WriterContext {
    remote: Arc<dyn RemoteStore>,
    pipeline: Arc<AttachmentPipeline>,
    send_timeout: Duration,
    failure_policy: AttachmentFailurePolicy,
    outcomes: UnboundedSender<SendOutcome>,
}

pub struct Outbox {
    ctx: WriterContext,
    writers: HashMap<Uuid, UnboundedSender<SendJob>>,
}

impl Outbox {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        pipeline: Arc<AttachmentPipeline>,
        send_timeout: Duration,
        failure_policy: AttachmentFailurePolicy,
    ) -> (Self, UnboundedReceiver<SendOutcome>) {
        let (outcomes, rx) = unbounded_channel();
        let outbox = Self {
            ctx: WriterContext {
                remote,
                pipeline,
                send_timeout,
                failure_policy,
                outcomes,
            },
            writers: HashMap::new(),
        };
        (outbox, rx)
    }

    /// Queue a send behind any earlier sends for the same conversation
    pub fn enqueue(&mut self, job: SendJob) {
        let conversation_id = job.draft.conversation_id;
        let job = match self.writers.get(&conversation_id) {
            Some(writer) => match writer.send(job) {
                Ok(()) => return,
                Err(returned) => returned.0,
            },
            None => job,
        };

        let (tx, rx) = unbounded_channel();
        tokio::spawn(run_writer(conversation_id, rx, self.ctx.clone()));
        // fresh receiver, cannot be closed yet
        let _ = tx.send(job);
        self.writers.insert(conversation_id, tx);
    }

    pub fn writer_count(&self) -> usize {
        self.writers.len()
    }
}

async fn run_writer(conversation_id: Uuid, mut jobs: UnboundedReceiver<SendJob>, ctx: WriterContext) {
    tracing::debug!(%conversation_id, "outbox writer started");
    while let Some(job) = jobs.recv().await {
        let local_id = job.local_id;
        let outcome = match deliver(&ctx, job).await {
            Ok(message) => SendOutcome::Confirmed { local_id, message },
            Err(error) => {
                tracing::warn!(%conversation_id, %local_id, error = %error, "send failed");
                SendOutcome::Failed {
                    local_id,
                    conversation_id,
                    error,
                }
            }
        };
        if ctx.outcomes.send(outcome).is_err() {
            tracing::debug!(%conversation_id, %local_id, "session gone, send outcome dropped");
        }
    }
    tracing::debug!(%conversation_id, "outbox writer stopped");
}

/// Upload attachments and insert the row, all within one `send_timeout` budget
async fn deliver(ctx: &WriterContext, job: SendJob) -> AppResult<Message> {
    let conversation_id = job.draft.conversation_id;
    let token = job.draft.client_token;
    let deadline = Instant::now() + ctx.send_timeout;

    let mut uploaded: Vec<UploadedFile> = Vec::new();
    if !job.draft.files.is_empty() {
        let mut first_error = None;
        let mut timed_out = false;
        for result in ctx
            .pipeline
            .upload_batch(conversation_id, token, &job.draft.files, deadline)
            .await
        {
            match result {
                Ok(file) => uploaded.push(file),
                Err(e) => {
                    timed_out |= matches!(e, AppError::Timeout);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(error) = first_error {
            let keep = !timed_out
                && ctx.failure_policy == AttachmentFailurePolicy::KeepSuccessful
                && (!uploaded.is_empty() || job.draft.normalized_body().is_some());
            if !keep {
                ctx.pipeline.discard(&uploaded).await;
                return Err(if timed_out { AppError::Timeout } else { error });
            }
        }
    }

    let new_message = NewMessage {
        conversation_id,
        sender_id: job.sender_id,
        body: job.draft.normalized_body(),
        kind: job.kind,
        reply_to: job.draft.reply_to,
        attachments: uploaded.iter().map(|f| f.attachment.clone()).collect(),
        client_token: token,
    };

    // Run the insert on its own task: on timeout the caller sees `failed` while the
    // write is left to finish; a late row arrives through the change feed.
    let remote = ctx.remote.clone();
    let mut insert = tokio::spawn(async move { remote.insert_message(new_message).await });
    match tokio::time::timeout_at(deadline, &mut insert).await {
        Ok(Ok(Ok(message))) => Ok(message),
        Ok(Ok(Err(e))) => {
            ctx.pipeline.discard(&uploaded).await;
            Err(e)
        }
        Ok(Err(join)) => {
            ctx.pipeline.discard(&uploaded).await;
            Err(AppError::Transport(format!("send task: {join}")))
        }
        Err(_) => Err(AppError::Timeout),
    }
}
