//! Ordered message log for one conversation.
//!
//! The log is always sorted by `(created_at, id)` and holds at most one entry per id.
//! Every mutation is synchronous; nothing here awaits, so a reader never observes a
//! half-applied change.

use crate::error::{AppError, AppResult, ValidationError};
use crate::models::{LocalState, Message, MessageDraft, MessageKind};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// What `reconcile` did with a server row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Not seen before (another participant, another device, or a fresh page)
    Inserted,
    /// Replaced our optimistic entry matched by correlation token
    Replaced { local_id: Uuid },
    /// Newer version of a row we already had
    Updated,
    /// Same or older version of a row we already had
    Duplicate,
    /// Row belongs to another conversation
    Ignored,
}

#[derive(Debug, Clone)]
pub struct MessageLog {
    conversation_id: Uuid,
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn new(conversation_id: Uuid) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
        }
    }

    /// Build from a fetched page; rows for other conversations and duplicate ids are dropped.
    pub fn from_snapshot(conversation_id: Uuid, rows: Vec<Message>) -> Self {
        let mut log = Self::new(conversation_id);
        for row in rows {
            log.reconcile(row);
        }
        log
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.get(id).is_some()
    }

    pub fn last_visible(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| !m.is_deleted)
    }

    pub fn pinned(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.is_pinned && !m.is_deleted)
    }

    /// Case-insensitive substring match over visible bodies
    pub fn search(&self, term: &str) -> Vec<&Message> {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        self.messages
            .iter()
            .filter(|m| !m.is_deleted)
            .filter(|m| {
                m.body
                    .as_deref()
                    .is_some_and(|b| b.to_lowercase().contains(&needle))
            })
            .collect()
    }

    /// Insert an optimistic entry with a temporary id.
    ///
    /// Local timestamps are forced strictly after the current tail so that two appends
    /// in the same clock tick keep their send order.
    pub fn append(&mut self, sender_id: Uuid, draft: &MessageDraft, attachments_pending: bool) -> Message {
        let now = Utc::now();
        let created_at = match self.messages.last() {
            Some(tail) if tail.created_at >= now => tail.created_at + Duration::microseconds(1),
            _ => now,
        };

        let kind = if attachments_pending
            && draft.files.iter().all(|f| f.content_type.starts_with("image/"))
        {
            MessageKind::Image
        } else {
            MessageKind::Text
        };

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: self.conversation_id,
            sender_id,
            body: draft.normalized_body(),
            kind,
            reply_to: draft.reply_to,
            attachments: Vec::new(),
            client_token: Some(draft.client_token),
            created_at,
            edited_at: None,
            is_deleted: false,
            is_pinned: false,
            local: Some(LocalState::Pending),
        };

        tracing::debug!(
            conversation_id = %self.conversation_id,
            local_id = %message.id,
            "optimistic append"
        );
        self.insert_sorted(message.clone());
        message
    }

    /// Merge an authoritative row. Keyed by id, then by the correlation token of a
    /// pending entry, else insert.
    ///
    /// A failed entry is terminal: a row that lands after its send timed out is kept
    /// as its own entry and the failed one stays until it is resent or discarded.
    pub fn reconcile(&mut self, server: Message) -> ReconcileOutcome {
        if server.conversation_id != self.conversation_id {
            return ReconcileOutcome::Ignored;
        }
        let mut server = server;
        server.local = None;

        if let Some(idx) = self.position(server.id) {
            let current = &self.messages[idx];
            if !supersedes(&server, current) {
                return ReconcileOutcome::Duplicate;
            }
            self.messages.remove(idx);
            self.insert_sorted(server);
            return ReconcileOutcome::Updated;
        }

        if let Some(token) = server.client_token {
            let local = self
                .messages
                .iter()
                .position(|m| m.is_pending() && m.client_token == Some(token));
            if let Some(idx) = local {
                let local_id = self.messages.remove(idx).id;
                tracing::debug!(
                    conversation_id = %self.conversation_id,
                    %local_id,
                    message_id = %server.id,
                    "optimistic entry confirmed"
                );
                self.insert_sorted(server);
                return ReconcileOutcome::Replaced { local_id };
            }
        }

        self.insert_sorted(server);
        ReconcileOutcome::Inserted
    }

    /// Confirmed row carrying `token`, if the server accepted that attempt after all
    pub fn confirmed_by_token(&self, token: Uuid) -> Option<&Message> {
        self.messages
            .iter()
            .find(|m| m.is_confirmed() && m.client_token == Some(token))
    }

    /// Replace confirmed rows with a fresh page, keeping unconfirmed local entries.
    /// Local entries whose confirmation is in the page are replaced as usual.
    pub fn resync(&mut self, rows: Vec<Message>) {
        self.messages.retain(|m| !m.is_confirmed());
        for row in rows {
            self.reconcile(row);
        }
        tracing::debug!(conversation_id = %self.conversation_id, len = self.messages.len(), "log resynced");
    }

    /// Move a pending entry to `failed`. Confirmed or already-failed entries are left alone.
    pub fn mark_failed(&mut self, local_id: Uuid, reason: impl Into<String>) -> bool {
        match self.messages.iter_mut().find(|m| m.id == local_id) {
            Some(m) if m.is_pending() => {
                m.local = Some(LocalState::Failed {
                    reason: reason.into(),
                });
                true
            }
            _ => false,
        }
    }

    /// Drop an optimistic entry (used when a failed attempt is resubmitted)
    pub fn remove_local(&mut self, local_id: Uuid) -> Option<Message> {
        let idx = self
            .messages
            .iter()
            .position(|m| m.id == local_id && !m.is_confirmed())?;
        Some(self.messages.remove(idx))
    }

    /// Apply an edit by `editor`. Returns the previous version so a failed write can be undone.
    pub fn edit(&mut self, message_id: Uuid, editor: Uuid, new_body: &str) -> AppResult<Message> {
        let body = new_body.trim();
        let idx = self.authorized(message_id, editor)?;
        if body.is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        let current = &mut self.messages[idx];
        if current.is_deleted {
            return Err(AppError::NotFound);
        }
        if !current.is_confirmed() {
            return Err(AppError::Conflict("message is not confirmed yet".into()));
        }
        let previous = current.clone();
        current.body = Some(body.to_string());
        current.edited_at = Some(Utc::now());
        Ok(previous)
    }

    /// Soft-delete by `actor`. `Ok(None)` when it was already deleted.
    pub fn soft_delete(&mut self, message_id: Uuid, actor: Uuid) -> AppResult<Option<Message>> {
        let idx = self.authorized(message_id, actor)?;
        let current = &mut self.messages[idx];
        if current.is_deleted {
            return Ok(None);
        }
        if !current.is_confirmed() {
            return Err(AppError::Conflict("message is not confirmed yet".into()));
        }
        let previous = current.clone();
        current.tombstone();
        Ok(Some(previous))
    }

    /// Any member may pin. Returns the previous version.
    pub fn toggle_pin(&mut self, message_id: Uuid) -> AppResult<Message> {
        let idx = self.position(message_id).ok_or(AppError::NotFound)?;
        let current = &mut self.messages[idx];
        if current.is_deleted {
            return Err(AppError::NotFound);
        }
        if !current.is_confirmed() {
            return Err(AppError::Conflict("message is not confirmed yet".into()));
        }
        let previous = current.clone();
        current.is_pinned = !current.is_pinned;
        Ok(previous)
    }

    /// Put back a version returned by `edit`/`soft_delete`/`toggle_pin`
    pub fn restore(&mut self, previous: Message) {
        if let Some(idx) = self.position(previous.id) {
            self.messages[idx] = previous;
        }
    }

    fn authorized(&self, message_id: Uuid, actor: Uuid) -> AppResult<usize> {
        let idx = self.position(message_id).ok_or(AppError::NotFound)?;
        if self.messages[idx].sender_id != actor {
            return Err(AppError::NotAuthor);
        }
        Ok(idx)
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    fn insert_sorted(&mut self, message: Message) {
        let key = message.ordering_key();
        let idx = self.messages.partition_point(|m| m.ordering_key() < key);
        self.messages.insert(idx, message);
    }
}

/// Row-level last-writer-wins with two fixed points: deletion is final and an
/// older edit never replaces a newer one.
fn supersedes(incoming: &Message, current: &Message) -> bool {
    if current.is_deleted && !incoming.is_deleted {
        return false;
    }
    if incoming == current {
        return false;
    }
    if incoming.is_deleted && !current.is_deleted {
        return true;
    }
    !is_older(incoming.edited_at, current.edited_at)
}

fn is_older(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    match (a, b) {
        (None, Some(_)) => true,
        (Some(a), Some(b)) => a < b,
        _ => false,
    }
}
