//! Conversations visible to one user: previews, unread counters, per-member flags.
//!
//! Network failures never clear local state; a stale list beats an empty one.

use crate::error::{AppError, AppResult};
use crate::models::{
    Conversation, ConversationKind, ConversationPreview, ConversationSnapshot, MemberFlags,
    MemberState, Message, Participant,
};
use crate::store::RemoteStore;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Effect of feeding a new message into the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Preview updated and the unread counter went up by one
    Counted,
    /// Preview possibly updated, no unread change (own message, active conversation, or already read)
    Recorded,
    /// Message id already accounted for
    Duplicate,
    /// Conversation not in the directory yet; caller should refresh
    UnknownConversation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArchiveEffect {
    /// The archived conversation was the active one; the session must drop its selection
    pub clear_selection: bool,
}

#[derive(Debug, Clone)]
struct Entry {
    conversation: Conversation,
    membership: MemberState,
    /// Everything at or before this `(created_at, id)` is already in the snapshot's counts
    counted_through: Option<(DateTime<Utc>, Uuid)>,
    /// Ids counted since the snapshot
    seen: HashSet<Uuid>,
}

impl Entry {
    fn new(conversation: Conversation, membership: MemberState) -> Self {
        let counted_through = conversation.last_message_at.zip(conversation.last_message_id);
        Self {
            conversation,
            membership,
            counted_through,
            seen: HashSet::new(),
        }
    }

    /// Claim `message` for counting; false when it was accounted for already
    fn claim(&mut self, message: &Message) -> bool {
        let covered = self
            .counted_through
            .is_some_and(|through| (message.created_at, message.id) <= through);
        !covered && self.seen.insert(message.id)
    }
}

pub struct ConversationDirectory {
    viewer: Uuid,
    scope: Option<Uuid>,
    remote: Arc<dyn RemoteStore>,
    entries: HashMap<Uuid, Entry>,
}

impl ConversationDirectory {
    pub fn new(viewer: Uuid, scope: Option<Uuid>, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            viewer,
            scope,
            remote,
            entries: HashMap::new(),
        }
    }

    pub fn viewer(&self) -> Uuid {
        self.viewer
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Re-fetch the list. On error the current entries are kept and the error returned.
    pub async fn refresh(&mut self) -> AppResult<()> {
        let snapshots = self
            .remote
            .list_conversations(self.viewer, self.scope)
            .await
            .map_err(|e| {
                tracing::warn!(user_id = %self.viewer, error = %e, "conversation list refresh failed");
                e
            })?;
        self.replace_snapshot(snapshots);
        Ok(())
    }

    /// Replace local state with a fresh server snapshot
    pub fn replace_snapshot(&mut self, snapshots: Vec<ConversationSnapshot>) {
        let mut entries = HashMap::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let id = snapshot.conversation.id;
            entries.insert(id, Entry::new(snapshot.conversation, snapshot.membership));
        }
        tracing::debug!(user_id = %self.viewer, count = entries.len(), "directory snapshot applied");
        self.entries = entries;
    }

    /// Visible, non-archived conversations: pinned first, then most recent activity
    pub fn list(&self, scope: Option<Uuid>) -> Vec<ConversationPreview> {
        self.collect(scope, false)
    }

    pub fn list_archived(&self, scope: Option<Uuid>) -> Vec<ConversationPreview> {
        self.collect(scope, true)
    }

    fn collect(&self, scope: Option<Uuid>, archived: bool) -> Vec<ConversationPreview> {
        let mut previews: Vec<ConversationPreview> = self
            .entries
            .values()
            .filter(|e| e.membership.archived == archived)
            .filter(|e| scope.is_none() || e.conversation.business_id == scope)
            .map(|e| self.preview_of(e))
            .collect();
        previews.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then_with(|| activity(b).cmp(&activity(a)))
                .then_with(|| a.id.cmp(&b.id))
        });
        previews
    }

    pub fn preview(&self, conversation_id: Uuid) -> Option<ConversationPreview> {
        self.entries.get(&conversation_id).map(|e| self.preview_of(e))
    }

    pub fn conversation(&self, conversation_id: Uuid) -> Option<&Conversation> {
        self.entries.get(&conversation_id).map(|e| &e.conversation)
    }

    pub fn membership(&self, conversation_id: Uuid) -> Option<&MemberState> {
        self.entries.get(&conversation_id).map(|e| &e.membership)
    }

    pub fn total_unread(&self) -> u32 {
        self.entries
            .values()
            .filter(|e| !e.membership.archived && !e.membership.muted)
            .map(|e| e.membership.unread_count)
            .sum()
    }

    /// Unread conversations whose newest message this device has not acknowledged yet
    pub fn pending_delivery(&self) -> Vec<(Uuid, DateTime<Utc>)> {
        self.entries
            .values()
            .filter(|e| e.membership.unread_count > 0)
            .filter_map(|e| {
                let at = e.conversation.last_message_at?;
                let acked = e.membership.delivered_at.is_some_and(|d| d >= at);
                (!acked).then_some((e.conversation.id, at))
            })
            .collect()
    }

    /// Case-insensitive match on title or preview text
    pub fn search(&self, term: &str) -> Vec<ConversationPreview> {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() {
            return self.list(None);
        }
        self.list(None)
            .into_iter()
            .filter(|p| {
                p.title.to_lowercase().contains(&needle)
                    || p
                        .last_message_preview
                        .as_deref()
                        .is_some_and(|t| t.to_lowercase().contains(&needle))
            })
            .collect()
    }

    /// Local lookup of the direct conversation with `other` in the current scope
    pub fn find_direct(&self, other: Uuid) -> Option<Uuid> {
        self.entries
            .values()
            .filter(|e| e.conversation.kind == ConversationKind::Direct)
            .filter(|e| e.conversation.business_id == self.scope)
            .find(|e| e.conversation.is_member(other) && other != self.viewer)
            .map(|e| e.conversation.id)
    }

    /// Find or create the direct conversation with `other`; never creates a duplicate pair.
    pub async fn open_direct(&mut self, me: Participant, other: Participant) -> AppResult<Uuid> {
        if let Some(existing) = self.find_direct(other.user_id) {
            return Ok(existing);
        }
        let conversation = self
            .remote
            .find_or_create_direct(self.scope, me, other)
            .await?;
        let id = conversation.id;
        self.upsert_conversation(conversation);
        Ok(id)
    }

    pub async fn create_group(&mut self, name: &str, members: Vec<Participant>) -> AppResult<Uuid> {
        let conversation = self.remote.create_group(self.scope, name, members).await?;
        let id = conversation.id;
        self.upsert_conversation(conversation);
        Ok(id)
    }

    /// Insert or update conversation metadata, keeping the viewer's membership
    pub fn upsert_conversation(&mut self, conversation: Conversation) {
        if !conversation.is_member(self.viewer) {
            return;
        }
        if self.scope.is_some() && conversation.business_id != self.scope {
            return;
        }
        match self.entries.get_mut(&conversation.id) {
            Some(entry) => {
                // keep the newer preview if the event lags behind what we already showed
                let incoming = (conversation.last_message_at, conversation.last_message_id);
                let current = (entry.conversation.last_message_at, entry.conversation.last_message_id);
                let (at, id, text) = if incoming >= current {
                    (
                        conversation.last_message_at,
                        conversation.last_message_id,
                        conversation.last_message_preview.clone(),
                    )
                } else {
                    (
                        entry.conversation.last_message_at,
                        entry.conversation.last_message_id,
                        entry.conversation.last_message_preview.clone(),
                    )
                };
                entry.conversation = conversation;
                entry.conversation.last_message_at = at;
                entry.conversation.last_message_id = id;
                entry.conversation.last_message_preview = text;
                if let (Some(at), Some(id)) = (at, id) {
                    if entry.counted_through.map_or(true, |through| (at, id) > through) {
                        entry.seen.insert(id);
                    }
                }
            }
            None => {
                let membership = MemberState::new(conversation.id, self.viewer);
                self.entries
                    .insert(conversation.id, Entry::new(conversation, membership));
            }
        }
    }

    /// Merge a membership row. Only the viewer's own row changes the directory.
    pub fn apply_member(&mut self, member: &MemberState) -> bool {
        if member.user_id != self.viewer {
            return false;
        }
        let Some(entry) = self.entries.get_mut(&member.conversation_id) else {
            return false;
        };
        let local = &mut entry.membership;
        local.archived = member.archived;
        local.muted = member.muted;
        if let Some(read_at) = member.last_read_at {
            if local.last_read_at.map_or(true, |current| read_at > current) {
                // read on another device
                local.last_read_at = Some(read_at);
                local.unread_count = member.unread_count;
            }
        }
        if let Some(delivered_at) = member.delivered_at {
            if local.delivered_at.map_or(true, |current| delivered_at > current) {
                local.delivered_at = Some(delivered_at);
            }
        }
        true
    }

    /// Account for a message that just became visible.
    ///
    /// Unread goes up by one only for another participant's message in a conversation
    /// that is not active and newer than the read watermark. A message is counted at
    /// most once, and never when the last snapshot already covered it.
    pub fn record_message(&mut self, message: &Message, active: Option<Uuid>) -> RecordOutcome {
        let viewer = self.viewer;
        let Some(entry) = self.entries.get_mut(&message.conversation_id) else {
            return RecordOutcome::UnknownConversation;
        };
        if !entry.claim(message) {
            return RecordOutcome::Duplicate;
        }

        let incoming = (Some(message.created_at), Some(message.id));
        let current = (entry.conversation.last_message_at, entry.conversation.last_message_id);
        if incoming > current {
            entry.conversation.last_message_at = Some(message.created_at);
            entry.conversation.last_message_id = Some(message.id);
            entry.conversation.last_message_preview = Some(message.preview_text());
        }

        let already_read = entry
            .membership
            .last_read_at
            .is_some_and(|read_at| message.created_at <= read_at);
        if message.sender_id != viewer && active != Some(message.conversation_id) && !already_read {
            entry.membership.unread_count += 1;
            return RecordOutcome::Counted;
        }
        RecordOutcome::Recorded
    }

    /// Refresh the preview text when the last message was edited or deleted
    pub fn record_message_update(&mut self, message: &Message) {
        if let Some(entry) = self.entries.get_mut(&message.conversation_id) {
            if entry.conversation.last_message_id == Some(message.id) {
                entry.conversation.last_message_preview = Some(message.preview_text());
            }
        }
    }

    /// Zero the viewer's unread counter and move the read watermark to `at`.
    /// Remote first: a failed call leaves the counter untouched.
    pub async fn mark_read(&mut self, conversation_id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        if !self.entries.contains_key(&conversation_id) {
            return Err(AppError::NotFound);
        }
        self.remote.mark_read(conversation_id, self.viewer, at).await?;
        self.mark_read_local(conversation_id, at);
        Ok(())
    }

    pub fn mark_read_local(&mut self, conversation_id: Uuid, at: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(&conversation_id) {
            entry.membership.unread_count = 0;
            if entry.membership.last_read_at.map_or(true, |current| at > current) {
                entry.membership.last_read_at = Some(at);
            }
        }
    }

    pub async fn archive(
        &mut self,
        conversation_id: Uuid,
        archived: bool,
        active: Option<Uuid>,
    ) -> AppResult<ArchiveEffect> {
        let flags = MemberFlags {
            archived: Some(archived),
            muted: None,
        };
        self.set_flags(conversation_id, flags).await?;
        Ok(ArchiveEffect {
            clear_selection: archived && active == Some(conversation_id),
        })
    }

    pub async fn mute(&mut self, conversation_id: Uuid, muted: bool) -> AppResult<()> {
        let flags = MemberFlags {
            archived: None,
            muted: Some(muted),
        };
        self.set_flags(conversation_id, flags).await
    }

    async fn set_flags(&mut self, conversation_id: Uuid, flags: MemberFlags) -> AppResult<()> {
        if !self.entries.contains_key(&conversation_id) {
            return Err(AppError::NotFound);
        }
        self.remote
            .set_member_flags(conversation_id, self.viewer, flags)
            .await?;
        if let Some(entry) = self.entries.get_mut(&conversation_id) {
            if let Some(archived) = flags.archived {
                entry.membership.archived = archived;
            }
            if let Some(muted) = flags.muted {
                entry.membership.muted = muted;
            }
        }
        Ok(())
    }

    fn preview_of(&self, entry: &Entry) -> ConversationPreview {
        let conversation = &entry.conversation;
        ConversationPreview {
            id: conversation.id,
            kind: conversation.kind,
            business_id: conversation.business_id,
            title: conversation.title_for(self.viewer),
            last_message_preview: conversation.last_message_preview.clone(),
            last_message_at: conversation.last_message_at,
            unread_count: entry.membership.unread_count,
            archived: entry.membership.archived,
            muted: entry.membership.muted,
            pinned: false,
        }
    }
}

fn activity(preview: &ConversationPreview) -> Option<DateTime<Utc>> {
    preview.last_message_at
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryRemoteStore;
    use chrono::Duration;

    fn person(name: &str) -> Participant {
        Participant {
            user_id: Uuid::new_v4(),
            display_name: name.to_string(),
        }
    }

    fn inbound(conversation_id: Uuid, sender: Uuid, at: DateTime<Utc>) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: sender,
            body: Some("ping".into()),
            kind: Default::default(),
            reply_to: None,
            attachments: vec![],
            client_token: None,
            created_at: at,
            edited_at: None,
            is_deleted: false,
            is_pinned: false,
            local: None,
        }
    }

    async fn directory_with_direct() -> (ConversationDirectory, Participant, Participant, Uuid) {
        let remote = Arc::new(MemoryRemoteStore::new());
        let (me, other) = (person("Ada"), person("Bo"));
        let mut dir = ConversationDirectory::new(me.user_id, None, remote);
        let id = dir.open_direct(me.clone(), other.clone()).await.unwrap();
        (dir, me, other, id)
    }

    #[tokio::test]
    async fn test_open_direct_never_duplicates_pair() {
        let (mut dir, me, other, id) = directory_with_direct().await;
        let again = dir.open_direct(me.clone(), other.clone()).await.unwrap();
        assert_eq!(id, again);
        dir.refresh().await.unwrap();
        assert_eq!(dir.len(), 1);
    }

    #[tokio::test]
    async fn test_unread_counts_inbound_once_when_inactive() {
        let (mut dir, me, other, id) = directory_with_direct().await;
        let msg = inbound(id, other.user_id, Utc::now());

        assert_eq!(dir.record_message(&msg, None), RecordOutcome::Counted);
        assert_eq!(dir.record_message(&msg, None), RecordOutcome::Duplicate);
        assert_eq!(dir.preview(id).unwrap().unread_count, 1);

        let own = inbound(id, me.user_id, Utc::now());
        assert_eq!(dir.record_message(&own, None), RecordOutcome::Recorded);

        let while_active = inbound(id, other.user_id, Utc::now());
        assert_eq!(dir.record_message(&while_active, Some(id)), RecordOutcome::Recorded);
        assert_eq!(dir.preview(id).unwrap().unread_count, 1);
    }

    #[tokio::test]
    async fn test_snapshot_counts_are_not_recounted_from_buffered_events() {
        let (mut dir, _me, other, id) = directory_with_direct().await;
        let t = Utc::now();
        let x = inbound(id, other.user_id, t);
        let y = inbound(id, other.user_id, t + Duration::milliseconds(5));

        let mut conversation = dir.conversation(id).cloned().unwrap();
        conversation.last_message_at = Some(y.created_at);
        conversation.last_message_id = Some(y.id);
        conversation.last_message_preview = Some("ping".into());
        let mut membership = dir.membership(id).cloned().unwrap();
        membership.unread_count = 2;
        dir.replace_snapshot(vec![ConversationSnapshot { conversation, membership }]);

        // events published before the snapshot was taken arrive afterwards
        assert_eq!(dir.record_message(&x, None), RecordOutcome::Duplicate);
        assert_eq!(dir.record_message(&y, None), RecordOutcome::Duplicate);
        assert_eq!(dir.preview(id).unwrap().unread_count, 2);

        let z = inbound(id, other.user_id, t + Duration::milliseconds(10));
        assert_eq!(dir.record_message(&z, None), RecordOutcome::Counted);
        assert_eq!(dir.record_message(&z, None), RecordOutcome::Duplicate);
        assert_eq!(dir.preview(id).unwrap().unread_count, 3);
    }

    #[tokio::test]
    async fn test_mark_read_zeroes_counter_and_sets_watermark() {
        let (mut dir, _me, other, id) = directory_with_direct().await;
        let t = Utc::now();
        dir.record_message(&inbound(id, other.user_id, t), None);
        dir.record_message(&inbound(id, other.user_id, t), None);
        dir.mark_read(id, t + Duration::seconds(1)).await.unwrap();
        assert_eq!(dir.preview(id).unwrap().unread_count, 0);

        // a replayed older message is already covered by the watermark
        let old = inbound(id, other.user_id, t - Duration::seconds(10));
        assert_eq!(dir.record_message(&old, None), RecordOutcome::Recorded);
        assert_eq!(dir.preview(id).unwrap().unread_count, 0);
    }

    #[tokio::test]
    async fn test_archive_active_requests_clear_selection() {
        let (mut dir, _me, _other, id) = directory_with_direct().await;
        let effect = dir.archive(id, true, Some(id)).await.unwrap();
        assert!(effect.clear_selection);
        assert!(dir.list(None).is_empty());
        assert_eq!(dir.list_archived(None).len(), 1);

        let effect = dir.archive(id, false, Some(id)).await.unwrap();
        assert!(!effect.clear_selection);
        assert_eq!(dir.list(None).len(), 1);
    }

    #[tokio::test]
    async fn test_list_sorts_by_last_activity() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let me = person("Ada");
        let mut dir = ConversationDirectory::new(me.user_id, None, remote);
        let (b, c) = (person("Bo"), person("Cy"));
        let first = dir.open_direct(me.clone(), b.clone()).await.unwrap();
        let second = dir.open_direct(me.clone(), c.clone()).await.unwrap();
        let t = Utc::now();
        dir.record_message(&inbound(first, b.user_id, t + Duration::seconds(5)), None);
        dir.record_message(&inbound(second, c.user_id, t), None);

        let order: Vec<Uuid> = dir.list(None).iter().map(|p| p.id).collect();
        assert_eq!(order, vec![first, second]);
        assert_eq!(dir.list(None)[0].title, "Bo");
    }

    #[tokio::test]
    async fn test_unknown_conversation_is_reported() {
        let (mut dir, _me, other, _id) = directory_with_direct().await;
        let stray = inbound(Uuid::new_v4(), other.user_id, Utc::now());
        assert_eq!(dir.record_message(&stray, None), RecordOutcome::UnknownConversation);
    }

    #[tokio::test]
    async fn test_search_matches_title_and_preview() {
        let (mut dir, _me, other, id) = directory_with_direct().await;
        let mut msg = inbound(id, other.user_id, Utc::now());
        msg.body = Some("Quarterly invoice".into());
        dir.record_message(&msg, None);
        assert_eq!(dir.search("bo").len(), 1);
        assert_eq!(dir.search("INVOICE").len(), 1);
        assert!(dir.search("nothing").is_empty());
    }
}
