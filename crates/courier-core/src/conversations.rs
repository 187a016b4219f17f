use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use courier_db::models::{InsertOutcome, NewConversation};
use courier_types::events::GatewayEvent;
use courier_types::models::{
    Conversation, ConversationMetadata, ConversationType, ParticipantRole,
};

use crate::error::{ChatError, ChatResult};
use crate::{Courier, page_limit};

/// Context carried by a pair lookup. Richer context upgrades an existing
/// conversation; it never downgrades one.
#[derive(Debug, Clone, Default)]
pub struct PairOptions {
    pub conversation_type: Option<ConversationType>,
    pub metadata: ConversationMetadata,
}

impl Courier {
    /// The one conversation between `requester` and `other`, created on first contact.
    ///
    /// Safe under concurrent callers: the store rejects a second row for the
    /// pair and the loser of the race returns the winner's conversation.
    pub async fn find_or_create(
        &self,
        requester: Uuid,
        other: Uuid,
        options: PairOptions,
    ) -> ChatResult<Conversation> {
        if requester.is_nil() || other.is_nil() {
            return Err(ChatError::InvalidParticipant("missing user id".into()));
        }
        if requester == other {
            return Err(ChatError::InvalidParticipant(
                "cannot start a conversation with yourself".into(),
            ));
        }
        let conversation_type = options.conversation_type.unwrap_or(ConversationType::Direct);
        if !conversation_type.is_pair() {
            return Err(ChatError::InvalidConversation(
                "group conversations are created explicitly".into(),
            ));
        }

        if let Some(existing) = self
            .blocking(move |db| db.find_pair_conversation(requester, other))
            .await?
        {
            return self.enrich(existing, conversation_type, options.metadata).await;
        }

        let new = NewConversation {
            id: Uuid::new_v4(),
            conversation_type,
            participants: vec![
                (requester, ParticipantRole::Member),
                (other, ParticipantRole::Member),
            ],
            metadata: options.metadata.clone(),
            created_at: Utc::now(),
        };
        match self.blocking(move |db| db.insert_conversation(&new)).await? {
            InsertOutcome::Inserted(conversation) => {
                info!(
                    "Created {} conversation {} for {} and {}",
                    conversation_type.as_str(),
                    conversation.id,
                    requester,
                    other
                );
                self.announce(&conversation, Some(requester)).await;
                Ok(conversation)
            }
            InsertOutcome::Duplicate => {
                debug!("Create race for {}/{} resolved by re-read", requester, other);
                let winner = self
                    .blocking(move |db| db.find_pair_conversation(requester, other))
                    .await?
                    .ok_or(ChatError::Storage)?;
                self.enrich(winner, conversation_type, options.metadata).await
            }
        }
    }

    /// Fill in metadata the conversation lacks and upgrade direct to project.
    /// The merge happens in the store, so racing requests only ever add.
    async fn enrich(
        &self,
        conversation: Conversation,
        conversation_type: ConversationType,
        metadata: ConversationMetadata,
    ) -> ChatResult<Conversation> {
        let richer = conversation.metadata.merged_with(&metadata) != conversation.metadata
            || conversation_type.richness() > conversation.conversation_type.richness();
        if !richer {
            return Ok(conversation);
        }

        let id = conversation.id;
        let (changed, updated) = self
            .blocking(move |db| {
                let changed = db.enrich_conversation(id, conversation_type, &metadata, Utc::now())?;
                Ok((changed, db.get_conversation(id)?))
            })
            .await?;
        let updated = updated.ok_or(ChatError::NotFound("conversation"))?;
        if changed {
            info!(
                "Conversation {} now {} with {:?}",
                id,
                updated.conversation_type.as_str(),
                updated.metadata
            );
            self.announce(&updated, None).await;
        }
        Ok(updated)
    }

    /// Create a group. The creator becomes admin; duplicates are ignored.
    pub async fn create_group(
        &self,
        creator: Uuid,
        participant_ids: Vec<Uuid>,
        metadata: ConversationMetadata,
    ) -> ChatResult<Conversation> {
        let mut participants = vec![(creator, ParticipantRole::Admin)];
        for id in participant_ids {
            if id.is_nil() {
                return Err(ChatError::InvalidParticipant("missing user id".into()));
            }
            if !participants.iter().any(|(existing, _)| *existing == id) {
                participants.push((id, ParticipantRole::Member));
            }
        }
        if participants.len() < 3 {
            return Err(ChatError::InvalidParticipant(
                "a group needs at least three distinct participants".into(),
            ));
        }

        let new = NewConversation {
            id: Uuid::new_v4(),
            conversation_type: ConversationType::Group,
            participants,
            metadata,
            created_at: Utc::now(),
        };
        match self.blocking(move |db| db.insert_conversation(&new)).await? {
            InsertOutcome::Inserted(conversation) => {
                info!(
                    "Created group {} with {} participants",
                    conversation.id,
                    conversation.participants.len()
                );
                self.announce(&conversation, Some(creator)).await;
                Ok(conversation)
            }
            InsertOutcome::Duplicate => Err(ChatError::InvalidConversation("group already exists".into())),
        }
    }

    /// A conversation the user actively participates in.
    pub async fn conversation_for(&self, user_id: Uuid, conversation_id: Uuid) -> ChatResult<Conversation> {
        let conversation = self
            .blocking(move |db| db.get_conversation(conversation_id))
            .await?
            .ok_or(ChatError::NotFound("conversation"))?;
        if !conversation.is_active_participant(user_id) {
            return Err(ChatError::Forbidden);
        }
        Ok(conversation)
    }

    /// Page of the user's conversations by most recent activity, each with
    /// its unread message count. The bool is true when more pages follow.
    pub async fn list_conversations(
        &self,
        user_id: Uuid,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> ChatResult<(Vec<(Conversation, u64)>, bool)> {
        let limit = page_limit(limit, 20);
        let offset = page.unwrap_or(1).max(1).saturating_sub(1).saturating_mul(limit);
        let mut rows = self
            .blocking(move |db| db.list_conversations_for_user(user_id, limit + 1, offset))
            .await?;
        let has_more = rows.len() > limit as usize;
        rows.truncate(limit as usize);
        Ok((rows, has_more))
    }

    /// Add someone to a group. Adding an active member is a no-op.
    pub async fn add_participant(
        &self,
        actor: Uuid,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> ChatResult<Conversation> {
        let conversation = self.conversation_for(actor, conversation_id).await?;
        if conversation.conversation_type != ConversationType::Group {
            return Err(ChatError::InvalidConversation(
                "participants can only be added to groups".into(),
            ));
        }
        if user_id.is_nil() {
            return Err(ChatError::InvalidParticipant("missing user id".into()));
        }
        if conversation.is_active_participant(user_id) {
            return Ok(conversation);
        }

        let updated = self
            .blocking(move |db| {
                db.add_participant(conversation_id, user_id, ParticipantRole::Member, Utc::now())?;
                db.get_conversation(conversation_id)
            })
            .await?
            .ok_or(ChatError::NotFound("conversation"))?;
        info!("{} added {} to group {}", actor, user_id, conversation_id);
        self.announce(&updated, None).await;
        Ok(updated)
    }

    /// Leave a group. Pair conversations cannot be left.
    pub async fn leave_conversation(&self, user_id: Uuid, conversation_id: Uuid) -> ChatResult<Conversation> {
        let conversation = self.conversation_for(user_id, conversation_id).await?;
        if conversation.conversation_type != ConversationType::Group {
            return Err(ChatError::InvalidConversation(
                "only group conversations can be left".into(),
            ));
        }

        let updated = self
            .blocking(move |db| {
                db.deactivate_participant(conversation_id, user_id, Utc::now())?;
                db.get_conversation(conversation_id)
            })
            .await?
            .ok_or(ChatError::NotFound("conversation"))?;
        info!("{} left group {}", user_id, conversation_id);
        self.inner.dispatcher.broadcast(GatewayEvent::ParticipantLeft {
            conversation_id,
            user_id,
        });
        self.announce(&updated, None).await;
        self.inner
            .dispatcher
            .send_to_user(user_id, GatewayEvent::ConversationUpdated { conversation: updated.clone() })
            .await;
        Ok(updated)
    }

    /// Push `conversation-updated` to every active participant except `skip`.
    pub(crate) async fn announce(&self, conversation: &Conversation, skip: Option<Uuid>) {
        for user_id in conversation.active_participant_ids() {
            if Some(user_id) == skip {
                continue;
            }
            self.inner
                .dispatcher
                .send_to_user(
                    user_id,
                    GatewayEvent::ConversationUpdated { conversation: conversation.clone() },
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::StaticDirectory;
    use crate::testing::{RecordingMailer, courier};

    fn service() -> Courier {
        courier(Arc::new(RecordingMailer::default()), StaticDirectory::default())
    }

    #[tokio::test]
    async fn pair_lookup_is_order_independent() {
        let courier = service();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let first = courier.find_or_create(a, b, PairOptions::default()).await.unwrap();
        let second = courier.find_or_create(b, a, PairOptions::default()).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.conversation_type, ConversationType::Direct);
    }

    #[tokio::test]
    async fn self_and_nil_participants_are_rejected() {
        let courier = service();
        let a = Uuid::new_v4();

        let err = courier.find_or_create(a, a, PairOptions::default()).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidParticipant(_)));
        let err = courier.find_or_create(a, Uuid::nil(), PairOptions::default()).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidParticipant(_)));
    }

    #[tokio::test]
    async fn project_context_upgrades_but_never_downgrades() {
        let courier = service();
        let (client, pro) = (Uuid::new_v4(), Uuid::new_v4());
        let direct = courier.find_or_create(client, pro, PairOptions::default()).await.unwrap();

        let project = courier
            .find_or_create(
                pro,
                client,
                PairOptions {
                    conversation_type: Some(ConversationType::Project),
                    metadata: ConversationMetadata { job_id: Some("job-1".into()), application_id: None },
                },
            )
            .await
            .unwrap();
        assert_eq!(project.id, direct.id);
        assert_eq!(project.conversation_type, ConversationType::Project);
        assert_eq!(project.metadata.job_id.as_deref(), Some("job-1"));

        let again = courier.find_or_create(client, pro, PairOptions::default()).await.unwrap();
        assert_eq!(again.conversation_type, ConversationType::Project);
        assert_eq!(again.metadata.job_id.as_deref(), Some("job-1"));
    }

    #[tokio::test]
    async fn groups_need_three_people_and_only_groups_can_be_left() {
        let courier = service();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let err = courier.create_group(a, vec![b, b, a], ConversationMetadata::default()).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidParticipant(_)));

        let group = courier.create_group(a, vec![b, c], ConversationMetadata::default()).await.unwrap();
        assert_eq!(group.participants[0].role, ParticipantRole::Admin);

        let left = courier.leave_conversation(c, group.id).await.unwrap();
        assert!(!left.is_active_participant(c));
        assert!(matches!(courier.conversation_for(c, group.id).await, Err(ChatError::Forbidden)));

        let rejoined = courier.add_participant(a, group.id, c).await.unwrap();
        assert!(rejoined.is_active_participant(c));

        let pair = courier.find_or_create(a, b, PairOptions::default()).await.unwrap();
        let err = courier.leave_conversation(a, pair.id).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidConversation(_)));
    }

    #[tokio::test]
    async fn outsiders_cannot_read_or_join() {
        let courier = service();
        let (a, b, outsider) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let conversation = courier.find_or_create(a, b, PairOptions::default()).await.unwrap();

        assert!(matches!(
            courier.conversation_for(outsider, conversation.id).await,
            Err(ChatError::Forbidden)
        ));
        assert!(matches!(
            courier.conversation_for(a, Uuid::new_v4()).await,
            Err(ChatError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn listing_pages_by_activity() {
        let courier = service();
        let me = Uuid::new_v4();
        for _ in 0..3 {
            courier.find_or_create(me, Uuid::new_v4(), PairOptions::default()).await.unwrap();
        }

        let (page, has_more) = courier.list_conversations(me, Some(1), Some(2)).await.unwrap();
        assert_eq!(page.len(), 2);
        assert!(has_more);
        let (rest, has_more) = courier.list_conversations(me, Some(2), Some(2)).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(!has_more);
    }
}
