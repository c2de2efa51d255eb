//! Local chat sessions and the session registry.
//!
//! A session is the UI-visible thread of messages. It may start life fresh or
//! be promoted from upstream history; once a conversation is materialized as
//! a session, history is never consulted for it again.

use crate::constants::SESSION_TITLE_MAX_CHARS;
use crate::detector;
use crate::history::{ConversationSummary, HistoryMessage};
use crate::str_utils::prefix_chars;
use crate::types::{
    AttachmentKind, AttachmentOrigin, AttachmentSource, ConversationId, FileAttachment, MessageId,
    Role, SessionId,
};
use chrono::{DateTime, TimeZone, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub attachments: Vec<FileAttachment>,
    pub streaming: bool,
    pub error: bool,
}

impl Message {
    pub fn user(content: impl Into<String>, attachments: Vec<FileAttachment>) -> Self {
        Self {
            id: MessageId::new(),
            role: Role::User,
            content: content.into(),
            created_at: Utc::now(),
            attachments,
            streaming: false,
            error: false,
        }
    }

    /// The provisional assistant message a turn streams into.
    pub fn assistant_streaming() -> Self {
        Self {
            id: MessageId::new(),
            role: Role::Assistant,
            content: String::new(),
            created_at: Utc::now(),
            attachments: Vec::new(),
            streaming: true,
            error: false,
        }
    }

    fn assistant_final(
        content: impl Into<String>,
        attachments: Vec<FileAttachment>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            role: Role::Assistant,
            content: content.into(),
            created_at,
            attachments,
            streaming: false,
            error: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub messages: Vec<Message>,
    pub updated_at: DateTime<Utc>,
    pub conversation_id: Option<ConversationId>,
    pub from_history: bool,
}

impl Session {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: SessionId::new(),
            title: title.into(),
            messages: Vec::new(),
            updated_at: Utc::now(),
            conversation_id: None,
            from_history: false,
        }
    }

    /// Derives a display title from the first prompt of a fresh thread.
    pub fn title_from_prompt(prompt: &str) -> String {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return "New conversation".to_string();
        }
        if prompt.chars().count() <= SESSION_TITLE_MAX_CHARS {
            prompt.to_string()
        } else {
            format!("{}…", prefix_chars(prompt, SESSION_TITLE_MAX_CHARS - 1))
        }
    }

    /// Rebuilds a session from upstream history. Each stored turn becomes a
    /// user/assistant message pair; attachments come from the declared files
    /// plus a detection pass over the answer text.
    pub fn from_history(summary: &ConversationSummary, messages: &[HistoryMessage]) -> Self {
        let mut session = Self::new(if summary.name.is_empty() {
            messages
                .first()
                .map(|m| Self::title_from_prompt(&m.query))
                .unwrap_or_else(|| "New conversation".to_string())
        } else {
            summary.name.clone()
        });
        session.conversation_id = Some(summary.id.clone());
        session.from_history = true;

        for record in messages {
            let created_at = Utc
                .timestamp_opt(record.created_at, 0)
                .single()
                .unwrap_or_else(Utc::now);
            let (user_files, agent_files) = split_history_files(record);
            session.messages.push(Message {
                id: MessageId::new(),
                role: Role::User,
                content: record.query.clone(),
                created_at,
                attachments: user_files,
                streaming: false,
                error: false,
            });

            let mut attachments = agent_files;
            attachments.extend(detector::detect_attachments(&record.answer));
            session.messages.push(Message::assistant_final(
                record.answer.clone(),
                detector::dedup_by_url(attachments),
                created_at,
            ));
        }
        session.touch();
        session
    }

    /// Writes the provider-issued identity back to the session. First
    /// assignment wins; a later differing value is logged and ignored.
    pub fn adopt_identity(&mut self, id: ConversationId) {
        match &self.conversation_id {
            None => {
                tracing::info!("[SESSION] Conversation identity assigned: {}", id.short());
                self.conversation_id = Some(id);
            }
            Some(existing) if *existing == id => {}
            Some(existing) => {
                tracing::warn!(
                    "[SESSION] Upstream reported conflicting conversation identity {} (keeping {})",
                    id.short(),
                    existing.short()
                );
            }
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn streaming_message_mut(&mut self) -> Option<&mut Message> {
        self.messages.iter_mut().rev().find(|m| m.streaming)
    }

    pub fn has_streaming_message(&self) -> bool {
        self.messages.iter().any(|m| m.streaming)
    }
}

/// Registry of local sessions. Sessions are only ever removed by explicit
/// user action; the caller is responsible for the matching upstream deletion.
#[derive(Default)]
pub struct SessionStore {
    sessions: Vec<Session>,
    active: Option<SessionId>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, title: impl Into<String>) -> SessionId {
        let session = Session::new(title);
        let id = session.id;
        self.sessions.push(session);
        self.active = Some(id);
        id
    }

    /// Promotes a history conversation to a live session. If the conversation
    /// is already materialized, the existing session simply becomes active.
    pub fn open_history(
        &mut self,
        summary: &ConversationSummary,
        messages: &[HistoryMessage],
    ) -> SessionId {
        if let Some(existing) = self.find_by_conversation(&summary.id) {
            let id = existing.id;
            self.active = Some(id);
            return id;
        }
        let session = Session::from_history(summary, messages);
        let id = session.id;
        self.sessions.push(session);
        self.active = Some(id);
        id
    }

    pub fn find_by_conversation(&self, conversation_id: &ConversationId) -> Option<&Session> {
        self.sessions
            .iter()
            .find(|s| s.conversation_id.as_ref() == Some(conversation_id))
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    pub fn active_id(&self) -> Option<SessionId> {
        self.active
    }

    pub fn set_active(&mut self, id: SessionId) -> bool {
        if self.sessions.iter().any(|s| s.id == id) {
            self.active = Some(id);
            true
        } else {
            false
        }
    }

    pub fn active_mut(&mut self) -> Option<&mut Session> {
        let id = self.active?;
        self.get_mut(id)
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let idx = self.sessions.iter().position(|s| s.id == id)?;
        if self.active == Some(id) {
            self.active = None;
        }
        Some(self.sessions.remove(idx))
    }

    /// Sessions in recency order, newest first.
    pub fn recent(&self) -> Vec<&Session> {
        let mut sessions: Vec<&Session> = self.sessions.iter().collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn split_history_files(record: &HistoryMessage) -> (Vec<FileAttachment>, Vec<FileAttachment>) {
    let mut user_files = Vec::new();
    let mut agent_files = Vec::new();
    for file in &record.message_files {
        let name = detector::filename_of(&file.url)
            .unwrap_or("attachment")
            .to_string();
        let kind = detector::kind_for_name(&name).unwrap_or(match file.kind.as_str() {
            "image" => AttachmentKind::Image,
            "audio" => AttachmentKind::Audio,
            "video" => AttachmentKind::Video,
            "document" => AttachmentKind::Document,
            _ => AttachmentKind::Binary,
        });
        let attachment = FileAttachment {
            id: if file.id.is_empty() {
                uuid::Uuid::new_v4().to_string()
            } else {
                file.id.clone()
            },
            name,
            kind,
            size_bytes: 0,
            origin: match file.belongs_to.as_deref() {
                Some("user") => AttachmentOrigin::User,
                _ => AttachmentOrigin::Agent,
            },
            source: AttachmentSource::Url {
                url: file.url.clone(),
            },
        };
        match attachment.origin {
            AttachmentOrigin::User => user_files.push(attachment),
            AttachmentOrigin::Agent => agent_files.push(attachment),
        }
    }
    (user_files, agent_files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryFile;

    fn summary(id: &str, name: &str) -> ConversationSummary {
        ConversationSummary {
            id: ConversationId::from(id),
            name: name.to_string(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_title_from_prompt_truncates_on_char_boundary() {
        let short = Session::title_from_prompt("Quick question");
        assert_eq!(short, "Quick question");

        let long = "こんにちは".repeat(20);
        let title = Session::title_from_prompt(&long);
        assert!(title.ends_with('…'));
        assert!(title.chars().count() <= SESSION_TITLE_MAX_CHARS);
    }

    #[test]
    fn test_adopt_identity_first_assignment_wins() {
        let mut session = Session::new("t");
        session.adopt_identity(ConversationId::from("c1"));
        session.adopt_identity(ConversationId::from("c2"));
        assert_eq!(session.conversation_id, Some(ConversationId::from("c1")));

        // Re-confirming the same identity is a no-op.
        session.adopt_identity(ConversationId::from("c1"));
        assert_eq!(session.conversation_id, Some(ConversationId::from("c1")));
    }

    #[test]
    fn test_from_history_builds_ordered_pairs() {
        let messages = vec![
            HistoryMessage {
                id: "m1".into(),
                conversation_id: "c1".into(),
                query: "What is up?".into(),
                answer: "Not much.".into(),
                created_at: 100,
                message_files: vec![],
            },
            HistoryMessage {
                id: "m2".into(),
                conversation_id: "c1".into(),
                query: "Send the report".into(),
                answer: "Here: [r.pdf](https://h/r.pdf)".into(),
                created_at: 200,
                message_files: vec![],
            },
        ];
        let session = Session::from_history(&summary("c1", "Status chat"), &messages);

        assert_eq!(session.title, "Status chat");
        assert!(session.from_history);
        assert_eq!(session.conversation_id, Some(ConversationId::from("c1")));
        assert_eq!(session.messages.len(), 4);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[1].role, Role::Assistant);
        assert!(!session.messages.iter().any(|m| m.streaming));

        // The linked report was reconstructed from the answer text.
        let last = &session.messages[3];
        assert_eq!(last.attachments.len(), 1);
        assert_eq!(last.attachments[0].name, "r.pdf");
    }

    #[test]
    fn test_from_history_splits_declared_files_by_owner() {
        let messages = vec![HistoryMessage {
            id: "m1".into(),
            conversation_id: "c1".into(),
            query: "look at this".into(),
            answer: "done".into(),
            created_at: 1,
            message_files: vec![
                HistoryFile {
                    id: "f1".into(),
                    kind: "image".into(),
                    url: "https://h/in.png".into(),
                    belongs_to: Some("user".into()),
                },
                HistoryFile {
                    id: "f2".into(),
                    kind: "image".into(),
                    url: "https://h/out.png".into(),
                    belongs_to: Some("assistant".into()),
                },
            ],
        }];
        let session = Session::from_history(&summary("c1", "files"), &messages);

        assert_eq!(session.messages[0].attachments.len(), 1);
        assert_eq!(session.messages[0].attachments[0].origin, AttachmentOrigin::User);
        assert_eq!(session.messages[1].attachments.len(), 1);
        assert_eq!(session.messages[1].attachments[0].origin, AttachmentOrigin::Agent);
    }

    #[test]
    fn test_store_open_history_never_duplicates() {
        let mut store = SessionStore::new();
        let s = summary("c1", "once");
        let first = store.open_history(&s, &[]);
        let second = store.open_history(&s, &[]);
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        assert_eq!(store.active_id(), Some(first));
    }

    #[test]
    fn test_store_recent_orders_by_update() {
        let mut store = SessionStore::new();
        let a = store.create("a");
        let b = store.create("b");
        if let Some(session) = store.get_mut(a) {
            session.updated_at = Utc::now() + chrono::Duration::seconds(5);
        }
        let recent = store.recent();
        assert_eq!(recent[0].id, a);
        assert_eq!(recent[1].id, b);
    }

    #[test]
    fn test_store_remove_clears_active() {
        let mut store = SessionStore::new();
        let id = store.create("gone");
        assert_eq!(store.active_id(), Some(id));
        let removed = store.remove(id);
        assert!(removed.is_some());
        assert_eq!(store.active_id(), None);
        assert!(store.is_empty());
    }
}
