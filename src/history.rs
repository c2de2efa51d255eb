//! Pull-based, time-boxed cache of upstream conversation history.
//!
//! The summary list ages out after five minutes; a message page fetched to
//! exhaustion is good for ten. Pagination is cursor-based on the last-seen
//! id, and a refresh always wins over a concurrently issued "load more" for
//! a now-stale cursor.

use crate::constants::{HISTORY_PAGE_SIZE, MESSAGES_CACHE_TTL, SUMMARY_CACHE_TTL};
use crate::types::{ConversationId, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: ConversationId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationPage {
    #[serde(default)]
    pub data: Vec<ConversationSummary>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryFile {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub belongs_to: Option<String>,
}

/// One stored turn as the upstream reports it: the user query and the
/// assistant answer travel together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryMessage {
    pub id: String,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub message_files: Vec<HistoryFile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePage {
    #[serde(default)]
    pub data: Vec<HistoryMessage>,
    #[serde(default)]
    pub has_more: bool,
}

/// The upstream operations the cache needs. `ProviderClient` is the real
/// implementation; tests substitute scripted fakes.
#[allow(async_fn_in_trait)]
pub trait ConversationBackend {
    async fn fetch_conversations(
        &self,
        last_id: Option<&str>,
        limit: usize,
    ) -> Result<ConversationPage>;

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        first_id: Option<&str>,
        limit: usize,
    ) -> Result<MessagePage>;
}

struct SummaryEntry {
    conversations: Vec<ConversationSummary>,
    fetched_at: Instant,
    has_more: bool,
}

struct MessagesEntry {
    messages: Vec<HistoryMessage>,
    fetched_at: Instant,
    complete: bool,
}

pub struct HistoryCache<B> {
    backend: B,
    page_size: usize,
    summaries: Option<SummaryEntry>,
    pages: HashMap<ConversationId, MessagesEntry>,
    /// Bumped on every summary refresh; a load-more that started against an
    /// older generation is discarded on arrival.
    generation: u64,
}

impl<B: ConversationBackend> HistoryCache<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            page_size: HISTORY_PAGE_SIZE,
            summaries: None,
            pages: HashMap::new(),
            generation: 0,
        }
    }

    pub fn has_more(&self) -> bool {
        self.summaries.as_ref().map(|s| s.has_more).unwrap_or(true)
    }

    pub fn invalidate(&mut self) {
        self.summaries = None;
        self.pages.clear();
    }

    pub fn invalidate_conversation(&mut self, id: &ConversationId) {
        self.pages.remove(id);
        self.summaries = None;
    }

    /// Returns the conversation summary list, consulting the cache first.
    /// `force_refresh` replaces the cached list; `load_more` appends the next
    /// page behind the cached cursor.
    pub async fn list_conversations(
        &mut self,
        force_refresh: bool,
        load_more: bool,
    ) -> Result<Vec<ConversationSummary>> {
        if !force_refresh && !load_more {
            if let Some(entry) = &self.summaries {
                if entry.fetched_at.elapsed() < SUMMARY_CACHE_TTL {
                    tracing::debug!(
                        "[HISTORY] Summary cache hit ({} conversations)",
                        entry.conversations.len()
                    );
                    return Ok(entry.conversations.clone());
                }
            }
        }

        let cursor = if load_more {
            self.summaries
                .as_ref()
                .and_then(|entry| entry.conversations.last())
                .map(|summary| summary.id.0.clone())
        } else {
            None
        };

        let started_generation = self.generation;
        let page = self
            .backend
            .fetch_conversations(cursor.as_deref(), self.page_size)
            .await?;

        if load_more {
            self.append_summary_page(started_generation, page);
        } else {
            self.replace_summaries(page);
        }

        Ok(self
            .summaries
            .as_ref()
            .map(|entry| entry.conversations.clone())
            .unwrap_or_default())
    }

    fn replace_summaries(&mut self, page: ConversationPage) {
        self.generation += 1;
        tracing::debug!(
            "[HISTORY] Summary list refreshed: {} conversations (generation {})",
            page.data.len(),
            self.generation
        );
        self.summaries = Some(SummaryEntry {
            conversations: page.data,
            fetched_at: Instant::now(),
            has_more: page.has_more,
        });
    }

    /// Appends a load-more page unless a refresh won the race: a page fetched
    /// against a stale cursor is discarded rather than merged.
    fn append_summary_page(&mut self, started_generation: u64, page: ConversationPage) -> bool {
        if started_generation != self.generation {
            tracing::debug!(
                "[HISTORY] Discarding load-more page for stale generation {} (now {})",
                started_generation,
                self.generation
            );
            return false;
        }
        match &mut self.summaries {
            Some(entry) => {
                let known: std::collections::HashSet<&str> = entry
                    .conversations
                    .iter()
                    .map(|c| c.id.0.as_str())
                    .collect();
                let fresh: Vec<ConversationSummary> = page
                    .data
                    .into_iter()
                    .filter(|c| !known.contains(c.id.0.as_str()))
                    .collect();
                entry.conversations.extend(fresh);
                entry.has_more = page.has_more;
            }
            None => self.replace_summaries(page),
        }
        true
    }

    /// Returns the full message list for a conversation, fetching page after
    /// page until the upstream runs dry. Upstream order is not trusted across
    /// pages; the result is sorted by timestamp ascending.
    pub async fn load_messages(&mut self, id: &ConversationId) -> Result<Vec<HistoryMessage>> {
        if let Some(entry) = self.pages.get(id) {
            if entry.complete && entry.fetched_at.elapsed() < MESSAGES_CACHE_TTL {
                tracing::debug!(
                    "[HISTORY] Message cache hit for {} ({} messages)",
                    id.short(),
                    entry.messages.len()
                );
                return Ok(entry.messages.clone());
            }
        }

        let mut all: Vec<HistoryMessage> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .backend
                .fetch_messages(id, cursor.as_deref(), self.page_size)
                .await?;
            let fetched = page.data.len();
            all.extend(page.data);
            if fetched < self.page_size || !page.has_more {
                break;
            }
            cursor = all.last().map(|m| m.id.clone());
        }
        all.sort_by_key(|m| m.created_at);

        tracing::debug!(
            "[HISTORY] Fetched {} messages for {} to exhaustion",
            all.len(),
            id.short()
        );
        self.pages.insert(
            id.clone(),
            MessagesEntry {
                messages: all.clone(),
                fetched_at: Instant::now(),
                complete: true,
            },
        );
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::time::Duration;

    struct ScriptedBackend {
        conversation_pages: RefCell<Vec<ConversationPage>>,
        message_pages: RefCell<Vec<MessagePage>>,
        conversation_calls: RefCell<Vec<Option<String>>>,
        message_calls: RefCell<Vec<Option<String>>>,
    }

    impl ScriptedBackend {
        fn new(conversation_pages: Vec<ConversationPage>, message_pages: Vec<MessagePage>) -> Self {
            Self {
                conversation_pages: RefCell::new(conversation_pages),
                message_pages: RefCell::new(message_pages),
                conversation_calls: RefCell::new(Vec::new()),
                message_calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl ConversationBackend for &ScriptedBackend {
        async fn fetch_conversations(
            &self,
            last_id: Option<&str>,
            _limit: usize,
        ) -> Result<ConversationPage> {
            self.conversation_calls
                .borrow_mut()
                .push(last_id.map(|s| s.to_string()));
            Ok(self.conversation_pages.borrow_mut().remove(0))
        }

        async fn fetch_messages(
            &self,
            _conversation_id: &ConversationId,
            first_id: Option<&str>,
            _limit: usize,
        ) -> Result<MessagePage> {
            self.message_calls
                .borrow_mut()
                .push(first_id.map(|s| s.to_string()));
            Ok(self.message_pages.borrow_mut().remove(0))
        }
    }

    fn summary(id: &str) -> ConversationSummary {
        ConversationSummary {
            id: ConversationId::from(id),
            name: format!("conversation {}", id),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn message(id: &str, created_at: i64) -> HistoryMessage {
        HistoryMessage {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            query: format!("q-{}", id),
            answer: format!("a-{}", id),
            created_at,
            message_files: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_fresh_summary_list_is_cached() {
        let backend = ScriptedBackend::new(
            vec![ConversationPage {
                data: vec![summary("c1"), summary("c2")],
                has_more: false,
            }],
            vec![],
        );
        let mut cache = HistoryCache::new(&backend);

        let first = cache.list_conversations(false, false).await.unwrap();
        let second = cache.list_conversations(false, false).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.conversation_calls.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_summary_list_refetches() {
        let backend = ScriptedBackend::new(
            vec![
                ConversationPage {
                    data: vec![summary("c1")],
                    has_more: false,
                },
                ConversationPage {
                    data: vec![summary("c1"), summary("c2")],
                    has_more: false,
                },
            ],
            vec![],
        );
        let mut cache = HistoryCache::new(&backend);
        cache.list_conversations(false, false).await.unwrap();

        // Age the entry past the TTL by hand.
        if let Some(entry) = &mut cache.summaries {
            entry.fetched_at = Instant::now() - SUMMARY_CACHE_TTL - Duration::from_secs(1);
        }

        let refreshed = cache.list_conversations(false, false).await.unwrap();
        assert_eq!(refreshed.len(), 2);
        assert_eq!(backend.conversation_calls.borrow().len(), 2);
    }

    #[tokio::test]
    async fn test_load_more_uses_last_seen_cursor_and_appends() {
        let backend = ScriptedBackend::new(
            vec![
                ConversationPage {
                    data: vec![summary("c1"), summary("c2")],
                    has_more: true,
                },
                ConversationPage {
                    data: vec![summary("c3")],
                    has_more: false,
                },
            ],
            vec![],
        );
        let mut cache = HistoryCache::new(&backend);
        cache.list_conversations(false, false).await.unwrap();
        let all = cache.list_conversations(false, true).await.unwrap();

        assert_eq!(all.len(), 3);
        assert!(!cache.has_more());
        assert_eq!(
            backend.conversation_calls.borrow().as_slice(),
            &[None, Some("c2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_refresh_wins_over_stale_load_more() {
        let backend = ScriptedBackend::new(
            vec![ConversationPage {
                data: vec![summary("c1")],
                has_more: true,
            }],
            vec![],
        );
        let mut cache = HistoryCache::new(&backend);
        cache.list_conversations(false, false).await.unwrap();

        let stale_generation = cache.generation;
        // A refresh lands while the load-more request is in flight.
        cache.replace_summaries(ConversationPage {
            data: vec![summary("c9")],
            has_more: false,
        });

        let merged = cache.append_summary_page(
            stale_generation,
            ConversationPage {
                data: vec![summary("c2")],
                has_more: true,
            },
        );
        assert!(!merged);
        let names: Vec<String> = cache
            .summaries
            .as_ref()
            .unwrap()
            .conversations
            .iter()
            .map(|c| c.id.0.clone())
            .collect();
        assert_eq!(names, vec!["c9".to_string()]);
    }

    #[tokio::test]
    async fn test_messages_fetched_to_exhaustion_and_sorted() {
        // page_size is 20; fill a full first page so pagination continues.
        let mut first_page: Vec<HistoryMessage> = (0..20)
            .map(|i| message(&format!("m{}", i), 100 - i as i64))
            .collect();
        first_page.reverse();
        let backend = ScriptedBackend::new(
            vec![],
            vec![
                MessagePage {
                    data: first_page,
                    has_more: true,
                },
                MessagePage {
                    data: vec![message("old", 1)],
                    has_more: false,
                },
            ],
        );
        let mut cache = HistoryCache::new(&backend);

        let id = ConversationId::from("c1");
        let messages = cache.load_messages(&id).await.unwrap();
        assert_eq!(messages.len(), 21);
        assert!(messages.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        assert_eq!(messages[0].id, "old");
        // Second fetch used the last message id of the first page as cursor.
        assert_eq!(backend.message_calls.borrow().len(), 2);
        assert!(backend.message_calls.borrow()[1].is_some());
    }

    #[tokio::test]
    async fn test_complete_message_page_is_cached() {
        let backend = ScriptedBackend::new(
            vec![],
            vec![MessagePage {
                data: vec![message("m1", 1)],
                has_more: false,
            }],
        );
        let mut cache = HistoryCache::new(&backend);
        let id = ConversationId::from("c1");

        cache.load_messages(&id).await.unwrap();
        cache.load_messages(&id).await.unwrap();
        assert_eq!(backend.message_calls.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_message_page_refetches() {
        let backend = ScriptedBackend::new(
            vec![],
            vec![
                MessagePage {
                    data: vec![message("m1", 1)],
                    has_more: false,
                },
                MessagePage {
                    data: vec![message("m1", 1), message("m2", 2)],
                    has_more: false,
                },
            ],
        );
        let mut cache = HistoryCache::new(&backend);
        let id = ConversationId::from("c1");
        cache.load_messages(&id).await.unwrap();

        if let Some(entry) = cache.pages.get_mut(&id) {
            entry.fetched_at = Instant::now() - MESSAGES_CACHE_TTL - Duration::from_secs(1);
        }

        let messages = cache.load_messages(&id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(backend.message_calls.borrow().len(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_conversation_drops_page() {
        let backend = ScriptedBackend::new(
            vec![],
            vec![
                MessagePage {
                    data: vec![message("m1", 1)],
                    has_more: false,
                },
                MessagePage {
                    data: vec![message("m1", 1)],
                    has_more: false,
                },
            ],
        );
        let mut cache = HistoryCache::new(&backend);
        let id = ConversationId::from("c1");
        cache.load_messages(&id).await.unwrap();
        cache.invalidate_conversation(&id);
        cache.load_messages(&id).await.unwrap();
        assert_eq!(backend.message_calls.borrow().len(), 2);
    }
}
