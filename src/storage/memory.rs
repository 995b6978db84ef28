//! In-memory event backend for tests and embedding.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::core::event_log::{check_record_update, EventBackend};
use crate::domain::{Conversation, Event};

#[derive(Default)]
struct Inner {
    /// Every event in the order the writer persisted it
    events: Vec<Event>,
    conversations: HashMap<Uuid, Conversation>,
}

/// Event backend that keeps everything in process memory
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All persisted events across traces, in persistence order
    pub fn all_events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }
}

#[async_trait]
impl EventBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn persist(&self, event: &Event) -> Result<()> {
        let mut inner = self.lock();
        let duplicate = inner.events.iter().any(|e| {
            e.trace_id == event.trace_id && e.sequence_number == event.sequence_number
        });
        if duplicate {
            bail!(
                "duplicate sequence number {} for trace {}",
                event.sequence_number,
                event.trace_id
            );
        }
        inner.events.push(event.clone());
        Ok(())
    }

    async fn events_for_trace(&self, trace_id: Uuid) -> Result<Vec<Event>> {
        let mut events: Vec<Event> = self
            .lock()
            .events
            .iter()
            .filter(|e| e.trace_id == trace_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.sequence_number);
        Ok(events)
    }

    async fn create_conversation(&self, conversation: &Conversation) -> Result<bool> {
        match self.lock().conversations.entry(conversation.conversation_id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(conversation.clone());
                Ok(true)
            }
        }
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let mut inner = self.lock();
        if let Some(stored) = inner.conversations.get(&conversation.conversation_id) {
            check_record_update(stored, conversation)?;
        }
        inner
            .conversations
            .insert(conversation.conversation_id, conversation.clone());
        Ok(())
    }

    async fn load_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        Ok(self.lock().conversations.get(&conversation_id).cloned())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let mut conversations: Vec<Conversation> =
            self.lock().conversations.values().cloned().collect();
        conversations.sort_by_key(|c| c.started_at);
        Ok(conversations)
    }
}
