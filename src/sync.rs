//! Message list for the open conversation, kept consistent across the
//! initial history load, optimistic local sends and realtime pushes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde_json::Value;

use crate::api::client::ChatBackend;
use crate::api::events::{CONVERSATION_UPDATED, NEW_MESSAGE};
use crate::api::models::{Conversation, Message, OutboundChat, is_unset_user_id};
use crate::bus::{ChatTransport, EventBus, Subscription};
use crate::error::{Error, Result};
use crate::identity::{IdentityResolver, dominant_participant};
use crate::storage::ConversationCache;

const CACHED_SUMMARY_LIMIT: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPolicy {
    /// How long after a send the sidebar is refetched, giving the server
    /// time to persist the message.
    pub summary_refresh_delay: Duration,
    /// Drop the optimistic entry when the transport refuses the send.
    pub rollback_on_send_failure: bool,
    /// Discard history responses that arrive after a newer selection.
    pub cancel_stale_loads: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            summary_refresh_delay: Duration::from_millis(500),
            rollback_on_send_failure: false,
            cancel_stale_loads: false,
        }
    }
}

/// What `on_incoming` did with a pushed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Not part of the active conversation.
    Ignored,
    /// Took the place of the pending entry at this index.
    Replaced(usize),
    Appended,
    /// Already present under the same server id.
    Duplicate,
}

#[derive(Default)]
struct SyncState {
    active: Option<Conversation>,
    messages: Vec<Message>,
    conversations: Vec<Conversation>,
    /// Bumped on every selection so late history responses can be recognized.
    generation: u64,
}

#[derive(Clone)]
pub struct ConversationSync {
    backend: Arc<dyn ChatBackend>,
    transport: Arc<dyn ChatTransport>,
    identity: Arc<dyn IdentityResolver>,
    local_user: Arc<OnceCell<String>>,
    cache: Option<Arc<ConversationCache>>,
    policy: SyncPolicy,
    state: Arc<Mutex<SyncState>>,
}

impl ConversationSync {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        transport: Arc<dyn ChatTransport>,
        identity: Arc<dyn IdentityResolver>,
        policy: SyncPolicy,
    ) -> Self {
        Self {
            backend,
            transport,
            identity,
            local_user: Arc::new(OnceCell::new()),
            cache: None,
            policy,
            state: Arc::new(Mutex::new(SyncState::default())),
        }
    }

    pub fn with_cache(mut self, cache: Arc<ConversationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    fn state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state().messages.clone()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.state().conversations.clone()
    }

    pub fn active_conversation(&self) -> Option<Conversation> {
        self.state().active.clone()
    }

    pub fn local_user_id(&self) -> Option<String> {
        self.local_user.get().cloned()
    }

    /// Resolves the signed-in user once; later calls reuse the answer.
    /// When the injected resolver has no answer, the sidebar already in
    /// memory is used to infer the most frequent participant.
    pub async fn resolve_local_user(&self) -> Option<String> {
        if let Some(id) = self.local_user.get() {
            return Some(id.clone());
        }
        let resolved = match self.identity.resolve_local_user_id().await {
            Ok(found) => found,
            Err(e) => {
                log::warn!("local user resolution failed: {e}");
                None
            }
        };
        let resolved = resolved.or_else(|| {
            let inferred = dominant_participant(&self.state().conversations);
            if let Some(id) = &inferred {
                log::info!("local user inferred from the conversation list: {id}");
            }
            inferred
        });
        match resolved {
            Some(id) => {
                log::info!("local user is {id}");
                let _ = self.local_user.set(id);
                self.local_user.get().cloned()
            }
            None => {
                log::warn!("could not determine the local user");
                None
            }
        }
    }

    /// Fills an empty sidebar from the on-disk cache. Returns how many
    /// summaries were loaded.
    pub fn warm_from_cache(&self) -> usize {
        let Some(cache) = &self.cache else { return 0 };
        match cache.load(Some(CACHED_SUMMARY_LIMIT)) {
            Ok(cached) => {
                let mut state = self.state();
                if !state.conversations.is_empty() {
                    return 0;
                }
                let n = cached.len();
                state.conversations = cached;
                n
            }
            Err(e) => {
                log::warn!("reading cached conversations failed: {e}");
                0
            }
        }
    }

    pub async fn refresh_conversations(&self) -> Result<Vec<Conversation>> {
        let raw = match self.backend.conversations().await {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("conversation list refresh failed: {e}");
                return Err(e);
            }
        };
        let list = dedupe_conversations(raw);
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.upsert(&list) {
                log::warn!("caching conversations failed: {e}");
            }
        }

        let mut state = self.state();
        let refreshed = state
            .active
            .as_ref()
            .and_then(|active| list.iter().find(|c| c.id == active.id).cloned());
        if let Some(active) = refreshed {
            state.active = Some(active);
        }
        state.conversations = list.clone();
        Ok(list)
    }

    fn schedule_summary_refresh(&self, delay: Duration) {
        let this = self.clone();
        crate::utils::spawn_async(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            // Failures are logged inside.
            let _ = this.refresh_conversations().await;
        });
    }

    /// Makes `conversation_id` the active conversation and loads its history.
    pub async fn select_conversation(&self, conversation_id: &str) -> Result<Vec<Message>> {
        {
            let mut state = self.state();
            let conv = state
                .conversations
                .iter()
                .find(|c| c.id == conversation_id)
                .cloned()
                .ok_or_else(|| Error::UnknownConversation(conversation_id.to_string()))?;
            state.generation += 1;
            state.active = Some(conv);
            state.messages.clear();
        }
        self.resolve_local_user().await;
        self.load_initial(conversation_id).await
    }

    /// Fetches the history and replaces the message list with it, oldest
    /// first. On failure the current list is kept.
    pub async fn load_initial(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let generation = self.state().generation;
        let mut messages = match self.backend.messages(conversation_id).await {
            Ok(messages) => messages,
            Err(e) => {
                log::warn!("loading history for {conversation_id} failed: {e}");
                return Err(e);
            }
        };
        messages.sort_by_key(|m| m.created_at);

        let mut state = self.state();
        if self.policy.cancel_stale_loads {
            let moved_on = state.generation != generation
                || state.active.as_ref().is_some_and(|a| a.id != conversation_id);
            if moved_on {
                log::debug!("discarding superseded history for {conversation_id}");
                return Err(Error::Superseded(conversation_id.to_string()));
            }
        }
        state.messages = messages.clone();
        Ok(messages)
    }

    /// Optimistically appends `text` to the active conversation and hands it
    /// to the realtime transport, or to the REST endpoint while the realtime
    /// channel is down. `recipient_hint` is only used when the conversation
    /// record does not name a usable peer.
    pub async fn send_local(&self, text: &str, recipient_hint: Option<&str>) -> Result<Message> {
        if text.trim().is_empty() {
            return Err(Error::EmptyMessage);
        }
        // Without a sender id the echo could never replace the pending entry,
        // and the recipient could turn out to be ourselves.
        let Some(local) = self.resolve_local_user().await else {
            return Err(Error::NoRecipient);
        };

        let pending = {
            let mut state = self.state();
            let conv = state.active.as_ref().ok_or(Error::NoActiveConversation)?;
            let recipient = conv
                .counterpart_for(Some(local.as_str()))
                .or(recipient_hint.filter(|id| !is_unset_user_id(id) && *id != local))
                .ok_or(Error::NoRecipient)?
                .to_string();
            let pending = Message::pending(local, recipient, text, conv.id.clone());
            state.messages.push(pending.clone());
            pending
        };

        let frame = OutboundChat {
            recipient_id: pending.receiver_id.clone().unwrap_or_default(),
            content: text.to_string(),
        };
        let sent = match self.transport.send_chat(&frame) {
            Ok(()) => Ok(None),
            Err(Error::NotConnected) => {
                log::info!("realtime channel down; sending to {} over REST", frame.recipient_id);
                self.backend
                    .send_message(&frame.recipient_id, &frame.content)
                    .await
                    .map(Some)
            }
            Err(e) => Err(e),
        };
        self.schedule_summary_refresh(self.policy.summary_refresh_delay);

        match sent {
            Ok(None) => Ok(pending),
            Ok(Some(confirmed)) => {
                let mut state = self.state();
                let already_present = state.messages.iter().any(|m| m.id == confirmed.id);
                if let Some(idx) = state.messages.iter().position(|m| m.id == pending.id) {
                    if already_present {
                        state.messages.remove(idx);
                    } else {
                        state.messages[idx] = confirmed.clone();
                    }
                }
                Ok(confirmed)
            }
            Err(e) => {
                log::error!("sending message to {} failed: {e}", frame.recipient_id);
                if self.policy.rollback_on_send_failure {
                    self.state().messages.retain(|m| m.id != pending.id);
                }
                Err(e)
            }
        }
    }

    /// Applies a pushed chat message to the active conversation, then
    /// refreshes the sidebar whatever the outcome.
    pub fn on_incoming(&self, message: Message) -> Reconciliation {
        let id = message.id.clone();
        let outcome = {
            let local = self.local_user.get().map(String::as_str);
            let mut state = self.state();
            let relevant = state
                .active
                .as_ref()
                .is_some_and(|active| belongs_to(active, &message));
            if relevant {
                apply_push(&mut state.messages, message, local)
            } else {
                Reconciliation::Ignored
            }
        };
        log::debug!("push {id}: {outcome:?}");
        self.schedule_summary_refresh(Duration::ZERO);
        outcome
    }

    /// Routes realtime pushes from `bus` into this sync.
    pub fn attach(&self, bus: &EventBus) -> Vec<Subscription> {
        let this = self.clone();
        let on_message = bus.subscribe(NEW_MESSAGE, move |payload: &Value| {
            match serde_json::from_value::<Message>(payload.clone()) {
                Ok(message) => {
                    this.on_incoming(message);
                }
                Err(e) => log::warn!("dropping undecodable chat push: {e}"),
            }
        });
        let this = self.clone();
        let on_update = bus.subscribe(CONVERSATION_UPDATED, move |_: &Value| {
            this.schedule_summary_refresh(Duration::ZERO);
        });
        vec![on_message, on_update]
    }
}

fn belongs_to(conv: &Conversation, message: &Message) -> bool {
    if message.conversation_id.as_deref() == Some(conv.id.as_str()) {
        return true;
    }
    message
        .receiver_id
        .as_deref()
        .is_some_and(|receiver| conv.involves_pair(&message.sender_id, receiver))
}

/// Reconciles one pushed message into `messages`.
///
/// An echo of our own send takes the place of the first pending entry with
/// the same content. Anything else is appended unless its id is already
/// present.
pub fn apply_push(
    messages: &mut Vec<Message>,
    message: Message,
    local_user_id: Option<&str>,
) -> Reconciliation {
    let already_present = messages.iter().any(|m| m.id == message.id);

    if local_user_id.is_some_and(|me| me == message.sender_id) {
        let pending = messages
            .iter()
            .position(|m| m.is_pending() && m.content == message.content);
        if let Some(idx) = pending {
            if already_present {
                messages.remove(idx);
                return Reconciliation::Duplicate;
            }
            messages[idx] = message;
            return Reconciliation::Replaced(idx);
        }
    }

    if already_present {
        return Reconciliation::Duplicate;
    }
    messages.push(message);
    Reconciliation::Appended
}

/// One entry per conversation id and per unordered participant pair, first
/// occurrence kept, newest first.
pub fn dedupe_conversations(raw: Vec<Conversation>) -> Vec<Conversation> {
    let mut seen_ids = HashSet::new();
    let mut seen_pairs = HashSet::new();
    let mut out: Vec<Conversation> = raw
        .into_iter()
        .filter(|c| seen_ids.insert(c.id.clone()) && seen_pairs.insert(c.pair_key()))
        .collect();
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    out
}
