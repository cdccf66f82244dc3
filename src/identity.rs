//! Working out which participant id belongs to the signed-in user.
//!
//! The session token is not always decodable and the profile endpoint is not
//! always reachable, so resolution is a chain of strategies tried in order.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;

use crate::api::client::ChatBackend;
use crate::api::models::{Conversation, is_unset_user_id};
use crate::error::{Error, Result};

const CLAIM_KEYS: [&str; 4] = ["sub", "userId", "user_id", "id"];

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// `Ok(None)` means this strategy has no opinion; the next one is tried.
    async fn resolve_local_user_id(&self) -> Result<Option<String>>;

    fn name(&self) -> &'static str;
}

/// Reads the user id out of a JWT's claims without verifying it.
pub struct TokenClaims {
    token: String,
}

impl TokenClaims {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }

    pub fn user_id(&self) -> Result<Option<String>> {
        let token = self.token.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        let payload = token
            .split('.')
            .nth(1)
            .ok_or_else(|| Error::InvalidToken("expected three dot-separated segments".into()))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| Error::InvalidToken(e.to_string()))?;
        let claims: Value =
            serde_json::from_slice(&bytes).map_err(|e| Error::InvalidToken(e.to_string()))?;

        for key in CLAIM_KEYS {
            match claims.get(key) {
                Some(Value::String(id)) if !is_unset_user_id(id) => return Ok(Some(id.clone())),
                Some(Value::Number(n)) => return Ok(Some(n.to_string())),
                _ => {}
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl IdentityResolver for TokenClaims {
    async fn resolve_local_user_id(&self) -> Result<Option<String>> {
        self.user_id()
    }

    fn name(&self) -> &'static str {
        "token-claims"
    }
}

pub struct ProfileLookup {
    backend: Arc<dyn ChatBackend>,
}

impl ProfileLookup {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl IdentityResolver for ProfileLookup {
    async fn resolve_local_user_id(&self) -> Result<Option<String>> {
        let profile = self.backend.profile().await?;
        Ok(Some(profile.id).filter(|id| !is_unset_user_id(id)))
    }

    fn name(&self) -> &'static str {
        "profile"
    }
}

/// Last resort: the signed-in user is in every one of their conversations,
/// so the most frequent participant is very likely them.
pub struct ConversationFrequency {
    backend: Arc<dyn ChatBackend>,
}

impl ConversationFrequency {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl IdentityResolver for ConversationFrequency {
    async fn resolve_local_user_id(&self) -> Result<Option<String>> {
        let conversations = self.backend.conversations().await?;
        Ok(dominant_participant(&conversations))
    }

    fn name(&self) -> &'static str {
        "conversation-frequency"
    }
}

pub struct FixedIdentity(pub String);

#[async_trait]
impl IdentityResolver for FixedIdentity {
    async fn resolve_local_user_id(&self) -> Result<Option<String>> {
        Ok(Some(self.0.clone()))
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

#[derive(Default)]
pub struct IdentityChain {
    strategies: Vec<Box<dyn IdentityResolver>>,
}

impl IdentityChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, strategy: impl IdentityResolver + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }
}

#[async_trait]
impl IdentityResolver for IdentityChain {
    async fn resolve_local_user_id(&self) -> Result<Option<String>> {
        for strategy in &self.strategies {
            match strategy.resolve_local_user_id().await {
                Ok(Some(id)) => {
                    log::debug!("local user {id} resolved via {}", strategy.name());
                    return Ok(Some(id));
                }
                Ok(None) => {}
                Err(e) => log::warn!("identity strategy {} failed: {e}", strategy.name()),
            }
        }
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}

/// Most frequent non-sentinel participant across `conversations`; ties go
/// to whichever id was seen first.
pub fn dominant_participant(conversations: &[Conversation]) -> Option<String> {
    let mut order: Vec<&str> = Vec::new();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for conv in conversations {
        for id in conv.participants() {
            if is_unset_user_id(id) {
                continue;
            }
            let count = counts.entry(id).or_insert_with(|| {
                order.push(id);
                0
            });
            *count += 1;
        }
    }

    let mut best: Option<(&str, usize)> = None;
    for id in order {
        let n = counts[id];
        if best.is_none_or(|(_, top)| n > top) {
            best = Some((id, n));
        }
    }
    best.map(|(id, _)| id.to_string())
}
