use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Participant id some producers emit when a slot was never filled in.
pub const NIL_USER_ID: &str = "00000000-0000-0000-0000-000000000000";

pub fn is_unset_user_id(id: &str) -> bool {
    let id = id.trim();
    id.is_empty() || id == "0" || id == NIL_USER_ID
}

/// Server ids arrive as strings from some endpoints and as integers from others.
mod flex_id {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    impl From<Raw> for String {
        fn from(raw: Raw) -> Self {
            match raw {
                Raw::Text(s) => s,
                Raw::Number(n) => n.to_string(),
            }
        }
    }

    pub fn required<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Raw::deserialize(d).map(String::from)
    }

    pub fn optional<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(Option::<Raw>::deserialize(d)?.map(String::from))
    }

    pub fn or_empty<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(optional(d)?.unwrap_or_default())
    }
}

/// Identity of a chat entry. Optimistic entries carry a locally generated
/// id until the server echo replaces them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Confirmed(String),
    Pending(Uuid),
}

impl MessageId {
    pub fn pending() -> Self {
        Self::Pending(Uuid::new_v4())
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Confirmed(id) => f.write_str(id),
            Self::Pending(local) => write!(f, "local-{local}"),
        }
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        flex_id::required(deserializer).map(Self::Confirmed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    #[serde(alias = "sender_id", deserialize_with = "flex_id::required")]
    pub sender_id: String,
    #[serde(
        default,
        alias = "receiver_id",
        alias = "recipientId",
        deserialize_with = "flex_id::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub receiver_id: Option<String>,
    #[serde(alias = "text")]
    pub content: String,
    #[serde(alias = "created_at")]
    pub created_at: DateTime<Utc>,
    #[serde(
        default,
        alias = "conversation_id",
        deserialize_with = "flex_id::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub conversation_id: Option<String>,
}

impl Message {
    /// Builds the optimistic entry shown before the server confirms a send.
    pub fn pending(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        content: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::pending(),
            sender_id: sender_id.into(),
            receiver_id: Some(receiver_id.into()),
            content: content.into(),
            created_at: Utc::now(),
            conversation_id: Some(conversation_id.into()),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.id.is_pending()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(deserialize_with = "flex_id::required")]
    pub id: String,
    #[serde(
        default,
        alias = "user1Id",
        alias = "participant1_id",
        alias = "user1_id",
        deserialize_with = "flex_id::or_empty"
    )]
    pub participant1_id: String,
    #[serde(
        default,
        alias = "user2Id",
        alias = "participant2_id",
        alias = "user2_id",
        deserialize_with = "flex_id::or_empty"
    )]
    pub participant2_id: String,
    #[serde(
        default,
        alias = "otherUserId",
        alias = "other_user_id",
        deserialize_with = "flex_id::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub counterpart_id: Option<String>,
    #[serde(alias = "created_at")]
    pub created_at: DateTime<Utc>,
    #[serde(default, alias = "last_message", skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
}

impl Conversation {
    pub fn participants(&self) -> [&str; 2] {
        [&self.participant1_id, &self.participant2_id]
    }

    /// Order-independent key, so (a, b) and (b, a) collapse to one conversation.
    pub fn pair_key(&self) -> (String, String) {
        let (a, b) = (&self.participant1_id, &self.participant2_id);
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants().contains(&user_id)
    }

    /// True when `a` and `b` are exactly this conversation's two participants.
    pub fn involves_pair(&self, a: &str, b: &str) -> bool {
        (self.participant1_id == a && self.participant2_id == b)
            || (self.participant1_id == b && self.participant2_id == a)
    }

    /// The peer to address when `local_user_id` sends into this conversation.
    pub fn counterpart_for(&self, local_user_id: Option<&str>) -> Option<&str> {
        if let Some(id) = self.counterpart_id.as_deref().filter(|id| !is_unset_user_id(id)) {
            return Some(id);
        }
        self.participants()
            .into_iter()
            .find(|id| !is_unset_user_id(id) && Some(*id) != local_user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(alias = "userId", alias = "user_id", deserialize_with = "flex_id::required")]
    pub id: String,
    #[serde(default, alias = "name")]
    pub username: Option<String>,
}

/// Chat frame written to the realtime connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundChat {
    #[serde(rename = "recipientId")]
    pub recipient_id: String,
    pub content: String,
}
