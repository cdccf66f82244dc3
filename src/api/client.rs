use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::api::models::{Conversation, Message, Profile};
use crate::error::{Error, Result};

/// The REST resources the realtime layer leans on. Kept behind a trait so
/// the sync logic can run against an in-memory double.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn conversations(&self) -> Result<Vec<Conversation>>;
    async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>>;
    async fn profile(&self) -> Result<Profile>;
    /// REST mirror of the realtime send.
    async fn send_message(&self, recipient_id: &str, content: &str) -> Result<Message>;
}

pub struct ApiClient {
    pub http: HttpClient,
    base_api: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            http: HttpClient::new(),
            base_api: Self::base_api(base_url),
            token,
        }
    }

    fn base_api(base_url: &str) -> String {
        let trimmed = base_url.trim_end_matches('/');
        if trimmed.ends_with("/api") { trimmed.to_string() } else { format!("{}/api", trimmed) }
    }

    fn with_auth(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(t) = self.token.as_deref() {
            req = req.header("Authorization", format!("Bearer {}", t));
        }
        req
    }

    async fn read_json(resp: reqwest::Response) -> Result<Value> {
        if !resp.status().is_success() {
            return Err(Error::Status(resp.status().as_u16()));
        }
        Ok(resp.json::<Value>().await?)
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let endpoint = format!("{}{}", self.base_api, path);
        let resp = self.with_auth(self.http.get(&endpoint)).send().await?;
        Self::read_json(resp).await
    }

    /// List endpoints answer with a bare array or wrap it in `data`/`items`.
    fn list_of<T: DeserializeOwned>(json: Value) -> Result<Vec<T>> {
        let items = match json {
            Value::Array(arr) => arr,
            Value::Object(mut obj) => match obj.remove("data").or_else(|| obj.remove("items")) {
                Some(Value::Array(arr)) => arr,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value(item) {
                Ok(v) => out.push(v),
                Err(e) => log::warn!("skipping malformed list item: {e}"),
            }
        }
        Ok(out)
    }

    /// Single-object endpoints sometimes wrap the record in `data`.
    fn object_of<T: DeserializeOwned>(json: Value) -> Result<T> {
        let inner = match json {
            Value::Object(mut obj) if obj.get("data").is_some_and(Value::is_object) => {
                obj.remove("data").unwrap_or_default()
            }
            other => other,
        };
        Ok(serde_json::from_value(inner)?)
    }
}

#[async_trait]
impl ChatBackend for ApiClient {
    async fn conversations(&self) -> Result<Vec<Conversation>> {
        Self::list_of(self.get_json("/conversations").await?)
    }

    async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        Self::list_of(self.get_json(&format!("/conversations/{conversation_id}/messages")).await?)
    }

    async fn profile(&self) -> Result<Profile> {
        Self::object_of(self.get_json("/users/me").await?)
    }

    async fn send_message(&self, recipient_id: &str, content: &str) -> Result<Message> {
        let endpoint = format!("{}/messages", self.base_api);
        let body = serde_json::json!({
            "recipientId": recipient_id,
            "content": content,
        });
        let resp = self.with_auth(self.http.post(&endpoint)).json(&body).send().await?;
        Self::object_of(Self::read_json(resp).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn base_api_appends_once() {
        assert_eq!(ApiClient::base_api("https://murmur.example/"), "https://murmur.example/api");
        assert_eq!(ApiClient::base_api("https://murmur.example/api"), "https://murmur.example/api");
    }

    #[test]
    fn list_accepts_bare_and_wrapped_arrays() {
        let item = json!({"id": 1, "user1Id": "a", "user2Id": "b", "createdAt": "2026-01-01T00:00:00Z"});
        let bare: Vec<Conversation> = ApiClient::list_of(json!([item.clone()])).unwrap();
        let wrapped: Vec<Conversation> = ApiClient::list_of(json!({"data": [item.clone()]})).unwrap();
        let items: Vec<Conversation> = ApiClient::list_of(json!({"items": [item]})).unwrap();
        assert_eq!(bare.len(), 1);
        assert_eq!(bare, wrapped);
        assert_eq!(bare, items);
        assert_eq!(bare[0].id, "1");
    }

    #[test]
    fn list_skips_malformed_items() {
        let out: Vec<Conversation> = ApiClient::list_of(json!([{"nope": true}])).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn object_unwraps_data() {
        let p: Profile = ApiClient::object_of(json!({"data": {"id": 5, "username": "anon"}})).unwrap();
        assert_eq!(p.id, "5");
        let p: Profile = ApiClient::object_of(json!({"userId": "u1"})).unwrap();
        assert_eq!(p.id, "u1");
    }
}
