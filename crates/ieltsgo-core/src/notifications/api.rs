//! REST notification API
//!
//! Plain request/response calls used alongside the realtime stream: the
//! server's notification list is the source of truth the UI reconciles with.

use std::sync::Arc;

use moka::sync::Cache;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::types::{
    NotificationPage, NotificationPreferences, UnreadCount, UpdatePreferences,
};
use crate::auth::TokenSource;
use crate::config::ClientConfig;
use crate::error::ApiError;

/// Responses arrive either bare or wrapped as `{"success": true, "data": ...}`
#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Envelope::Wrapped { data } => data,
            Envelope::Bare(inner) => inner,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MarkAllResult {
    #[serde(default)]
    marked_count: u64,
}

/// Pages are cached per credential so a token switch never serves the
/// previous account's notifications
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ListKey {
    token: String,
    page: u32,
    limit: u32,
    is_read: Option<bool>,
}

/// Client for `/notifications`
pub struct NotificationsApi {
    client: reqwest::Client,
    config: ClientConfig,
    tokens: Arc<dyn TokenSource>,
    list_cache: Cache<ListKey, NotificationPage>,
}

impl NotificationsApi {
    pub fn new(config: ClientConfig, tokens: Arc<dyn TokenSource>) -> Self {
        Self::with_client(reqwest::Client::new(), config, tokens)
    }

    pub fn with_client(
        client: reqwest::Client,
        config: ClientConfig,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        let list_cache = Cache::builder()
            .max_capacity(64)
            .time_to_live(config.list_cache_ttl())
            .build();
        Self {
            client,
            config,
            tokens,
            list_cache,
        }
    }

    /// One page of notifications, optionally filtered by read state
    pub async fn list(
        &self,
        page: u32,
        limit: u32,
        is_read: Option<bool>,
    ) -> Result<NotificationPage, ApiError> {
        let key = self.list_key(page, limit, is_read)?;
        if let Some(cached) = self.list_cache.get(&key) {
            debug!("Notification list page {} served from cache", page);
            return Ok(cached);
        }

        let mut query = vec![("page", page.to_string()), ("limit", limit.to_string())];
        if let Some(is_read) = is_read {
            query.push(("is_read", is_read.to_string()));
        }
        let request = self
            .authorized(Method::GET, &["notifications"], &key.token)?
            .query(&query);
        let result: NotificationPage = self.fetch(request).await?;

        self.list_cache.insert(key, result.clone());
        Ok(result)
    }

    pub async fn unread_count(&self) -> Result<u64, ApiError> {
        let request = self.request(Method::GET, &["notifications", "unread-count"])?;
        let count: UnreadCount = self.fetch(request).await?;
        Ok(count.unread_count)
    }

    pub async fn mark_as_read(&self, id: &str) -> Result<(), ApiError> {
        let request = self.request(Method::PUT, &["notifications", id_segment(id)?, "read"])?;
        self.send(request).await?;
        self.list_cache.invalidate_all();
        Ok(())
    }

    /// Returns how many notifications the server marked
    pub async fn mark_all_as_read(&self) -> Result<u64, ApiError> {
        let request = self.request(Method::PUT, &["notifications", "mark-all-read"])?;
        let response = self.send(request).await?;
        self.list_cache.invalidate_all();
        let body = response.text().await?;
        // Older servers answer with an empty body
        if body.trim().is_empty() {
            return Ok(0);
        }
        let result: MarkAllResult = decode(&body)?;
        Ok(result.marked_count)
    }

    pub async fn delete(&self, id: &str) -> Result<(), ApiError> {
        let request = self.request(Method::DELETE, &["notifications", id_segment(id)?])?;
        self.send(request).await?;
        self.list_cache.invalidate_all();
        Ok(())
    }

    pub async fn preferences(&self) -> Result<NotificationPreferences, ApiError> {
        let request = self.request(Method::GET, &["notifications", "preferences"])?;
        self.fetch(request).await
    }

    pub async fn update_preferences(
        &self,
        update: &UpdatePreferences,
    ) -> Result<NotificationPreferences, ApiError> {
        let request = self
            .request(Method::PUT, &["notifications", "preferences"])?
            .json(update);
        self.fetch(request).await
    }

    /// Drop cached list pages (e.g. after the stream delivered something new)
    pub fn invalidate_cache(&self) {
        self.list_cache.invalidate_all();
    }

    fn token(&self) -> Result<String, ApiError> {
        self.tokens.token().ok_or(ApiError::MissingToken)
    }

    fn list_key(&self, page: u32, limit: u32, is_read: Option<bool>) -> Result<ListKey, ApiError> {
        Ok(ListKey {
            token: self.token()?,
            page,
            limit,
            is_read,
        })
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, ApiError> {
        let token = self.token()?;
        self.authorized(method, segments, &token)
    }

    fn authorized(
        &self,
        method: Method,
        segments: &[&str],
        token: &str,
    ) -> Result<RequestBuilder, ApiError> {
        let url = self.config.endpoint_segments(segments)?;
        Ok(self.client.request(method, url).bearer_auth(token))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let response = request.send().await?;
        handle_error_response(response).await
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = self.send(request).await?;
        let body = response.text().await?;
        decode(&body)
    }
}

/// Ids are opaque, but must form exactly one path segment
fn id_segment(id: &str) -> Result<&str, ApiError> {
    let trimmed = id.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return Err(ApiError::InvalidId(id.to_string()));
    }
    Ok(trimmed)
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, ApiError> {
    let envelope: Envelope<T> = serde_json::from_str(body)?;
    Ok(envelope.into_inner())
}

async fn handle_error_response(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
    Err(ApiError::Status {
        status: status.as_u16(),
        message,
    })
}

/// Pull a readable message out of the service's error shapes:
/// `{"error": "...", "message": "..."}` or `{"error": {"code", "message"}}`
fn error_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    let Ok(json) = serde_json::from_str::<Value>(trimmed) else {
        return Some(trimmed.to_string());
    };
    json.get("message")
        .and_then(Value::as_str)
        .or_else(|| json.get("error").and_then(|e| e.get("message")).and_then(Value::as_str))
        .or_else(|| json.get("error").and_then(Value::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryTokenSource;

    #[test]
    fn test_decode_bare_and_wrapped() {
        let bare: UnreadCount = decode(r#"{"unread_count": 4}"#).unwrap();
        assert_eq!(bare.unread_count, 4);

        let page: NotificationPage = decode(
            r#"{"success": true, "data": {
                "notifications": [{"id": "a"}, {"id": "b", "is_read": true}],
                "pagination": {"page": 1, "limit": 20, "total": 2, "total_pages": 1}
            }}"#,
        )
        .unwrap();
        assert_eq!(page.notifications.len(), 2);
        assert_eq!(page.pagination.total_pages, 1);
    }

    #[test]
    fn test_decode_mark_all_result() {
        let result: MarkAllResult =
            decode(r#"{"message": "Marked 3 notifications as read", "data": {"marked_count": 3}}"#)
                .unwrap();
        assert_eq!(result.marked_count, 3);
    }

    #[test]
    fn test_decode_garbage_is_error() {
        let result: Result<UnreadCount, _> = decode("<html>");
        assert!(matches!(result, Err(ApiError::Decode(_))));
    }

    #[test]
    fn test_error_message_shapes() {
        assert_eq!(
            error_message(r#"{"error":"not_found","message":"Notification not found"}"#),
            Some("Notification not found".to_string())
        );
        assert_eq!(
            error_message(r#"{"success":false,"error":{"code":"X","message":"nope"}}"#),
            Some("nope".to_string())
        );
        assert_eq!(
            error_message(r#"{"error":"unauthorized"}"#),
            Some("unauthorized".to_string())
        );
        assert_eq!(error_message("gateway timeout"), Some("gateway timeout".to_string()));
        assert_eq!(error_message("  "), None);
    }

    #[tokio::test]
    async fn test_missing_token_skips_network() {
        let api = NotificationsApi::new(
            ClientConfig::default(),
            Arc::new(MemoryTokenSource::default()),
        );
        assert!(matches!(api.unread_count().await, Err(ApiError::MissingToken)));
        assert!(matches!(api.mark_as_read("x").await, Err(ApiError::MissingToken)));
    }

    #[tokio::test]
    async fn test_dot_ids_rejected_before_sending() {
        let api = NotificationsApi::new(
            ClientConfig::default(),
            Arc::new(MemoryTokenSource::new(Some("tok".to_string()))),
        );
        assert!(matches!(api.mark_as_read("..").await, Err(ApiError::InvalidId(_))));
        assert!(matches!(api.delete(" ").await, Err(ApiError::InvalidId(_))));
        assert_eq!(id_segment("../preferences").unwrap(), "../preferences");
    }

    #[tokio::test]
    async fn test_list_cache_is_per_token() {
        let tokens = Arc::new(MemoryTokenSource::new(Some("alice".to_string())));
        let api = NotificationsApi::new(ClientConfig::default(), tokens.clone());
        let page: NotificationPage = decode(
            r#"{"notifications": [{"id": "a1"}],
                "pagination": {"page": 1, "limit": 20, "total": 1, "total_pages": 1}}"#,
        )
        .unwrap();
        api.list_cache
            .insert(api.list_key(1, 20, None).unwrap(), page.clone());

        // Served from cache, no request made
        assert_eq!(api.list(1, 20, None).await.unwrap(), page);

        tokens.set("bob");
        assert!(api.list_cache.get(&api.list_key(1, 20, None).unwrap()).is_none());
    }

    #[test]
    fn test_unauthorized_helper() {
        let err = ApiError::Status {
            status: 401,
            message: "expired".to_string(),
        };
        assert!(err.is_unauthorized());
        assert!(!ApiError::MissingToken.is_unauthorized());
    }
}
