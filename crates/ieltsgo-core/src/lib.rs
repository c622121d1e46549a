//! Core library for the IELTSGo client
//!
//! - Realtime notification stream with reconnect/backoff and a shared connection hub
//! - REST notification API with an unread-count fallback poller
//! - Credential storage and client configuration

pub mod auth;
pub mod config;
pub mod error;
pub mod notifications;

pub use auth::{FileTokenStore, MemoryTokenSource, TokenSource};
pub use config::{ClientConfig, StreamSettings};
pub use error::{ApiError, ConfigError, StreamError};
pub use notifications::{
    ConnectionState, Notification, NotificationHub, NotificationInbox, NotificationsApi,
    StreamEvent, Subscription,
};
