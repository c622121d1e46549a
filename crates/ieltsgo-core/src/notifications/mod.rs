//! Notifications: realtime stream, REST API, and local state

pub mod api;
pub mod backoff;
pub mod connection;
pub mod hub;
pub mod inbox;
pub mod poller;
pub mod sse;
pub mod types;

pub use api::NotificationsApi;
pub use backoff::ReconnectPolicy;
pub use connection::{ByteStream, HttpTransport, StreamTransport};
pub use hub::{ConnectionState, ErrorListener, Listener, NotificationHub, Subscription};
pub use inbox::NotificationInbox;
pub use poller::{UnreadCountPoller, UnreadCountSource};
pub use sse::{decode_event, parse_frame, FrameParser, ParsedFrame};
pub use types::{
    MessageText, Notification, NotificationAction, NotificationCategory, NotificationPage,
    NotificationPreferences, Pagination, StreamEvent, UpdatePreferences,
};
