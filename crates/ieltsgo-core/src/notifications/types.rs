//! Notification data model
//!
//! Shapes follow the notification service's JSON (snake_case), with the
//! camelCase aliases older clients used.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix marking a title/message as a translation key rather than text
pub const TRANSLATION_KEY_PREFIX: &str = "notifications.";

/// Visual category of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationCategory {
    Info,
    Success,
    Warning,
    Alert,
    #[serde(other)]
    Other,
}

/// A notification delivered over the stream or fetched over REST
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    #[serde(default, alias = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// achievement, reminder, course_update, exercise_graded, system, social
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<NotificationCategory>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "isRead", alias = "read")]
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, alias = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "readAt", skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn title_text(&self) -> MessageText<'_> {
        MessageText::classify(&self.title)
    }

    pub fn message_text(&self) -> MessageText<'_> {
        MessageText::classify(&self.message)
    }

    /// Client-side routing target, if the notification carries one
    pub fn action(&self) -> Option<NotificationAction> {
        let kind = self.action_type.as_deref().filter(|k| !k.is_empty())?;
        let field = |name: &str| -> Option<String> {
            self.action_data
                .as_ref()?
                .get(name)?
                .as_str()
                .map(str::to_string)
        };

        let action = match kind {
            "navigate_to_course" => field("course_id")
                .map(|course_id| NotificationAction::NavigateToCourse { course_id }),
            "navigate_to_lesson" => {
                field("lesson_id").map(|lesson_id| NotificationAction::NavigateToLesson {
                    course_id: field("course_id"),
                    lesson_id,
                })
            }
            "external_link" => field("url").map(|url| NotificationAction::ExternalLink { url }),
            "navigate_to_user_profile" => field("user_id")
                .map(|user_id| NotificationAction::NavigateToUserProfile { user_id }),
            _ => None,
        };

        Some(action.unwrap_or_else(|| NotificationAction::Other {
            kind: kind.to_string(),
        }))
    }
}

/// Title or message content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageText<'a> {
    Literal(&'a str),
    /// Looked up in the client's translation tables
    TranslationKey(&'a str),
}

impl<'a> MessageText<'a> {
    pub fn classify(text: &'a str) -> Self {
        if text.starts_with(TRANSLATION_KEY_PREFIX) {
            MessageText::TranslationKey(text)
        } else {
            MessageText::Literal(text)
        }
    }

    pub fn as_str(&self) -> &'a str {
        match self {
            MessageText::Literal(s) | MessageText::TranslationKey(s) => s,
        }
    }
}

/// Where a notification should take the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationAction {
    NavigateToCourse {
        course_id: String,
    },
    NavigateToLesson {
        course_id: Option<String>,
        lesson_id: String,
    },
    ExternalLink {
        url: String,
    },
    NavigateToUserProfile {
        user_id: String,
    },
    /// Unknown kind, or a known kind missing its target
    Other {
        kind: String,
    },
}

/// A decoded frame from the notification stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Notification(Notification),
    /// Sent once by the server after the stream opens
    Connected {
        message: Option<String>,
        user_id: Option<String>,
    },
    Heartbeat {
        timestamp: Option<i64>,
    },
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Notification(_) => "notification",
            StreamEvent::Connected { .. } => "connected",
            StreamEvent::Heartbeat { .. } => "heartbeat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    #[serde(alias = "total_items")]
    pub total: u64,
    pub total_pages: u32,
}

/// One page of `GET /notifications`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPage {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub notifications: Vec<Notification>,
    pub pagination: Pagination,
}

// Go marshals an empty slice as null
fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<Notification>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<Notification>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct UnreadCount {
    #[serde(default)]
    pub unread_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub push_enabled: bool,
    pub push_achievements: bool,
    pub push_reminders: bool,
    pub push_course_updates: bool,
    pub push_exercise_graded: bool,
    pub email_enabled: bool,
    pub email_weekly_report: bool,
    pub email_course_updates: bool,
    pub email_marketing: bool,
    pub in_app_enabled: bool,
    pub quiet_hours_enabled: bool,
    /// "22:00:00"
    #[serde(default)]
    pub quiet_hours_start: Option<String>,
    #[serde(default)]
    pub quiet_hours_end: Option<String>,
    pub max_notifications_per_day: u32,
    pub timezone: String,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Partial update of notification preferences; unset fields are left alone
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePreferences {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_achievements: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_reminders: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_course_updates: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_exercise_graded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_weekly_report: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_course_updates: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_marketing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_app_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quiet_hours_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quiet_hours_start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quiet_hours_end: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_notifications_per_day: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl UpdatePreferences {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
