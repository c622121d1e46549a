//! Plain-text rendering of notifications and preferences

use chrono::Local;
use ieltsgo_core::notifications::{
    MessageText, Notification, NotificationAction, NotificationPage, NotificationPreferences,
};

/// Translation keys are shown bracketed since there is no locale table here
fn text(message: MessageText<'_>) -> String {
    match message {
        MessageText::Literal(s) => s.to_string(),
        MessageText::TranslationKey(key) => format!("[{}]", key),
    }
}

fn action_hint(action: &NotificationAction) -> String {
    match action {
        NotificationAction::NavigateToCourse { course_id } => format!("course {}", course_id),
        NotificationAction::NavigateToLesson {
            course_id: Some(course_id),
            lesson_id,
        } => format!("lesson {} in course {}", lesson_id, course_id),
        NotificationAction::NavigateToLesson {
            course_id: None,
            lesson_id,
        } => format!("lesson {}", lesson_id),
        NotificationAction::ExternalLink { url } => url.clone(),
        NotificationAction::NavigateToUserProfile { user_id } => format!("profile {}", user_id),
        NotificationAction::Other { kind } => kind.clone(),
    }
}

pub fn notification_line(notification: &Notification) -> String {
    let marker = if notification.is_read { ' ' } else { '*' };
    let when = notification
        .created_at
        .map(|at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".repeat(16));

    let mut line = format!(
        "{} {}  {}  {}",
        marker,
        when,
        notification.id,
        text(notification.title_text())
    );
    let message = text(notification.message_text());
    if !message.is_empty() {
        line.push_str(" - ");
        line.push_str(&message);
    }
    if let Some(action) = notification.action() {
        line.push_str(&format!("  -> {}", action_hint(&action)));
    }
    line
}

pub fn page(page: &NotificationPage) -> String {
    if page.notifications.is_empty() {
        return "No notifications".to_string();
    }
    let mut out: Vec<String> = page.notifications.iter().map(notification_line).collect();
    out.push(format!(
        "page {}/{} ({} total)",
        page.pagination.page, page.pagination.total_pages, page.pagination.total
    ));
    out.join("\n")
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

pub fn preferences(prefs: &NotificationPreferences) -> String {
    let quiet = if prefs.quiet_hours_enabled {
        format!(
            "{} - {}",
            prefs.quiet_hours_start.as_deref().unwrap_or("?"),
            prefs.quiet_hours_end.as_deref().unwrap_or("?")
        )
    } else {
        "off".to_string()
    };
    [
        format!("push_enabled            {}", on_off(prefs.push_enabled)),
        format!("push_achievements       {}", on_off(prefs.push_achievements)),
        format!("push_reminders          {}", on_off(prefs.push_reminders)),
        format!("push_course_updates     {}", on_off(prefs.push_course_updates)),
        format!("push_exercise_graded    {}", on_off(prefs.push_exercise_graded)),
        format!("email_enabled           {}", on_off(prefs.email_enabled)),
        format!("email_weekly_report     {}", on_off(prefs.email_weekly_report)),
        format!("email_course_updates    {}", on_off(prefs.email_course_updates)),
        format!("email_marketing         {}", on_off(prefs.email_marketing)),
        format!("in_app_enabled          {}", on_off(prefs.in_app_enabled)),
        format!("quiet_hours             {}", quiet),
        format!("max_notifications_per_day {}", prefs.max_notifications_per_day),
        format!("timezone                {}", prefs.timezone),
    ]
    .join("\n")
}
