//! Subcommand implementations

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use ieltsgo_core::auth::StoredTokens;
use ieltsgo_core::notifications::{UnreadCountPoller, UpdatePreferences};
use ieltsgo_core::{
    ApiError, ClientConfig, FileTokenStore, Notification, NotificationHub, NotificationInbox,
    NotificationsApi, StreamError, TokenSource,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::output;

/// Size of the first page loaded before streaming starts
const WATCH_BACKLOG: u32 = 20;

fn token_store() -> Arc<FileTokenStore> {
    Arc::new(FileTokenStore::load(FileTokenStore::default_path()))
}

/// API client backed by the stored credentials; fails early when logged out
fn api(config: &ClientConfig) -> Result<Arc<NotificationsApi>> {
    let tokens = token_store();
    if tokens.token().is_none() {
        bail!("Not logged in. Run `ieltsgo login` first.");
    }
    Ok(Arc::new(NotificationsApi::new(config.clone(), tokens)))
}

fn explain(err: ApiError) -> anyhow::Error {
    if err.is_unauthorized() {
        anyhow::Error::new(err).context("Token rejected. Run `ieltsgo login` again.")
    } else {
        anyhow::Error::new(err)
    }
}

pub fn login(
    token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
) -> Result<()> {
    let token = match token {
        Some(token) => token,
        None => {
            eprint!("Access token: ");
            let mut line = String::new();
            std::io::stdin()
                .read_line(&mut line)
                .context("Failed to read token from stdin")?;
            line
        }
    };
    let token = token.trim();
    if token.is_empty() {
        bail!("Access token is empty");
    }

    let mut tokens = StoredTokens::new(token);
    tokens.refresh_token = refresh_token;
    tokens.expires_at = match expires_in {
        Some(secs) => Some(
            ChronoDuration::try_seconds(secs)
                .and_then(|ttl| Utc::now().checked_add_signed(ttl))
                .context("--expires-in is out of range")?,
        ),
        None => None,
    };

    let store = token_store();
    store.save(tokens)?;
    println!("Saved credentials to {}", store.path().display());
    Ok(())
}

pub fn logout() -> Result<()> {
    token_store().clear()?;
    println!("Logged out");
    Ok(())
}

pub async fn list(
    config: &ClientConfig,
    page: u32,
    limit: u32,
    is_read: Option<bool>,
    json: bool,
) -> Result<()> {
    let result = api(config)?
        .list(page, limit, is_read)
        .await
        .map_err(explain)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", output::page(&result));
    }
    Ok(())
}

pub async fn unread(config: &ClientConfig) -> Result<()> {
    let count = api(config)?.unread_count().await.map_err(explain)?;
    println!("{}", count);
    Ok(())
}

pub async fn read(config: &ClientConfig, id: &str) -> Result<()> {
    api(config)?.mark_as_read(id).await.map_err(explain)?;
    println!("Marked {} as read", id);
    Ok(())
}

pub async fn read_all(config: &ClientConfig) -> Result<()> {
    let marked = api(config)?.mark_all_as_read().await.map_err(explain)?;
    println!("Marked {} notifications as read", marked);
    Ok(())
}

pub async fn delete(config: &ClientConfig, id: &str) -> Result<()> {
    api(config)?.delete(id).await.map_err(explain)?;
    println!("Deleted {}", id);
    Ok(())
}

pub async fn prefs_show(config: &ClientConfig) -> Result<()> {
    let prefs = api(config)?.preferences().await.map_err(explain)?;
    println!("{}", output::preferences(&prefs));
    Ok(())
}

pub async fn prefs_set(config: &ClientConfig, updates: &[String]) -> Result<()> {
    let update = parse_preference_updates(updates)?;
    let prefs = api(config)?
        .update_preferences(&update)
        .await
        .map_err(explain)?;
    println!("{}", output::preferences(&prefs));
    Ok(())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => bail!("{} expects true/false, got '{}'", key, value),
    }
}

/// `KEY=VALUE` pairs into a partial preferences update
fn parse_preference_updates(pairs: &[String]) -> Result<UpdatePreferences> {
    let mut update = UpdatePreferences::default();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Expected KEY=VALUE, got '{}'", pair))?;
        let (key, value) = (key.trim(), value.trim());
        match key {
            "push_enabled" => update.push_enabled = Some(parse_bool(key, value)?),
            "push_achievements" => update.push_achievements = Some(parse_bool(key, value)?),
            "push_reminders" => update.push_reminders = Some(parse_bool(key, value)?),
            "push_course_updates" => update.push_course_updates = Some(parse_bool(key, value)?),
            "push_exercise_graded" => {
                update.push_exercise_graded = Some(parse_bool(key, value)?)
            }
            "email_enabled" => update.email_enabled = Some(parse_bool(key, value)?),
            "email_weekly_report" => update.email_weekly_report = Some(parse_bool(key, value)?),
            "email_course_updates" => {
                update.email_course_updates = Some(parse_bool(key, value)?)
            }
            "email_marketing" => update.email_marketing = Some(parse_bool(key, value)?),
            "in_app_enabled" => update.in_app_enabled = Some(parse_bool(key, value)?),
            "quiet_hours_enabled" => update.quiet_hours_enabled = Some(parse_bool(key, value)?),
            "quiet_hours_start" => update.quiet_hours_start = Some(value.to_string()),
            "quiet_hours_end" => update.quiet_hours_end = Some(value.to_string()),
            "max_notifications_per_day" => {
                let max = value
                    .parse()
                    .with_context(|| format!("{} expects a number, got '{}'", key, value))?;
                update.max_notifications_per_day = Some(max);
            }
            "timezone" => update.timezone = Some(value.to_string()),
            _ => bail!("Unknown preference '{}'", key),
        }
    }
    if update.is_empty() {
        bail!("Nothing to update");
    }
    Ok(update)
}

enum WatchEvent {
    Notification(Notification),
    Failed(StreamError),
}

/// Stream notifications until Ctrl-C
pub async fn watch(config: &ClientConfig, json: bool) -> Result<()> {
    let tokens = token_store();
    if tokens.token().is_none() {
        bail!("Not logged in. Run `ieltsgo login` first.");
    }
    let api = Arc::new(NotificationsApi::new(config.clone(), tokens.clone()));
    let hub = NotificationHub::from_config(config, tokens)?;
    let cancel = CancellationToken::new();

    let mut inbox = NotificationInbox::new();
    match api.list(1, WATCH_BACKLOG, None).await {
        Ok(page) => inbox.replace_all(page.notifications),
        Err(e) if e.is_unauthorized() => return Err(explain(e)),
        Err(e) => warn!("Could not load recent notifications: {}", e),
    }
    if !json {
        for notification in inbox.iter().rev() {
            println!("{}", output::notification_line(notification));
        }
    }

    let poller = UnreadCountPoller::spawn(
        api.clone(),
        config.unread_poll_interval(),
        cancel.child_token(),
    );
    let mut unread = poller.subscribe();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let error_tx = tx.clone();
    let _subscription = hub.connect_with_errors(
        move |notification: &Notification| {
            let _ = tx.send(WatchEvent::Notification(notification.clone()));
        },
        move |err: &StreamError| {
            let _ = error_tx.send(WatchEvent::Failed(err.clone()));
        },
    );
    eprintln!("Watching for notifications (Ctrl-C to stop)");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            Some(event) = rx.recv() => match event {
                WatchEvent::Notification(notification) => {
                    if json {
                        println!("{}", serde_json::to_string(&notification)?);
                    } else {
                        println!("{}", output::notification_line(&notification));
                    }
                    inbox.upsert(notification);
                    api.invalidate_cache();
                    poller.refresh();
                }
                WatchEvent::Failed(StreamError::Status { status: 401, .. }) => {
                    hub.destroy();
                    cancel.cancel();
                    bail!("Token rejected by the notification stream. Run `ieltsgo login` again.");
                }
                WatchEvent::Failed(err) => {
                    eprintln!("Stream interrupted ({}), reconnecting", err);
                }
            },
            Ok(()) = unread.changed() => {
                if let Some(count) = *unread.borrow_and_update() {
                    debug!("Unread count now {}", count);
                    if !json {
                        eprintln!("{} unread", count);
                    }
                }
            }
        }
    }

    hub.destroy();
    cancel.cancel();
    eprintln!(
        "Stopped. {} notifications this session, {} unread",
        inbox.len(),
        inbox.unread_count()
    );
    Ok(())
}
