//! Unread-count polling
//!
//! Fallback for when the stream is down: the badge count is refreshed from
//! the REST API on a fixed interval, and on demand after stream activity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::api::NotificationsApi;
use crate::error::ApiError;

/// Anything that can report the unread count
#[async_trait]
pub trait UnreadCountSource: Send + Sync {
    async fn unread_count(&self) -> Result<u64, ApiError>;
}

#[async_trait]
impl UnreadCountSource for NotificationsApi {
    async fn unread_count(&self) -> Result<u64, ApiError> {
        NotificationsApi::unread_count(self).await
    }
}

pub struct UnreadCountPoller {
    count: watch::Receiver<Option<u64>>,
    refresh: Arc<Notify>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl UnreadCountPoller {
    /// Start polling on the current runtime
    ///
    /// The first fetch happens immediately. The task stops when `cancel`
    /// fires or the poller is dropped.
    pub fn spawn(
        source: Arc<dyn UnreadCountSource>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = watch::channel(None);
        let refresh = Arc::new(Notify::new());
        let task = tokio::spawn(poll_loop(
            source,
            interval,
            tx,
            refresh.clone(),
            cancel.clone(),
        ));
        Self {
            count: rx,
            refresh,
            cancel,
            task,
        }
    }

    /// Latest known count, `None` until the first successful fetch
    pub fn current(&self) -> Option<u64> {
        *self.count.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<u64>> {
        self.count.clone()
    }

    /// Fetch now instead of waiting for the next tick
    pub fn refresh(&self) {
        self.refresh.notify_one();
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for UnreadCountPoller {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

async fn poll_loop(
    source: Arc<dyn UnreadCountSource>,
    interval: Duration,
    tx: watch::Sender<Option<u64>>,
    refresh: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = refresh.notified() => ticker.reset(),
        }

        match source.unread_count().await {
            Ok(count) => {
                debug!("Unread notifications: {}", count);
                tx.send_replace(Some(count));
            }
            // Keep the last good value
            Err(e) => warn!("Failed to fetch unread count: {}", e),
        }
    }
    debug!("Unread count poller stopped");
}
