//! The session's visible set of notifications
//!
//! Newest first, unique by id. Stream deliveries never flip a read
//! notification back to unread; only a re-fetch from the server may.

use chrono::Utc;

use super::types::Notification;

#[derive(Debug, Default, Clone)]
pub struct NotificationInbox {
    items: Vec<Notification>,
}

impl NotificationInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update from the realtime stream
    ///
    /// Returns `true` when the notification was not already present.
    pub fn upsert(&mut self, mut notification: Notification) -> bool {
        match self.position(&notification.id) {
            Some(index) => {
                let existing = self.items.remove(index);
                if existing.is_read {
                    notification.is_read = true;
                    notification.read_at = notification.read_at.or(existing.read_at);
                }
                self.items.insert(0, notification);
                false
            }
            None => {
                self.items.insert(0, notification);
                true
            }
        }
    }

    /// Replace everything with a fresh page from the server (source of truth)
    pub fn replace_all(&mut self, notifications: Vec<Notification>) {
        self.items.clear();
        for notification in notifications {
            if self.position(&notification.id).is_none() {
                self.items.push(notification);
            }
        }
    }

    /// Returns `false` if the id is unknown
    pub fn mark_read(&mut self, id: &str) -> bool {
        match self.items.iter_mut().find(|n| n.id == id) {
            Some(notification) => {
                if !notification.is_read {
                    notification.is_read = true;
                    notification.read_at = Some(Utc::now());
                }
                true
            }
            None => false,
        }
    }

    /// Returns how many changed state
    pub fn mark_all_read(&mut self) -> usize {
        let now = Utc::now();
        let mut marked = 0;
        for notification in self.items.iter_mut().filter(|n| !n.is_read) {
            notification.is_read = true;
            notification.read_at = Some(now);
            marked += 1;
        }
        marked
    }

    pub fn remove(&mut self, id: &str) -> Option<Notification> {
        self.position(id).map(|index| self.items.remove(index))
    }

    pub fn get(&self, id: &str) -> Option<&Notification> {
        self.items.iter().find(|n| n.id == id)
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|n| !n.is_read).count()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Notification> {
        self.items.iter()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|n| n.id == id)
    }
}
