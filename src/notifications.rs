//! Unread badge and notification history.
//!
//! [`NotificationAggregator`] listens to `new_message` and keeps:
//!
//! - a bounded list of the most recent [`Notification`]s, newest first, with
//!   no two entries sharing an id;
//! - an unread counter, observable through a `watch` channel.
//!
//! Messages sent by the signed-in user never produce a notification.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::protocol::{events, Message, NewMessagePayload};
use crate::registry::{EventRegistry, Subscription};

/// Characters kept in [`Notification::snippet`].
pub const SNIPPET_CHARS: usize = 60;

/// Summary of one inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Id of the message this notification was built from.
    pub id: String,
    pub sender_id: String,
    /// Display name, falling back to the sender id.
    pub sender_name: String,
    pub snippet: String,
    pub chat_id: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn from_message(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            sender_name: message
                .sender_name
                .clone()
                .unwrap_or_else(|| message.sender_id.clone()),
            snippet: message.snippet(SNIPPET_CHARS),
            chat_id: message.chat_id.clone(),
            created_at: message.created_at,
        }
    }
}

/// Sink for the short audio cue played on each new notification.
pub trait NotificationSound: Send + Sync + 'static {
    /// Play the cue. Errors are logged and otherwise ignored.
    fn play(&self) -> std::io::Result<()>;
}

struct State {
    user_id: Option<String>,
    subscription: Option<Subscription>,
    items: VecDeque<Notification>,
}

struct AggregatorInner {
    registry: EventRegistry,
    capacity: usize,
    state: Mutex<State>,
    unread_tx: watch::Sender<usize>,
    sound: Mutex<Option<Arc<dyn NotificationSound>>>,
}

impl AggregatorInner {
    fn ingest(&self, message: &Message) -> bool {
        {
            let mut state = self.state.lock();
            if state.user_id.as_deref() == Some(message.sender_id.as_str()) {
                return false;
            }
            if state.items.iter().any(|n| n.id == message.id) {
                debug!(id = %message.id, "duplicate message ignored");
                return false;
            }
            state.items.push_front(Notification::from_message(message));
            state.items.truncate(self.capacity);
        }

        self.unread_tx.send_modify(|unread| *unread += 1);
        debug!(id = %message.id, chat_id = %message.chat_id, "notification added");

        let sound = self.sound.lock().clone();
        if let Some(sound) = sound {
            if let Err(e) = sound.play() {
                debug!(error = %e, "notification sound failed");
            }
        }
        true
    }
}

impl Drop for AggregatorInner {
    fn drop(&mut self) {
        if let Some(subscription) = self.state.get_mut().subscription.take() {
            subscription.unsubscribe();
        }
    }
}

/// Turns inbound messages into notifications and an unread count.
#[derive(Clone)]
pub struct NotificationAggregator {
    inner: Arc<AggregatorInner>,
}

impl NotificationAggregator {
    /// Create an aggregator keeping at most `capacity` notifications
    /// (at least one).
    pub fn new(registry: EventRegistry, capacity: usize) -> Self {
        let (unread_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(AggregatorInner {
                registry,
                capacity: capacity.max(1),
                state: Mutex::new(State {
                    user_id: None,
                    subscription: None,
                    items: VecDeque::new(),
                }),
                unread_tx,
                sound: Mutex::new(None),
            }),
        }
    }

    /// Start listening for `user_id`.
    ///
    /// Calling again for the same user does nothing and returns `false`. A
    /// different user replaces the previous subscription.
    pub fn initialize(&self, user_id: &str) -> bool {
        let mut state = self.inner.state.lock();
        if state.user_id.as_deref() == Some(user_id) && state.subscription.is_some() {
            return false;
        }
        if let Some(previous) = state.subscription.take() {
            previous.unsubscribe();
        }

        let weak: Weak<AggregatorInner> = Arc::downgrade(&self.inner);
        let subscription = self.inner.registry.on_typed::<NewMessagePayload, _>(
            events::NEW_MESSAGE,
            move |payload| {
                if let Some(inner) = weak.upgrade() {
                    inner.ingest(&payload.message);
                }
            },
        );
        state.user_id = Some(user_id.to_string());
        state.subscription = Some(subscription);
        info!(user_id, "notifications initialized");
        true
    }

    /// Feed one message. Returns `true` if it produced a notification.
    pub fn ingest(&self, message: &Message) -> bool {
        self.inner.ingest(message)
    }

    /// Install the audio cue sink.
    pub fn set_sound(&self, sound: Arc<dyn NotificationSound>) {
        *self.inner.sound.lock() = Some(sound);
    }

    /// Most recent notifications, newest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.inner.state.lock().items.iter().cloned().collect()
    }

    pub fn unread_count(&self) -> usize {
        *self.inner.unread_tx.borrow()
    }

    /// Watch the unread counter.
    pub fn subscribe_unread(&self) -> watch::Receiver<usize> {
        self.inner.unread_tx.subscribe()
    }

    /// Zero the unread counter. The list is kept.
    pub fn reset_unread_count(&self) {
        self.inner.unread_tx.send_replace(0);
    }

    /// Empty the list. The unread counter is kept.
    pub fn clear_notifications(&self) {
        self.inner.state.lock().items.clear();
    }

    /// Stop listening and forget the user. History and counter are kept.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        if let Some(subscription) = state.subscription.take() {
            subscription.unsubscribe();
        }
        state.user_id = None;
    }
}

impl std::fmt::Debug for NotificationAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("NotificationAggregator")
            .field("user_id", &state.user_id)
            .field("items", &state.items.len())
            .field("unread", &*self.inner.unread_tx.borrow())
            .finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::protocol::Attachment;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn inbound(id: &str, sender: &str) -> Message {
        Message {
            id: id.into(),
            chat_id: "chat-1".into(),
            sender_id: sender.into(),
            sender_name: None,
            content: format!("hello from {sender}"),
            attachments: Vec::new(),
            created_at: Utc::now(),
            status: Default::default(),
        }
    }

    fn aggregator() -> NotificationAggregator {
        let agg = NotificationAggregator::new(EventRegistry::new(), 5);
        agg.initialize("buyer-1");
        agg
    }

    struct CountingSound(AtomicUsize);

    impl NotificationSound for CountingSound {
        fn play(&self) -> std::io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::other("autoplay blocked"))
        }
    }

    #[test]
    fn own_messages_are_ignored() {
        let agg = aggregator();
        assert!(!agg.ingest(&inbound("m1", "buyer-1")));
        assert_eq!(agg.unread_count(), 0);
        assert!(agg.notifications().is_empty());
    }

    #[test]
    fn duplicates_neither_insert_nor_count() {
        let agg = aggregator();
        assert!(agg.ingest(&inbound("m1", "seller-9")));
        assert!(!agg.ingest(&inbound("m1", "seller-9")));
        assert_eq!(agg.unread_count(), 1);
        assert_eq!(agg.notifications().len(), 1);
    }

    #[test]
    fn history_is_bounded_newest_first() {
        let agg = aggregator();
        for i in 0..7 {
            agg.ingest(&inbound(&format!("m{i}"), "seller-9"));
        }
        let ids: Vec<String> = agg.notifications().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["m6", "m5", "m4", "m3", "m2"]);
        assert_eq!(agg.unread_count(), 7);
    }

    #[test]
    fn reset_and_clear_are_independent() {
        let agg = aggregator();
        agg.ingest(&inbound("m1", "seller-9"));
        agg.ingest(&inbound("m2", "seller-9"));

        agg.reset_unread_count();
        assert_eq!(agg.unread_count(), 0);
        assert_eq!(agg.notifications().len(), 2);

        agg.ingest(&inbound("m3", "seller-9"));
        agg.clear_notifications();
        assert!(agg.notifications().is_empty());
        assert_eq!(agg.unread_count(), 1);
    }

    #[test]
    fn initialize_twice_for_same_user_subscribes_once() {
        let registry = EventRegistry::new();
        let agg = NotificationAggregator::new(registry.clone(), 5);
        assert!(agg.initialize("buyer-1"));
        assert!(!agg.initialize("buyer-1"));
        assert_eq!(registry.listener_count(events::NEW_MESSAGE), 1);

        assert!(agg.initialize("seller-2"));
        assert_eq!(registry.listener_count(events::NEW_MESSAGE), 1);
    }

    #[test]
    fn dispatched_messages_reach_the_aggregator() {
        let registry = EventRegistry::new();
        let agg = NotificationAggregator::new(registry.clone(), 5);
        agg.initialize("buyer-1");
        registry.attach(1);

        let payload = serde_json::json!({
            "chatId": "chat-1",
            "message": {
                "id": "m1",
                "chatId": "chat-1",
                "senderId": "seller-9",
                "senderName": "Green Acres Poultry",
                "content": "Your crate of layers ships tomorrow",
                "createdAt": "2026-03-01T10:00:00Z",
                "status": "sent"
            }
        });
        registry.dispatch(1, events::NEW_MESSAGE, &payload);

        let items = agg.notifications();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].sender_name, "Green Acres Poultry");
        assert_eq!(items[0].snippet, "Your crate of layers ships tomorrow");
        assert_eq!(agg.unread_count(), 1);
    }

    #[test]
    fn sound_failures_are_swallowed() {
        let agg = aggregator();
        let sound = Arc::new(CountingSound(AtomicUsize::new(0)));
        agg.set_sound(sound.clone());

        assert!(agg.ingest(&inbound("m1", "seller-9")));
        assert_eq!(sound.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attachment_only_message_gets_placeholder_snippet() {
        let mut message = inbound("m1", "seller-9");
        message.content.clear();
        message.attachments.push(Attachment::new("https://cdn.example/egg.jpg"));
        let n = Notification::from_message(&message);
        assert_eq!(n.snippet, "Sent an attachment");
        assert_eq!(n.sender_name, "seller-9");
    }

    #[tokio::test]
    async fn unread_watch_sees_updates() {
        let agg = aggregator();
        let mut rx = agg.subscribe_unread();
        agg.ingest(&inbound("m1", "seller-9"));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}
