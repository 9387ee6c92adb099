//! Typing indicators, both directions.
//!
//! Outgoing: [`TypingCoordinator::notify_typing`] sends one typing-start per
//! burst of keystrokes and a typing-stop once the chat has been quiet for the
//! typing timeout. Each chat has its own stop timer.
//!
//! Incoming: `typing` events from other participants are folded into a
//! per-chat set readable with [`TypingCoordinator::typing_users`].

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::connection::{ConnectionManager, ConnectionState};
use crate::protocol::{events, TypingPayload};
use crate::registry::Subscription;

struct StopTimer {
    token: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Timers {
    by_chat: HashMap<String, StopTimer>,
    next_token: u64,
}

struct TypingInner {
    manager: ConnectionManager,
    timeout: Duration,
    timers: Mutex<Timers>,
    remote: Mutex<HashMap<String, BTreeSet<String>>>,
    subscription: Mutex<Option<Subscription>>,
}

impl TypingInner {
    fn emit(&self, chat_id: &str, is_typing: bool) -> bool {
        let Some(user_id) = self.manager.user_id() else {
            return false;
        };
        self.manager.emit(
            events::TYPING,
            &TypingPayload {
                chat_id: chat_id.to_string(),
                is_typing,
                user_id,
            },
        )
    }

    fn apply_remote(&self, payload: TypingPayload) {
        if self.manager.user_id().as_deref() == Some(payload.user_id.as_str()) {
            return;
        }
        let mut remote = self.remote.lock();
        if payload.is_typing {
            remote
                .entry(payload.chat_id)
                .or_default()
                .insert(payload.user_id);
        } else if let Some(users) = remote.get_mut(&payload.chat_id) {
            users.remove(&payload.user_id);
            if users.is_empty() {
                remote.remove(&payload.chat_id);
            }
        }
    }
}

impl Drop for TypingInner {
    fn drop(&mut self) {
        for (_, timer) in self.timers.get_mut().by_chat.drain() {
            timer.handle.abort();
        }
        if let Some(subscription) = self.subscription.get_mut().take() {
            subscription.unsubscribe();
        }
    }
}

/// Debounced typing-start/typing-stop emitter plus inbound typing tracker.
///
/// Must be created within a Tokio runtime.
#[derive(Clone)]
pub struct TypingCoordinator {
    inner: Arc<TypingInner>,
}

impl TypingCoordinator {
    /// Create a coordinator using the manager's configured typing timeout.
    pub fn new(manager: ConnectionManager) -> Self {
        let timeout = manager.config().typing_timeout;
        let inner = Arc::new(TypingInner {
            manager,
            timeout,
            timers: Mutex::new(Timers::default()),
            remote: Mutex::new(HashMap::new()),
            subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let subscription = inner
            .manager
            .registry()
            .on_typed::<TypingPayload, _>(events::TYPING, move |payload| {
                if let Some(inner) = weak.upgrade() {
                    inner.apply_remote(payload);
                }
            });
        *inner.subscription.lock() = Some(subscription);

        Self { inner }
    }

    /// Record a keystroke in `chat_id`.
    ///
    /// Sends typing-start if no burst is in progress for this chat, then
    /// restarts the chat's stop timer. Does nothing when not connected.
    /// Returns `true` if typing-start was sent by this call.
    pub fn notify_typing(&self, chat_id: &str) -> bool {
        if !self.inner.manager.is_connected() {
            return false;
        }

        let mut timers = self.inner.timers.lock();
        let burst_in_progress = match timers.by_chat.remove(chat_id) {
            Some(previous) => {
                previous.handle.abort();
                true
            }
            None => false,
        };

        let started = !burst_in_progress && self.inner.emit(chat_id, true);

        timers.next_token += 1;
        let token = timers.next_token;
        let handle = tokio::spawn(stop_after(
            Arc::downgrade(&self.inner),
            chat_id.to_string(),
            token,
            self.inner.timeout,
            self.inner.manager.subscribe_state(),
        ));
        timers
            .by_chat
            .insert(chat_id.to_string(), StopTimer { token, handle });
        started
    }

    /// End the burst in `chat_id` now. Returns `true` if typing-stop was sent.
    pub fn stop_typing(&self, chat_id: &str) -> bool {
        let pending = self.inner.timers.lock().by_chat.remove(chat_id);
        match pending {
            Some(timer) => {
                timer.handle.abort();
                self.inner.emit(chat_id, false)
            }
            None => false,
        }
    }

    /// Returns `true` while a stop timer is pending for `chat_id`.
    pub fn is_typing(&self, chat_id: &str) -> bool {
        self.inner.timers.lock().by_chat.contains_key(chat_id)
    }

    /// Other participants currently typing in `chat_id`, sorted by user id.
    pub fn typing_users(&self, chat_id: &str) -> Vec<String> {
        self.inner
            .remote
            .lock()
            .get(chat_id)
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for TypingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypingCoordinator")
            .field("timeout", &self.inner.timeout)
            .field("pending", &self.inner.timers.lock().by_chat.len())
            .finish()
    }
}

/// Stop timer for one burst. Sends typing-stop after `delay` unless it is
/// replaced, or the link leaves `Connected` first.
async fn stop_after(
    inner: Weak<TypingInner>,
    chat_id: String,
    token: u64,
    delay: Duration,
    mut state: watch::Receiver<ConnectionState>,
) {
    let link_lost = async {
        loop {
            let connected = *state.borrow_and_update() == ConnectionState::Connected;
            if !connected || state.changed().await.is_err() {
                return;
            }
        }
    };

    let expired = tokio::select! {
        () = tokio::time::sleep(delay) => true,
        () = link_lost => false,
    };

    let Some(inner) = inner.upgrade() else {
        return;
    };
    let ours = {
        let mut timers = inner.timers.lock();
        let matches = timers
            .by_chat
            .get(&chat_id)
            .is_some_and(|t| t.token == token);
        if matches {
            timers.by_chat.remove(&chat_id);
        }
        matches
    };

    if !ours {
        return;
    }
    if expired {
        let sent = inner.emit(&chat_id, false);
        debug!(chat_id = %chat_id, sent, "typing stopped after inactivity");
    } else {
        debug!(chat_id = %chat_id, "typing timer cancelled: link not connected");
    }
}
