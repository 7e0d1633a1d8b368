// The chat controller: owns the session for one UI, sends it for feedback,
// and publishes every state change to whoever is watching (web socket tabs).

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use crate::constants::GENERIC_FEEDBACK_ERROR;
use crate::feedback::FeedbackClient;
use crate::message::{Message, Sender, Session};
use crate::store::{SessionStore, SubscriptionId};

/// What a UI renders: the messages, the "Thinking..." flag and the error notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSnapshot {
    pub messages: Session,
    pub pending: bool,
    pub error: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("a feedback request is already in progress")]
    Busy,
}

#[derive(Debug, Default)]
struct ChatState {
    pending: bool,
    error: Option<String>,
    // Bumped by clear() so a response that arrives afterwards is dropped.
    generation: u64,
}

pub struct ChatSession {
    store: Arc<SessionStore>,
    feedback: FeedbackClient,
    state: Arc<Mutex<ChatState>>,
    updates: broadcast::Sender<ChatSnapshot>,
    subscription: SubscriptionId,
}

fn lock(state: &Mutex<ChatState>) -> MutexGuard<'_, ChatState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn snapshot_of(messages: Session, state: &ChatState) -> ChatSnapshot {
    ChatSnapshot {
        messages,
        pending: state.pending,
        error: state.error.clone(),
    }
}

impl ChatSession {
    pub fn new(store: Arc<SessionStore>, feedback: FeedbackClient) -> Self {
        let state = Arc::new(Mutex::new(ChatState::default()));
        let (updates, _) = broadcast::channel(64);

        // The store has already replaced its session when this runs.
        let sync_state = state.clone();
        let sync_updates = updates.clone();
        let subscription = store.subscribe(move |messages| {
            let snapshot = snapshot_of(messages, &lock(&sync_state));
            let _ = sync_updates.send(snapshot);
        });

        Self {
            store,
            feedback,
            state,
            updates,
            subscription,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        let state = lock(&self.state);
        snapshot_of(self.store.current(), &state)
    }

    /// Receives a snapshot after every change, including external sync.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatSnapshot> {
        self.updates.subscribe()
    }

    fn publish(&self, snapshot: ChatSnapshot) -> ChatSnapshot {
        // No receivers is fine.
        let _ = self.updates.send(snapshot.clone());
        snapshot
    }

    /// Appends the user's message, asks for feedback and appends the reply.
    ///
    /// A feedback failure is not an `Err`: the returned snapshot carries the
    /// error notice and the session keeps the user's message.
    #[instrument(skip(self, text))]
    pub async fn send(&self, text: &str) -> Result<ChatSnapshot, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let (with_user, generation, pending_snapshot) = {
            let mut state = lock(&self.state);
            if state.pending {
                return Err(ChatError::Busy);
            }
            let with_user = self.store.update_session(|mut session| {
                let message = Message::new(&session, Sender::User, text);
                session.push(message);
                session
            });
            state.pending = true;
            state.error = None;
            let snapshot = snapshot_of(with_user.clone(), &state);
            (with_user, state.generation, snapshot)
        };
        self.publish(pending_snapshot);

        let result = self.feedback.provide_feedback(&with_user).await;

        let mut state = lock(&self.state);
        state.pending = false;
        if state.generation != generation {
            info!("Session cleared while waiting for feedback, dropping response");
            let snapshot = snapshot_of(self.store.current(), &state);
            drop(state);
            return Ok(self.publish(snapshot));
        }

        let messages = match result {
            Ok(feedback) => {
                let mut messages = with_user;
                let reply = Message::new(&messages, Sender::Ai, feedback);
                messages.push(reply);
                messages
            }
            Err(_) => {
                warn!("Feedback failed, keeping the user's message");
                state.error = Some(GENERIC_FEEDBACK_ERROR.to_string());
                with_user
            }
        };
        self.store.set_session(messages.clone());
        let snapshot = snapshot_of(messages, &state);
        drop(state);
        Ok(self.publish(snapshot))
    }

    /// Discards every message and the error notice.
    #[instrument(skip(self))]
    pub fn clear(&self) -> ChatSnapshot {
        let mut state = lock(&self.state);
        self.store.set_session(Session::new());
        state.error = None;
        state.generation += 1;
        let snapshot = snapshot_of(Session::new(), &state);
        drop(state);
        info!("Chat cleared");
        self.publish(snapshot)
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.store.unsubscribe(self.subscription);
    }
}
