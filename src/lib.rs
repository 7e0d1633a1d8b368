//! Mindful Chat: a supportive feedback chat.
//!
//! The conversation lives in a [`store::SessionStore`] that mirrors it into a
//! persisted slot and follows changes made by other processes. Each user
//! message sends the whole transcript through a [`feedback::FeedbackClient`]
//! and the reply is appended as an AI message by [`chat::ChatSession`].

pub mod chat;
pub mod config;
pub mod constants;
pub mod feedback;
pub mod message;
pub mod store;
pub mod transcript;
pub mod web_server;
