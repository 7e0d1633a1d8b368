// Defaults for configuration, loaded from the environment (or a .env file) at first use.

use std::env;

// Use lazy_static to initialize static variables safely.
lazy_static::lazy_static! {
    pub static ref OLLAMA_URL: String = env::var("OLLAMA_URL").unwrap_or_else(|_| "http://127.0.0.1:11434".to_string());
    pub static ref MINDFUL_CHAT_MODEL: String = env::var("MINDFUL_CHAT_MODEL").unwrap_or_else(|_| "gemma3:12b".to_string());
    pub static ref DATA_DIR: String = env::var("MINDFUL_CHAT_DATA_DIR").unwrap_or_else(|_| ".mindful-chat".to_string());
    pub static ref STORAGE_KEY: String = env::var("MINDFUL_CHAT_STORAGE_KEY").unwrap_or_else(|_| "mindfulChatMessages".to_string());
    pub static ref REQUEST_TIMEOUT_SECS: u64 = parse_or("MINDFUL_CHAT_TIMEOUT_SECS", 120);
    pub static ref SYNC_INTERVAL_MS: u64 = parse_or("MINDFUL_CHAT_SYNC_INTERVAL_MS", 1000);
    pub static ref TEMPLATES_DIR: String = env::var("MINDFUL_CHAT_TEMPLATES_DIR").unwrap_or_else(|_| "templates".to_string());
    pub static ref STATIC_DIR: String = env::var("MINDFUL_CHAT_STATIC_DIR").unwrap_or_else(|_| "static".to_string());
}

/// Notice shown to the user whenever feedback generation fails, whatever the cause.
pub const GENERIC_FEEDBACK_ERROR: &str =
    "Sorry, I encountered an error trying to respond. Please try again.";

/// Port the web UI listens on unless overridden.
pub const DEFAULT_PORT: u16 = 9900;

fn parse_or(var: &str, default: u64) -> u64 {
    env::var(var)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
