use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::constants;
use crate::feedback::{FeedbackClient, OllamaCollaborator};
use crate::store::{FileSlotStorage, SessionStore};

/// Runtime settings, defaulted from the environment and overridden by CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    pub ollama_url: String,
    pub model: String,
    pub data_dir: PathBuf,
    pub storage_key: String,
    pub request_timeout: Duration,
    pub sync_interval: Duration,
    pub templates_dir: PathBuf,
    pub static_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ollama_url: constants::OLLAMA_URL.clone(),
            model: constants::MINDFUL_CHAT_MODEL.clone(),
            data_dir: PathBuf::from(constants::DATA_DIR.as_str()),
            storage_key: constants::STORAGE_KEY.clone(),
            request_timeout: Duration::from_secs(*constants::REQUEST_TIMEOUT_SECS),
            sync_interval: Duration::from_millis(*constants::SYNC_INTERVAL_MS),
            templates_dir: PathBuf::from(constants::TEMPLATES_DIR.as_str()),
            static_dir: PathBuf::from(constants::STATIC_DIR.as_str()),
        }
    }
}

impl Config {
    /// Opens the session slot under `data_dir`. Never fails: an unusable
    /// directory just means an empty, unpersisted session.
    pub fn open_store(&self) -> Arc<SessionStore> {
        let storage = FileSlotStorage::new(&self.data_dir);
        Arc::new(SessionStore::open(Arc::new(storage), self.storage_key.clone()))
    }

    pub fn feedback_client(&self) -> Result<FeedbackClient> {
        let collaborator =
            OllamaCollaborator::new(&self.ollama_url, self.model.clone(), self.request_timeout)
                .context("Failed to initialize Ollama client")?;
        Ok(FeedbackClient::new(Arc::new(collaborator)))
    }
}
